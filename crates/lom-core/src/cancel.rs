//! Awaitable abort signal shared between an owner and its worker tasks.
//!
//! The engine main loop, every mailbox task and the listeners each wait on
//! an `AbortSignal` next to their real work in `tokio::select!`. Firing it is
//! fire-and-forget: the caller never waits for the worker to wind down.

use std::sync::Arc;
use tokio::sync::watch;

/// A cloneable abort signal.
///
/// When `abort()` is called on any clone, every clone observes it, including
/// tasks currently suspended in [`AbortSignal::aborted`].
///
/// # Example
///
/// ```
/// use lom_core::cancel::AbortSignal;
///
/// let signal = AbortSignal::new();
/// let worker_copy = signal.clone();
///
/// signal.abort();
/// assert!(worker_copy.is_aborted());
/// ```
#[derive(Debug, Clone)]
pub struct AbortSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortSignal {
    /// Create a new, un-fired signal.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    /// Check whether the signal has fired.
    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires. Returns immediately if it already has.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so `wait_for` cannot observe a closed channel.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

/// Error returned when an operation is abandoned because of an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortedError;

impl std::fmt::Display for AbortedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Operation was aborted")
    }
}

impl std::error::Error for AbortedError {}

impl From<AbortedError> for crate::error::EngineError {
    fn from(_: AbortedError) -> Self {
        crate::error::EngineError::Shutdown
    }
}
