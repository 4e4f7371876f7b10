//! In-process request multiplexer.
//!
//! Any number of producers (network connection tasks, tests, embedded
//! clients) share one bounded inbound queue. Each request travels with its
//! own single-use [`ReplySlot`], so replies need no correlation ids: whoever
//! ends up holding the slot answers exactly once.

use crate::cancel::{AbortSignal, AbortedError};
use crate::error::{EngineError, Result};
use crate::types::{ClientRequest, ClientResponse};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Single-use reply channel for one request.
#[derive(Debug)]
pub struct ReplySlot {
    tx: oneshot::Sender<ClientResponse>,
}

impl ReplySlot {
    /// Fill the slot. Hands the response back if the requester has gone away.
    pub fn send(self, response: ClientResponse) -> std::result::Result<(), ClientResponse> {
        self.tx.send(response)
    }

    /// True once the requester has stopped waiting.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A request together with the slot its reply must be written to.
#[derive(Debug)]
pub struct Envelope {
    pub request: ClientRequest,
    pub reply: ReplySlot,
}

impl Envelope {
    /// Create an envelope and the receiver its reply will arrive on.
    pub fn new(request: ClientRequest) -> (Self, oneshot::Receiver<ClientResponse>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                request,
                reply: ReplySlot { tx },
            },
            rx,
        )
    }
}

/// Create a connected handle/server pair with the given queue capacity.
pub fn channel(capacity: usize) -> (TransportHandle, TransportServer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        TransportHandle { tx, capacity },
        TransportServer { rx },
    )
}

/// Client side of the multiplexer. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    tx: mpsc::Sender<Envelope>,
    capacity: usize,
}

impl TransportHandle {
    /// Submit a request and wait for its reply.
    ///
    /// Fails without blocking when the inbound queue is full.
    pub async fn submit(&self, request: ClientRequest) -> Result<ClientResponse> {
        let (envelope, rx) = Envelope::new(request);

        self.tx.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::QueueFull {
                queue: "inbound",
                capacity: self.capacity,
            },
            mpsc::error::TrySendError::Closed(_) => EngineError::transport("engine is not running"),
        })?;

        rx.await
            .map_err(|_| EngineError::transport("reply slot dropped without a response"))
    }
}

/// Server side of the multiplexer, owned by the engine main loop.
#[derive(Debug)]
pub struct TransportServer {
    rx: mpsc::Receiver<Envelope>,
}

impl TransportServer {
    /// Wait for the next request or the abort signal, whichever comes first.
    pub async fn receive_next(&mut self, abort: &AbortSignal) -> Result<Envelope> {
        tokio::select! {
            biased;
            _ = abort.aborted() => {
                debug!("Transport receive aborted");
                Err(AbortedError.into())
            }
            envelope = self.rx.recv() => {
                envelope.ok_or_else(|| EngineError::transport("inbound queue closed"))
            }
        }
    }
}
