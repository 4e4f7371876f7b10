//! Interfaces of the collaborators the core consumes but does not implement.
//!
//! The sequence handler is a pure decision engine: instead of calling back
//! into the registry it returns the action requests it wants issued, and
//! the registry pushes them to the owning clients.

use crate::registry::ActionRegistration;
use crate::types::{ActionRequest, ActionResponse, EngineEvent};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-action settings from the action configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Default timeout applied when a client registers with timeout 0.
    #[serde(default, rename = "timeout")]
    pub timeout_secs: u64,
    #[serde(default, rename = "disable")]
    pub disabled: bool,
}

/// Lookup of per-action configuration.
pub trait ActionConfigSource: Send + Sync {
    fn action_config(&self, action: &str) -> Option<ActionConfig>;
}

/// Engine-wide settings that may change while running.
pub trait GlobalConfigSource: Send + Sync {
    /// Interval between heartbeat batches. Read on every tick.
    fn heartbeat_interval(&self) -> Duration;
}

/// Workflow engine deciding which action runs next.
pub trait SequenceHandler: Send {
    /// A newly registered action may start a sequence.
    fn raise_first_action(&mut self, registration: &ActionRegistration) -> Vec<ActionRequest>;

    /// In-flight work for `action` must be dropped.
    fn drop_request(&mut self, action: &str);

    /// A client reported the result of an action run.
    fn process_response(&mut self, response: ActionResponse) -> Vec<ActionRequest>;

    /// Periodic tick for sequence-level deadlines.
    fn process_timeout(&mut self) -> Vec<ActionRequest>;
}

/// Sink for heartbeat batches and action results.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Sequence handler that never issues work.
#[derive(Debug, Default)]
pub struct NoopSequence;

impl SequenceHandler for NoopSequence {
    fn raise_first_action(&mut self, _registration: &ActionRegistration) -> Vec<ActionRequest> {
        Vec::new()
    }

    fn drop_request(&mut self, _action: &str) {}

    fn process_response(&mut self, _response: ActionResponse) -> Vec<ActionRequest> {
        Vec::new()
    }

    fn process_timeout(&mut self) -> Vec<ActionRequest> {
        Vec::new()
    }
}
