//! Event sink that writes each engine event to the log as one JSON line.

use lom_core::{EngineEvent, EventPublisher};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

impl LogPublisher {
    fn encode(event: &EngineEvent) -> serde_json::Result<String> {
        serde_json::to_string(event)
    }
}

impl EventPublisher for LogPublisher {
    fn publish(&self, event: EngineEvent) {
        match Self::encode(&event) {
            Ok(line) => info!("event {}", line),
            Err(e) => warn!("Failed to encode event {:?}: {}", event, e),
        }
    }
}
