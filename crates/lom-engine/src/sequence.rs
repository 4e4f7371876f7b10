//! Single-action sequence handler for running the engine on its own.
//!
//! Every registered action is treated as a one-step sequence: it is raised
//! as soon as it registers, its result is published, and it is raised again.

use lom_core::{
    ActionRegistration, ActionRequest, ActionResponse, EngineEvent, EventPublisher,
    SequenceHandler,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct InFlight {
    instance_id: String,
    timeout_secs: u64,
}

pub struct StandaloneSequence {
    publisher: Arc<dyn EventPublisher>,
    in_flight: HashMap<String, InFlight>,
}

impl StandaloneSequence {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            publisher,
            in_flight: HashMap::new(),
        }
    }

    fn raise(&mut self, action: &str, timeout_secs: u64) -> ActionRequest {
        let instance_id = Uuid::new_v4().to_string();
        self.in_flight.insert(
            action.to_string(),
            InFlight {
                instance_id: instance_id.clone(),
                timeout_secs,
            },
        );
        debug!("Raising {} as instance {}", action, instance_id);

        ActionRequest {
            action: action.to_string(),
            anomaly_instance_id: instance_id.clone(),
            instance_id,
            anomaly_key: String::new(),
            timeout_secs,
            context: Vec::new(),
        }
    }
}

impl SequenceHandler for StandaloneSequence {
    fn raise_first_action(&mut self, registration: &ActionRegistration) -> Vec<ActionRequest> {
        vec![self.raise(&registration.action, registration.timeout_secs)]
    }

    fn drop_request(&mut self, action: &str) {
        if self.in_flight.remove(action).is_some() {
            info!("Dropped in-flight request for {}", action);
        }
    }

    fn process_response(&mut self, response: ActionResponse) -> Vec<ActionRequest> {
        let Some(current) = self.in_flight.get(&response.action).cloned() else {
            warn!("Response for untracked action {}", response.action);
            return Vec::new();
        };
        if current.instance_id != response.instance_id {
            warn!(
                "Stale response for {}: instance {} (current {})",
                response.action, response.instance_id, current.instance_id
            );
            return Vec::new();
        }

        let action = response.action.clone();
        self.publisher.publish(EngineEvent::ActionResult(response));
        vec![self.raise(&action, current.timeout_secs)]
    }

    fn process_timeout(&mut self) -> Vec<ActionRequest> {
        Vec::new()
    }
}
