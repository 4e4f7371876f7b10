//! Heartbeat aggregation.
//!
//! Actions report liveness individually and often; downstream consumers only
//! need to know which actions were alive during each period. One task
//! collects action names into a set and publishes the set once per interval.

use crate::cancel::AbortSignal;
use crate::collab::{EventPublisher, GlobalConfigSource};
use crate::config::HeartbeatConfig;
use crate::error::{EngineError, Result};
use crate::types::{EngineEvent, HeartbeatBatch};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// Sending side used by the registry.
#[derive(Debug, Clone)]
pub struct HeartbeatNotifier {
    tx: mpsc::Sender<String>,
}

impl HeartbeatNotifier {
    /// Record that `action` is alive. Never blocks.
    pub fn notify(&self, action: &str) -> Result<()> {
        self.tx.try_send(action.to_string()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EngineError::QueueFull {
                queue: "heartbeat",
                capacity: HeartbeatConfig::QUEUE_CAPACITY,
            },
            mpsc::error::TrySendError::Closed(_) => EngineError::Shutdown,
        })
    }
}

/// Spawn the aggregator task.
pub fn spawn(
    config: Arc<dyn GlobalConfigSource>,
    publisher: Arc<dyn EventPublisher>,
    abort: AbortSignal,
) -> (HeartbeatNotifier, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(HeartbeatConfig::QUEUE_CAPACITY);
    let task = tokio::spawn(run(rx, config, publisher, abort));
    (HeartbeatNotifier { tx }, task)
}

fn current_interval(config: &dyn GlobalConfigSource) -> Duration {
    config
        .heartbeat_interval()
        .clamp(HeartbeatConfig::MIN_INTERVAL, HeartbeatConfig::MAX_INTERVAL)
}

async fn run(
    mut rx: mpsc::Receiver<String>,
    config: Arc<dyn GlobalConfigSource>,
    publisher: Arc<dyn EventPublisher>,
    abort: AbortSignal,
) {
    let mut pending = BTreeSet::new();
    let mut interval = current_interval(config.as_ref());
    let mut next_tick = Instant::now() + interval;
    info!("Heartbeat aggregator started, interval {:?}", interval);

    loop {
        tokio::select! {
            biased;
            _ = abort.aborted() => break,
            action = rx.recv() => match action {
                Some(action) => {
                    pending.insert(action);
                }
                None => break,
            },
            _ = tokio::time::sleep_until(next_tick) => {
                let batch = HeartbeatBatch {
                    actions: std::mem::take(&mut pending).into_iter().collect(),
                    timestamp: chrono::Utc::now().timestamp(),
                };
                debug!("Publishing heartbeat for {} action(s)", batch.actions.len());
                publisher.publish(EngineEvent::Heartbeat(batch));

                let latest = current_interval(config.as_ref());
                if latest != interval {
                    info!("Heartbeat interval changed from {:?} to {:?}", interval, latest);
                    interval = latest;
                }
                next_tick = Instant::now() + interval;
            }
        }
    }

    debug!("Heartbeat aggregator stopped");
}
