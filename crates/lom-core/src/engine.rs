//! Engine assembly and main loop.

use crate::cancel::AbortSignal;
use crate::collab::{ActionConfigSource, EventPublisher, GlobalConfigSource, SequenceHandler};
use crate::config::{EngineConfig, HeartbeatConfig, TransportConfig};
use crate::dispatcher::Dispatcher;
use crate::error::{EngineError, Result};
use crate::heartbeat;
use crate::mailbox::MailboxLimits;
use crate::registry::Registry;
use crate::transport::{self, TransportHandle, TransportServer};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Heartbeat interval source used when no global configuration is supplied.
#[derive(Debug, Clone, Copy)]
struct FixedInterval(Duration);

impl GlobalConfigSource for FixedInterval {
    fn heartbeat_interval(&self) -> Duration {
        self.0
    }
}

/// Builder for configuring an [`Engine`].
///
/// # Example
///
/// ```rust,ignore
/// use lom_core::{EngineBuilder, NoopSequence};
///
/// let (engine, handle) = EngineBuilder::new(config.clone(), Box::new(NoopSequence), publisher)
///     .global_config(config)
///     .build();
/// tokio::spawn(engine.run(abort.clone()));
/// ```
pub struct EngineBuilder {
    action_config: Arc<dyn ActionConfigSource>,
    global_config: Option<Arc<dyn GlobalConfigSource>>,
    sequence: Box<dyn SequenceHandler>,
    publisher: Arc<dyn EventPublisher>,
    mailbox_limits: MailboxLimits,
    inbound_capacity: usize,
    timeout_tick: Duration,
}

impl EngineBuilder {
    pub fn new(
        action_config: Arc<dyn ActionConfigSource>,
        sequence: Box<dyn SequenceHandler>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            action_config,
            global_config: None,
            sequence,
            publisher,
            mailbox_limits: MailboxLimits::default(),
            inbound_capacity: TransportConfig::INBOUND_QUEUE_CAPACITY,
            timeout_tick: EngineConfig::SEQUENCE_TIMEOUT_TICK,
        }
    }

    /// Source of the heartbeat interval.
    ///
    /// Default: a fixed [`HeartbeatConfig::DEFAULT_INTERVAL`]
    pub fn global_config(mut self, config: Arc<dyn GlobalConfigSource>) -> Self {
        self.global_config = Some(config);
        self
    }

    /// Per-client queue limits.
    pub fn mailbox_limits(mut self, limits: MailboxLimits) -> Self {
        self.mailbox_limits = limits;
        self
    }

    /// Capacity of the shared inbound request queue.
    ///
    /// Default: [`TransportConfig::INBOUND_QUEUE_CAPACITY`]
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity;
        self
    }

    /// How often the sequence handler gets a timeout tick.
    ///
    /// Default: [`EngineConfig::SEQUENCE_TIMEOUT_TICK`]
    pub fn timeout_tick(mut self, tick: Duration) -> Self {
        self.timeout_tick = tick;
        self
    }

    /// Build the engine and the handle clients submit through.
    ///
    /// Starts the heartbeat aggregator, so this must run inside a tokio runtime.
    pub fn build(self) -> (Engine, TransportHandle) {
        let global_config = self
            .global_config
            .unwrap_or_else(|| Arc::new(FixedInterval(HeartbeatConfig::DEFAULT_INTERVAL)));

        let heartbeat_abort = AbortSignal::new();
        let (notifier, heartbeat_task) =
            heartbeat::spawn(global_config, self.publisher, heartbeat_abort.clone());

        let registry = Registry::new(
            self.action_config,
            self.sequence,
            notifier,
            self.mailbox_limits,
        );
        let (handle, server) = transport::channel(self.inbound_capacity);

        let engine = Engine {
            dispatcher: Dispatcher::new(registry),
            server,
            heartbeat_abort,
            heartbeat_task,
            timeout_tick: self.timeout_tick.max(Duration::from_millis(1)),
        };
        (engine, handle)
    }
}

/// The fault-management core: one loop serving every client request.
#[derive(Debug)]
pub struct Engine {
    dispatcher: Dispatcher,
    server: TransportServer,
    heartbeat_abort: AbortSignal,
    heartbeat_task: JoinHandle<()>,
    timeout_tick: Duration,
}

impl Engine {
    /// Serve requests until `abort` fires or every handle is dropped.
    ///
    /// On exit every client is sent a shutdown request and deregistered,
    /// then the heartbeat aggregator is stopped.
    pub async fn run(self, abort: AbortSignal) -> Result<()> {
        let Engine {
            mut dispatcher,
            mut server,
            heartbeat_abort,
            heartbeat_task,
            timeout_tick,
        } = self;

        info!("Engine started");
        let mut ticker = tokio::time::interval(timeout_tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let outcome = loop {
            tokio::select! {
                biased;
                received = server.receive_next(&abort) => match received {
                    Ok(envelope) => dispatcher.dispatch(envelope),
                    Err(EngineError::Shutdown) => {
                        info!("Engine abort requested");
                        break Ok(());
                    }
                    Err(e) if e.is_transport() => {
                        info!("All request handles dropped, engine stopping");
                        break Ok(());
                    }
                    Err(e) => {
                        error!("Engine receive failed: {}", e);
                        break Err(e);
                    }
                },
                _ = ticker.tick() => {
                    debug!("Sequence timeout tick");
                    dispatcher.registry_mut().process_timeout();
                }
            }
        };

        let mut registry = dispatcher.into_registry();
        registry.shutdown();

        heartbeat_abort.abort();
        if let Err(e) = heartbeat_task.await {
            error!("Heartbeat task failed: {}", e);
        }

        info!("Engine stopped");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ActionConfig, NoopSequence};
    use crate::registry::ActionRegistration;
    use crate::types::{
        ActionRequest, ActionResponse, ClientRequest, EngineEvent, ErrorCode, ResponsePayload,
        ServerRequest,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct AllEnabled;

    impl ActionConfigSource for AllEnabled {
        fn action_config(&self, _action: &str) -> Option<ActionConfig> {
            Some(ActionConfig {
                timeout_secs: 30,
                disabled: false,
            })
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<EngineEvent>>);

    impl EventPublisher for Collect {
        fn publish(&self, event: EngineEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    /// Raises every registered action once and counts timeout ticks.
    #[derive(Default)]
    struct RaiseOnce {
        ticks: Arc<AtomicUsize>,
        results: Arc<Mutex<Vec<ActionResponse>>>,
    }

    impl SequenceHandler for RaiseOnce {
        fn raise_first_action(&mut self, registration: &ActionRegistration) -> Vec<ActionRequest> {
            vec![ActionRequest {
                action: registration.action.clone(),
                instance_id: "i-1".into(),
                timeout_secs: registration.timeout_secs,
                ..Default::default()
            }]
        }

        fn drop_request(&mut self, _action: &str) {}

        fn process_response(&mut self, response: ActionResponse) -> Vec<ActionRequest> {
            self.results.lock().unwrap().push(response);
            Vec::new()
        }

        fn process_timeout(&mut self) -> Vec<ActionRequest> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_pull_respond() {
        let sequence = RaiseOnce::default();
        let results = sequence.results.clone();
        let (engine, handle) =
            EngineBuilder::new(Arc::new(AllEnabled), Box::new(sequence), Arc::new(Collect::default()))
                .build();
        let abort = AbortSignal::new();
        let task = tokio::spawn(engine.run(abort.clone()));

        assert!(handle
            .submit(ClientRequest::register_client("c1"))
            .await
            .unwrap()
            .is_success());
        assert!(handle
            .submit(ClientRequest::register_action("c1", "a1", 0))
            .await
            .unwrap()
            .is_success());

        let resp = handle
            .submit(ClientRequest::recv_server_request("c1", 5))
            .await
            .unwrap();
        let ResponsePayload::ServerRequest(ServerRequest::Action(request)) = resp.payload else {
            panic!("expected action request, got {:?}", resp);
        };
        assert_eq!(request.action, "a1");
        assert_eq!(request.timeout_secs, 30);

        let result = ActionResponse {
            action: "a1".into(),
            instance_id: request.instance_id.clone(),
            ..Default::default()
        };
        assert!(handle
            .submit(ClientRequest::send_server_response("c1", result))
            .await
            .unwrap()
            .is_success());

        abort.abort();
        task.await.unwrap().unwrap();
        assert_eq!(results.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_ticks_reach_sequence() {
        let sequence = RaiseOnce::default();
        let ticks = sequence.ticks.clone();
        let (engine, _handle) =
            EngineBuilder::new(Arc::new(AllEnabled), Box::new(sequence), Arc::new(Collect::default()))
                .timeout_tick(Duration::from_secs(1))
                .build();
        let abort = AbortSignal::new();
        let task = tokio::spawn(engine.run(abort.clone()));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        abort.abort();
        task.await.unwrap().unwrap();
        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_sends_shutdown_to_waiting_client() {
        let (engine, handle) = EngineBuilder::new(
            Arc::new(AllEnabled),
            Box::new(NoopSequence),
            Arc::new(Collect::default()),
        )
        .build();
        let abort = AbortSignal::new();
        let task = tokio::spawn(engine.run(abort.clone()));

        handle
            .submit(ClientRequest::register_client("c1"))
            .await
            .unwrap();
        let pull = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .submit(ClientRequest::recv_server_request("c1", 0))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        abort.abort();
        task.await.unwrap().unwrap();

        let resp = pull.await.unwrap();
        assert_eq!(
            resp.payload,
            ResponsePayload::ServerRequest(ServerRequest::Shutdown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_pull_timeout_keeps_engine_running() {
        let (engine, handle) = EngineBuilder::new(
            Arc::new(AllEnabled),
            Box::new(NoopSequence),
            Arc::new(Collect::default()),
        )
        .build();
        let abort = AbortSignal::new();
        let task = tokio::spawn(engine.run(abort.clone()));

        handle
            .submit(ClientRequest::register_client("c1"))
            .await
            .unwrap();
        let pull = {
            let handle = handle.clone();
            tokio::spawn(async move {
                handle
                    .submit(ClientRequest::recv_server_request("c1", u64::MAX))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let next = handle
            .submit(ClientRequest::register_client("c2"))
            .await
            .unwrap();
        assert!(next.is_success());

        abort.abort();
        task.await.unwrap().unwrap();
        assert_eq!(
            pull.await.unwrap().payload,
            ResponsePayload::ServerRequest(ServerRequest::Shutdown)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handles_stops_engine() {
        let (engine, handle) = EngineBuilder::new(
            Arc::new(AllEnabled),
            Box::new(NoopSequence),
            Arc::new(Collect::default()),
        )
        .build();
        let task = tokio::spawn(engine.run(AbortSignal::new()));

        drop(handle);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_are_published() {
        struct Every10s;
        impl GlobalConfigSource for Every10s {
            fn heartbeat_interval(&self) -> Duration {
                Duration::from_secs(10)
            }
        }

        let publisher = Arc::new(Collect::default());
        let (engine, handle) =
            EngineBuilder::new(Arc::new(AllEnabled), Box::new(NoopSequence), publisher.clone())
                .global_config(Arc::new(Every10s))
                .build();
        let abort = AbortSignal::new();
        let task = tokio::spawn(engine.run(abort.clone()));

        handle
            .submit(ClientRequest::register_client("c1"))
            .await
            .unwrap();
        handle
            .submit(ClientRequest::register_action("c1", "a1", 0))
            .await
            .unwrap();
        handle
            .submit(ClientRequest::notify_heartbeat("c1", "a1", 1))
            .await
            .unwrap();
        let unknown = handle
            .submit(ClientRequest::notify_heartbeat("c1", "ghost", 1))
            .await
            .unwrap();
        assert!(unknown.is_success());

        tokio::time::sleep(Duration::from_secs(11)).await;
        abort.abort();
        task.await.unwrap().unwrap();

        let events = publisher.0.lock().unwrap();
        let EngineEvent::Heartbeat(batch) = &events[0] else {
            panic!("expected heartbeat, got {:?}", events[0]);
        };
        assert_eq!(batch.actions, vec!["a1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregistered_client_pull_fails() {
        let (engine, handle) = EngineBuilder::new(
            Arc::new(AllEnabled),
            Box::new(NoopSequence),
            Arc::new(Collect::default()),
        )
        .build();
        let abort = AbortSignal::new();
        let task = tokio::spawn(engine.run(abort.clone()));

        let resp = handle
            .submit(ClientRequest::recv_server_request("nobody", 1))
            .await
            .unwrap();
        assert_eq!(resp.error_code(), Some(ErrorCode::ReqFailed));

        abort.abort();
        task.await.unwrap().unwrap();
    }
}
