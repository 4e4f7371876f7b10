//! Client and action registry.
//!
//! The registry owns the map of live mailboxes and the map of action
//! registrations. It is driven exclusively by the engine main loop, so it
//! takes `&mut self` everywhere and holds no locks. Nothing inside it is
//! ever handed out by reference across that boundary: reads return clones.

use crate::collab::{ActionConfigSource, SequenceHandler};
use crate::error::{EngineError, Result};
use crate::heartbeat::HeartbeatNotifier;
use crate::mailbox::{Mailbox, MailboxLimits};
use crate::transport::ReplySlot;
use crate::types::{ActionRequest, ActionResponse, ClientRequest, ClientResponse, ServerRequest};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A live action registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionRegistration {
    pub action: String,
    pub client: String,
    /// Effective timeout: the requested one, or the configured default.
    pub timeout_secs: u64,
}

/// Registered clients and the actions they own.
pub struct Registry {
    clients: HashMap<String, Mailbox>,
    actions: HashMap<String, ActionRegistration>,
    action_config: Arc<dyn ActionConfigSource>,
    sequence: Box<dyn SequenceHandler>,
    heartbeat: HeartbeatNotifier,
    limits: MailboxLimits,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("clients", &self.clients.keys().collect::<Vec<_>>())
            .field("actions", &self.actions)
            .finish()
    }
}

impl Registry {
    pub fn new(
        action_config: Arc<dyn ActionConfigSource>,
        sequence: Box<dyn SequenceHandler>,
        heartbeat: HeartbeatNotifier,
        limits: MailboxLimits,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            actions: HashMap::new(),
            action_config,
            sequence,
            heartbeat,
            limits,
        }
    }

    /// Register a client, replacing any previous registration of the same name.
    pub fn register_client(&mut self, client: &str) -> Result<()> {
        if client.is_empty() {
            return Err(EngineError::EmptyName { field: "client" });
        }

        if self.clients.contains_key(client) {
            warn!("Client {} registered again, dropping the previous registration", client);
            self.deregister_client(client);
        }

        self.clients
            .insert(client.to_string(), Mailbox::spawn(client, self.limits));
        info!("Registered client {}", client);
        Ok(())
    }

    /// Remove a client and every action it owns. Unknown names are ignored.
    pub fn deregister_client(&mut self, client: &str) {
        // Unlink the mailbox first so the per-action cleanup below sees
        // the client as already gone.
        let Some(mailbox) = self.clients.remove(client) else {
            debug!("Deregister of unknown client {} ignored", client);
            return;
        };

        for action in mailbox.actions() {
            self.remove_action(client, &action);
        }
        mailbox.abort();
        info!("Deregistered client {}", client);
    }

    /// Register `action` under `client`.
    ///
    /// A zero `timeout_secs` takes the configured default. Another client
    /// owning the same action loses it.
    pub fn register_action(
        &mut self,
        client: &str,
        action: &str,
        timeout_secs: u64,
    ) -> Result<ActionRegistration> {
        if action.is_empty() {
            return Err(EngineError::EmptyName { field: "action" });
        }
        if !self.clients.contains_key(client) {
            return Err(EngineError::ClientNotRegistered {
                client: client.to_string(),
            });
        }

        if let Some(existing) = self.actions.get(action) {
            if existing.client != client {
                warn!(
                    "Action {} moves from client {} to {}",
                    action, existing.client, client
                );
                let previous = existing.client.clone();
                self.deregister_action(&previous, action);
            }
        }

        let config = self
            .action_config
            .action_config(action)
            .ok_or_else(|| EngineError::ActionNotConfigured {
                action: action.to_string(),
            })?;
        if config.disabled {
            return Err(EngineError::ActionDisabled {
                action: action.to_string(),
            });
        }

        let registration = ActionRegistration {
            action: action.to_string(),
            client: client.to_string(),
            timeout_secs: if timeout_secs == 0 {
                config.timeout_secs
            } else {
                timeout_secs
            },
        };

        if let Some(mailbox) = self.clients.get_mut(client) {
            mailbox.add_action(action);
        }
        self.actions.insert(action.to_string(), registration.clone());
        info!(
            "Registered action {} for client {} (timeout {}s)",
            action, client, registration.timeout_secs
        );

        let follow_ups = self.sequence.raise_first_action(&registration);
        self.push_follow_ups(follow_ups);

        Ok(registration)
    }

    /// Drop an action registration.
    ///
    /// An empty `client` matches any owner; a non-matching owner is a no-op.
    pub fn deregister_action(&mut self, client: &str, action: &str) {
        let Some(existing) = self.actions.get(action) else {
            debug!("Deregister of unknown action {} ignored", action);
            return;
        };
        if !client.is_empty() && existing.client != client {
            warn!(
                "Client {} cannot deregister action {} owned by {}",
                client, action, existing.client
            );
            return;
        }

        let owner = existing.client.clone();
        self.remove_action(&owner, action);
    }

    fn remove_action(&mut self, owner: &str, action: &str) {
        if self.actions.remove(action).is_none() {
            return;
        }
        if let Some(mailbox) = self.clients.get_mut(owner) {
            mailbox.remove_action(action);
        }
        self.sequence.drop_request(action);
        info!("Deregistered action {} of client {}", action, owner);
    }

    /// Copy of the registration of `action`, if any.
    pub fn get_active_action_info(&self, action: &str) -> Option<ActionRegistration> {
        self.actions.get(action).cloned()
    }

    /// Forward a heartbeat for a registered action to the aggregator.
    pub fn notify_heartbeat(&self, action: &str, timestamp: i64) -> Result<()> {
        if !self.actions.contains_key(action) {
            debug!("Heartbeat for unregistered action {} at {} ignored", action, timestamp);
            return Ok(());
        }
        self.heartbeat.notify(action)
    }

    /// Park a pull request in the client's mailbox.
    ///
    /// On error the caller has already been answered.
    pub fn enqueue_pull(&self, request: ClientRequest, reply: ReplySlot) -> Result<()> {
        match self.clients.get(&request.client_name) {
            Some(mailbox) => mailbox.enqueue_pull(request, reply),
            None => {
                let err = EngineError::ClientNotRegistered {
                    client: request.client_name.clone(),
                };
                let _ = reply.send(ClientResponse::from_error(&err));
                Err(err)
            }
        }
    }

    /// Queue a work item for a client.
    pub fn send_server_request(&self, client: &str, request: ServerRequest) -> Result<()> {
        let mailbox = self
            .clients
            .get(client)
            .ok_or_else(|| EngineError::ClientNotRegistered {
                client: client.to_string(),
            })?;
        mailbox.enqueue_push(request)
    }

    /// Queue an action request for whichever client owns the action.
    pub fn send_action_request(&self, request: ActionRequest) -> Result<()> {
        let owner = match self.actions.get(&request.action) {
            Some(registration) => registration.client.clone(),
            None => {
                return Err(EngineError::ActionNotRegistered {
                    action: request.action,
                })
            }
        };

        if !self.clients.contains_key(&owner) {
            error!(
                "Internal error: action {} owned by {} which has no mailbox",
                request.action, owner
            );
            return Err(EngineError::Internal {
                message: format!("action {} owned by unregistered client {}", request.action, owner),
            });
        }

        self.send_server_request(&owner, ServerRequest::Action(request))
    }

    /// Hand a client's action result to the sequence handler.
    pub fn process_response(&mut self, response: ActionResponse) {
        debug!(
            "Result for action {} instance {}: {}",
            response.action, response.instance_id, response.result_code
        );
        let follow_ups = self.sequence.process_response(response);
        self.push_follow_ups(follow_ups);
    }

    /// Give the sequence handler a chance to enforce its deadlines.
    pub fn process_timeout(&mut self) {
        let follow_ups = self.sequence.process_timeout();
        self.push_follow_ups(follow_ups);
    }

    fn push_follow_ups(&self, requests: Vec<ActionRequest>) {
        for request in requests {
            let action = request.action.clone();
            if let Err(e) = self.send_action_request(request) {
                warn!("Failed to queue request for action {}: {}", action, e);
            }
        }
    }

    /// Tell every client to shut down, then drop all registrations.
    pub fn shutdown(&mut self) {
        for client in self.client_names() {
            if let Err(e) = self.send_server_request(&client, ServerRequest::Shutdown) {
                warn!("Failed to send shutdown to {}: {}", client, e);
            }
            self.deregister_client(&client);
        }
    }

    /// Names of the registered clients, sorted.
    pub fn client_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.clients.keys().cloned().collect();
        names.sort();
        names
    }

    /// Actions owned by `client`, sorted.
    pub fn client_actions(&self, client: &str) -> Option<Vec<String>> {
        self.clients.get(client).map(Mailbox::actions)
    }

    pub fn is_client_registered(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::AbortSignal;
    use crate::collab::{ActionConfig, EventPublisher, GlobalConfigSource};
    use crate::transport::Envelope;
    use crate::types::{EngineEvent, ErrorCode, ResponsePayload};
    use std::sync::Mutex;
    use std::time::Duration;

    struct Actions(HashMap<String, ActionConfig>);

    impl ActionConfigSource for Actions {
        fn action_config(&self, action: &str) -> Option<ActionConfig> {
            self.0.get(action).cloned()
        }
    }

    struct Quiet;

    impl EventPublisher for Quiet {
        fn publish(&self, _event: EngineEvent) {}
    }

    impl GlobalConfigSource for Quiet {
        fn heartbeat_interval(&self) -> Duration {
            Duration::from_secs(3600)
        }
    }

    /// Records callbacks and asks for one request per raised action.
    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl SequenceHandler for Recorder {
        fn raise_first_action(&mut self, registration: &ActionRegistration) -> Vec<ActionRequest> {
            self.0
                .lock()
                .unwrap()
                .push(format!("raise:{}", registration.action));
            vec![ActionRequest {
                action: registration.action.clone(),
                timeout_secs: registration.timeout_secs,
                ..Default::default()
            }]
        }

        fn drop_request(&mut self, action: &str) {
            self.0.lock().unwrap().push(format!("drop:{}", action));
        }

        fn process_response(&mut self, response: ActionResponse) -> Vec<ActionRequest> {
            self.0
                .lock()
                .unwrap()
                .push(format!("response:{}", response.action));
            Vec::new()
        }

        fn process_timeout(&mut self) -> Vec<ActionRequest> {
            Vec::new()
        }
    }

    fn registry_with(recorder: Recorder) -> Registry {
        let mut actions = HashMap::new();
        actions.insert("a1".to_string(), ActionConfig { timeout_secs: 15, disabled: false });
        actions.insert("a2".to_string(), ActionConfig { timeout_secs: 0, disabled: false });
        actions.insert("off".to_string(), ActionConfig { timeout_secs: 5, disabled: true });

        let (heartbeat, _task) =
            crate::heartbeat::spawn(Arc::new(Quiet), Arc::new(Quiet), AbortSignal::new());
        Registry::new(
            Arc::new(Actions(actions)),
            Box::new(recorder),
            heartbeat,
            MailboxLimits::default(),
        )
    }

    fn registry() -> Registry {
        registry_with(Recorder::default())
    }

    /// Registry whose sequence handler never raises work on its own.
    fn quiet_registry() -> Registry {
        let mut actions = HashMap::new();
        actions.insert("A1".to_string(), ActionConfig::default());
        let (heartbeat, _task) =
            crate::heartbeat::spawn(Arc::new(Quiet), Arc::new(Quiet), AbortSignal::new());
        Registry::new(
            Arc::new(Actions(actions)),
            Box::new(crate::collab::NoopSequence),
            heartbeat,
            MailboxLimits::default(),
        )
    }

    #[tokio::test]
    async fn test_same_owner_reregistration_and_push_to_waiting_pull() {
        let mut reg = quiet_registry();
        reg.register_client("C1").unwrap();
        reg.register_action("C1", "A1", 0).unwrap();
        reg.register_action("C1", "A1", 0).unwrap();
        assert_eq!(reg.client_actions("C1"), Some(vec!["A1".to_string()]));

        let (envelope, rx) = Envelope::new(ClientRequest::recv_server_request("C1", 0));
        reg.enqueue_pull(envelope.request, envelope.reply).unwrap();
        tokio::task::yield_now().await;

        let owner = reg.get_active_action_info("A1").unwrap().client;
        reg.send_server_request(&owner, ServerRequest::Shutdown)
            .unwrap();
        assert_eq!(
            rx.await.unwrap().payload,
            ResponsePayload::ServerRequest(ServerRequest::Shutdown)
        );

        reg.deregister_client("C1");
        assert!(reg.get_active_action_info("A1").is_none());
    }

    #[tokio::test]
    async fn test_register_client_rejects_empty_name() {
        let mut reg = registry();
        assert!(matches!(
            reg.register_client(""),
            Err(EngineError::EmptyName { field: "client" })
        ));
    }

    #[tokio::test]
    async fn test_register_action_requires_client() {
        let mut reg = registry();
        let err = reg.register_action("ghost", "a1", 0).unwrap_err();
        assert!(matches!(err, EngineError::ClientNotRegistered { .. }));
        assert!(reg.get_active_action_info("a1").is_none());
    }

    #[tokio::test]
    async fn test_register_action_uses_config_default_timeout() {
        let mut reg = registry();
        reg.register_client("c1").unwrap();

        let defaulted = reg.register_action("c1", "a1", 0).unwrap();
        assert_eq!(defaulted.timeout_secs, 15);

        let explicit = reg.register_action("c1", "a1", 40).unwrap();
        assert_eq!(explicit.timeout_secs, 40);
        assert_eq!(reg.get_active_action_info("a1"), Some(explicit));
    }

    #[tokio::test]
    async fn test_disabled_and_unconfigured_actions_fail() {
        let mut reg = registry();
        reg.register_client("c1").unwrap();

        let err = reg.register_action("c1", "off", 0).unwrap_err();
        assert!(matches!(err, EngineError::ActionDisabled { .. }));
        assert!(err.to_string().contains("disabled"));
        assert!(reg.get_active_action_info("off").is_none());

        let err = reg.register_action("c1", "nope", 0).unwrap_err();
        assert!(matches!(err, EngineError::ActionNotConfigured { .. }));
        assert_eq!(reg.client_actions("c1"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_new_owner_evicts_previous_owner() {
        let recorder = Recorder::default();
        let mut reg = registry_with(recorder.clone());
        reg.register_client("c1").unwrap();
        reg.register_client("c2").unwrap();

        reg.register_action("c1", "a1", 0).unwrap();
        reg.register_action("c2", "a1", 0).unwrap();

        assert_eq!(reg.get_active_action_info("a1").unwrap().client, "c2");
        assert_eq!(reg.client_actions("c1"), Some(Vec::new()));
        assert_eq!(reg.client_actions("c2"), Some(vec!["a1".to_string()]));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec!["raise:a1", "drop:a1", "raise:a1"]
        );
    }

    #[tokio::test]
    async fn test_deregister_action_owner_mismatch_is_noop() {
        let mut reg = registry();
        reg.register_client("c1").unwrap();
        reg.register_action("c1", "a1", 0).unwrap();

        reg.deregister_action("c2", "a1");
        assert!(reg.get_active_action_info("a1").is_some());

        reg.deregister_action("", "a1");
        assert!(reg.get_active_action_info("a1").is_none());
    }

    #[tokio::test]
    async fn test_deregister_client_cascades() {
        let recorder = Recorder::default();
        let mut reg = registry_with(recorder.clone());
        reg.register_client("c1").unwrap();
        reg.register_action("c1", "a1", 0).unwrap();
        reg.register_action("c1", "a2", 0).unwrap();

        reg.deregister_client("c1");
        assert!(!reg.is_client_registered("c1"));
        assert!(reg.get_active_action_info("a1").is_none());
        assert!(reg.get_active_action_info("a2").is_none());
        let calls = recorder.0.lock().unwrap();
        assert!(calls.contains(&"drop:a1".to_string()));
        assert!(calls.contains(&"drop:a2".to_string()));

        drop(calls);
        reg.deregister_client("never-registered");
    }

    #[tokio::test]
    async fn test_reregister_client_drops_old_actions() {
        let mut reg = registry();
        reg.register_client("c1").unwrap();
        reg.register_action("c1", "a1", 0).unwrap();

        reg.register_client("c1").unwrap();
        assert!(reg.is_client_registered("c1"));
        assert!(reg.get_active_action_info("a1").is_none());
    }

    #[tokio::test]
    async fn test_raised_action_is_pushed_to_owner() {
        let mut reg = registry();
        reg.register_client("c1").unwrap();
        reg.register_action("c1", "a1", 0).unwrap();

        let (envelope, rx) = Envelope::new(ClientRequest::recv_server_request("c1", 0));
        reg.enqueue_pull(envelope.request, envelope.reply).unwrap();

        let resp = rx.await.unwrap();
        match resp.payload {
            ResponsePayload::ServerRequest(ServerRequest::Action(req)) => {
                assert_eq!(req.action, "a1");
                assert_eq!(req.timeout_secs, 15);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pull_for_unknown_client_is_answered() {
        let reg = registry();
        let (envelope, rx) = Envelope::new(ClientRequest::recv_server_request("ghost", 0));
        assert!(reg.enqueue_pull(envelope.request, envelope.reply).is_err());
        assert_eq!(rx.await.unwrap().error_code(), Some(ErrorCode::ReqFailed));
    }

    #[tokio::test]
    async fn test_send_action_request_for_unknown_action() {
        let reg = registry();
        let err = reg
            .send_action_request(ActionRequest {
                action: "a1".into(),
                ..Default::default()
            })
            .unwrap_err();
        assert_eq!(err.result_code(), ErrorCode::ActionNotRegistered);
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_action_is_noop() {
        let mut reg = registry();
        assert!(reg.notify_heartbeat("a1", 100).is_ok());

        reg.register_client("c1").unwrap();
        reg.register_action("c1", "a1", 0).unwrap();
        assert!(reg.notify_heartbeat("a1", 101).is_ok());
    }

    #[tokio::test]
    async fn test_process_response_reaches_sequence() {
        let recorder = Recorder::default();
        let mut reg = registry_with(recorder.clone());
        reg.process_response(ActionResponse {
            action: "a1".into(),
            ..Default::default()
        });
        assert_eq!(*recorder.0.lock().unwrap(), vec!["response:a1"]);
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let mut reg = registry();
        reg.register_client("c1").unwrap();
        reg.register_client("c2").unwrap();
        reg.register_action("c2", "a2", 0).unwrap();

        reg.shutdown();
        assert!(reg.client_names().is_empty());
        assert!(reg.get_active_action_info("a2").is_none());
    }
}
