//! Maps each client request onto exactly one registry operation.

use crate::error::EngineError;
use crate::registry::Registry;
use crate::transport::{Envelope, ReplySlot};
use crate::types::{ActionResponse, ClientRequest, ClientResponse, RequestKind, RequestPayload};
use tracing::{debug, warn};

/// How a request completes.
#[derive(Debug)]
pub enum Completion {
    /// Answer now.
    Reply(ReplySlot, ClientResponse),
    /// Answer now, then hand the result to the sequence handler.
    ReplyThen(ReplySlot, ClientResponse, ActionResponse),
    /// The reply slot moved into a mailbox, which answers later.
    Deferred,
}

/// Request dispatcher. Owns the registry it drives.
#[derive(Debug)]
pub struct Dispatcher {
    registry: Registry,
}

impl Dispatcher {
    pub fn new(registry: Registry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn into_registry(self) -> Registry {
        self.registry
    }

    /// Process one envelope to completion (or deferral).
    pub fn dispatch(&mut self, envelope: Envelope) {
        let Envelope { request, reply } = envelope;
        let kind = request.kind;
        let client = request.client_name.clone();

        match self.process(request, reply) {
            Completion::Reply(reply, response) => {
                if reply.send(response).is_err() {
                    debug!("{} reply to {} dropped, caller gone", kind, client);
                }
            }
            Completion::ReplyThen(reply, response, result) => {
                if reply.send(response).is_err() {
                    debug!("{} reply to {} dropped, caller gone", kind, client);
                }
                self.registry.process_response(result);
            }
            Completion::Deferred => {}
        }
    }

    /// Decide how `request` completes.
    pub fn process(&mut self, request: ClientRequest, reply: ReplySlot) -> Completion {
        debug!("{} from {}", request.kind, request.client_name);
        let ClientRequest {
            kind,
            client_name,
            timeout_secs,
            payload,
        } = request;
        let client = client_name.as_str();

        let result = match (kind, payload) {
            (RequestKind::RegisterClient, RequestPayload::Empty) => {
                self.registry.register_client(client)
            }
            (RequestKind::DeregisterClient, RequestPayload::Empty) => {
                self.registry.deregister_client(client);
                Ok(())
            }
            (RequestKind::RegisterAction, RequestPayload::Action(name)) => self
                .registry
                .register_action(client, &name.action, timeout_secs)
                .map(|_| ()),
            (RequestKind::DeregisterAction, RequestPayload::Action(name)) => {
                self.registry.deregister_action(client, &name.action);
                Ok(())
            }
            (RequestKind::NotifyActionHeartbeat, RequestPayload::Heartbeat(hb)) => {
                self.registry.notify_heartbeat(&hb.action, hb.timestamp)
            }
            (RequestKind::RecvServerRequest, RequestPayload::Empty) => {
                let pull = ClientRequest {
                    kind,
                    client_name,
                    timeout_secs,
                    payload: RequestPayload::Empty,
                };
                if let Err(e) = self.registry.enqueue_pull(pull, reply) {
                    warn!("Pull rejected: {}", e);
                }
                return Completion::Deferred;
            }
            (RequestKind::SendServerResponse, RequestPayload::ActionResponse(result)) => {
                return Completion::ReplyThen(reply, ClientResponse::success(), result);
            }
            (RequestKind::Unknown(value), _) => Err(EngineError::UnknownRequestType(value)),
            (kind, payload) => Err(EngineError::IncorrectRequestData {
                message: format!("{} does not accept payload {:?}", kind, payload),
            }),
        };

        match result {
            Ok(()) => Completion::Reply(reply, ClientResponse::success()),
            Err(e) => {
                warn!("{} from {} failed: {}", kind, client_name, e);
                Completion::Reply(reply, ClientResponse::from_error(&e))
            }
        }
    }
}
