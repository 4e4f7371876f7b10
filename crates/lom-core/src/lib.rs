//! LoM Core - rendezvous and registration core of the LoM fault-management engine.
//!
//! Plugin processes register as clients, claim the actions they implement,
//! pull work items, report results and send liveness heartbeats. This crate
//! provides everything between the wire and the workflow engine:
//!
//! - [`transport`]: bounded request multiplexer with per-request reply slots
//! - [`dispatcher`]: maps each request kind onto one registry operation
//! - [`registry`]: clients, action ownership and the push path to clients
//! - [`mailbox`]: per-client matching of pending pulls and pending pushes
//! - [`heartbeat`]: periodic, de-duplicated liveness batches
//! - [`ipc`]: framed and JSON-RPC TCP bindings plus a client library
//!
//! The sequence handler, configuration and event sink are collaborators
//! described by the traits in [`collab`].
//!
//! # Example
//!
//! ```rust,ignore
//! use lom_core::{AbortSignal, ConfigStore, EngineBuilder, NoopSequence};
//! use std::sync::Arc;
//!
//! let config = Arc::new(ConfigStore::load("/etc/lom")?);
//! let (engine, handle) = EngineBuilder::new(config.clone(), Box::new(NoopSequence), publisher)
//!     .global_config(config)
//!     .build();
//!
//! let abort = AbortSignal::new();
//! let framed = BindingServer::start(Binding::Framed, "127.0.0.1:3669", handle.clone()).await?;
//! engine.run(abort).await?;
//! ```

pub mod cancel;
pub mod collab;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod ipc;
pub mod mailbox;
pub mod registry;
pub mod transport;
pub mod types;

// Re-export commonly used types
pub use cancel::{AbortSignal, AbortedError};
pub use collab::{
    ActionConfig, ActionConfigSource, EventPublisher, GlobalConfigSource, NoopSequence,
    SequenceHandler,
};
pub use config::{ConfigStore, GlobalSettings};
pub use engine::{Engine, EngineBuilder};
pub use error::{EngineError, Result};
pub use ipc::{Binding, BindingServer, BindingServerHandle, ClientTx};
pub use mailbox::MailboxLimits;
pub use registry::{ActionRegistration, Registry};
pub use transport::{Envelope, ReplySlot, TransportHandle};
pub use types::{
    ActionRequest, ActionResponse, ClientRequest, ClientResponse, EngineEvent, ErrorCode,
    HeartbeatBatch, RequestKind, RequestPayload, ResponsePayload, ServerRequest,
};
