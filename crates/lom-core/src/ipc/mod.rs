//! Network bindings for the engine.
//!
//! Plugin processes reach the engine over TCP. Two wire formats run side by
//! side over the same request multiplexer:
//!
//! - **Framed**: 4-byte big-endian length prefix followed by a JSON request
//! - **JSON-RPC**: newline-delimited JSON-RPC 2.0 with one method, `lom.request`
//!
//! # Architecture
//!
//! - **Server**: Listens for one binding and feeds requests into a [`TransportHandle`]
//! - **Client**: Connects on behalf of one plugin client and exposes typed calls
//! - **Protocol**: Shared framing and JSON-RPC types used by both
//!
//! [`TransportHandle`]: crate::transport::TransportHandle

pub mod client;
pub mod protocol;
pub mod server;

pub use client::ClientTx;
pub use protocol::Binding;
pub use server::{BindingServer, BindingServerHandle};
