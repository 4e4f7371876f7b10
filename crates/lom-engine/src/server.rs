//! Listener startup for both bindings.

use lom_core::{Binding, BindingServer, BindingServerHandle, TransportHandle};
use tracing::info;

/// The two listeners serving one engine.
pub struct Listeners {
    framed: BindingServerHandle,
    jsonrpc: BindingServerHandle,
}

impl Listeners {
    pub fn binary_port(&self) -> u16 {
        self.framed.port()
    }

    pub fn jsonrpc_port(&self) -> u16 {
        self.jsonrpc.port()
    }

    /// Stop accepting on both bindings and close open connections.
    pub fn shutdown(&mut self) {
        self.framed.shutdown();
        self.jsonrpc.shutdown();
    }
}

/// Start the framed and JSON-RPC listeners on `host`.
///
/// A port of 0 lets the OS pick one; read it back from the returned handles.
pub async fn start_listeners(
    host: &str,
    binary_port: u16,
    jsonrpc_port: u16,
    handle: TransportHandle,
) -> anyhow::Result<Listeners> {
    let framed =
        BindingServer::start(Binding::Framed, (host, binary_port), handle.clone()).await?;
    let jsonrpc = BindingServer::start(Binding::JsonRpc, (host, jsonrpc_port), handle).await?;

    info!(
        "Engine listening on {} (framed) and {} (json-rpc)",
        framed.addr(),
        jsonrpc.addr()
    );

    Ok(Listeners { framed, jsonrpc })
}
