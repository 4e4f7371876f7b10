//! TCP client for plugin processes talking to the engine.
//!
//! A `ClientTx` is bound to one client name and one connection. Calls are
//! serialized on the connection: a pull that blocks in the engine blocks
//! every other call on the same `ClientTx`, so plugins that pull and
//! heartbeat concurrently open two connections.
//!
//! # Thread Safety
//!
//! The client uses a tokio `Mutex` to serialize access to the TCP stream,
//! allowing safe concurrent use from multiple async tasks.

use super::protocol::{
    read_frame, read_line, write_frame, write_line, Binding, JsonRpcRequest, JsonRpcResponse,
    REQUEST_METHOD,
};
use crate::config::TransportConfig;
use crate::error::{EngineError, Result};
use crate::types::{ActionResponse, ClientRequest, ClientResponse, ResponsePayload, ServerRequest};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// Connection to the engine on behalf of one client.
#[derive(Debug)]
pub struct ClientTx {
    conn: Mutex<Connection>,
    addr: SocketAddr,
    binding: Binding,
    client_name: String,
    next_id: AtomicU64,
}

impl ClientTx {
    /// Connect to an engine listener speaking `binding`.
    ///
    /// Uses the configured connection timeout from `TransportConfig`.
    pub async fn connect(
        binding: Binding,
        addr: SocketAddr,
        client_name: impl Into<String>,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| EngineError::transport(format!("connect to {} timed out", addr)))?
            .map_err(|e| EngineError::transport(format!("connect to {} failed: {}", addr, e)))?;

        let client_name = client_name.into();
        debug!("{} connected to {} ({})", client_name, addr, binding);

        let (reader, writer) = stream.into_split();
        Ok(Self {
            conn: Mutex::new(Connection {
                reader: BufReader::new(reader),
                writer,
            }),
            addr,
            binding,
            client_name,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    /// Send one request and wait for its response.
    ///
    /// Only transport failures are errors here; engine-side failures come
    /// back as a non-success `ClientResponse`.
    pub async fn call(&self, request: &ClientRequest) -> Result<ClientResponse> {
        match self.binding {
            Binding::Framed => self.call_framed(request).await,
            Binding::JsonRpc => self.call_jsonrpc(request).await,
        }
    }

    async fn call_framed(&self, request: &ClientRequest) -> Result<ClientResponse> {
        let request_bytes = serde_json::to_vec(request)?;

        let mut conn = self.conn.lock().await;
        let Connection { reader, writer } = &mut *conn;

        write_frame(writer, &request_bytes)
            .await
            .map_err(|e| lost(self.addr, e))?;
        let response_bytes = read_frame(reader)
            .await
            .map_err(|e| lost(self.addr, e))?
            .ok_or_else(|| closed(self.addr))?;

        serde_json::from_slice(&response_bytes).map_err(|e| EngineError::Json {
            message: format!("Failed to parse engine response: {}", e),
            source: Some(e),
        })
    }

    async fn call_jsonrpc(&self, request: &ClientRequest) -> Result<ClientResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let rpc = JsonRpcRequest::new(REQUEST_METHOD, serde_json::to_value(request)?, id);
        let request_bytes = serde_json::to_vec(&rpc)?;

        let mut conn = self.conn.lock().await;
        let Connection { reader, writer } = &mut *conn;

        write_line(writer, &request_bytes)
            .await
            .map_err(|e| lost(self.addr, e))?;
        let response_bytes = read_line(reader)
            .await
            .map_err(|e| lost(self.addr, e))?
            .ok_or_else(|| closed(self.addr))?;

        let response: JsonRpcResponse =
            serde_json::from_slice(&response_bytes).map_err(|e| EngineError::Json {
                message: format!("Failed to parse engine response: {}", e),
                source: Some(e),
            })?;

        if response.id != Some(serde_json::Value::Number(id.into())) {
            return Err(EngineError::transport(format!(
                "response id {:?} does not match request id {}",
                response.id, id
            )));
        }

        if let Some(err) = response.error {
            return Err(EngineError::transport(format!(
                "rpc error {}: {}",
                err.code, err.message
            )));
        }

        let result = response
            .result
            .ok_or_else(|| EngineError::transport("rpc response missing result"))?;
        Ok(serde_json::from_value(result)?)
    }

    /// Like [`call`](Self::call), with non-success codes turned into errors.
    async fn request(&self, request: ClientRequest) -> Result<ClientResponse> {
        let response = self.call(&request).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(EngineError::Response {
                code: response.result_code,
                message: response.result_message,
            })
        }
    }

    pub async fn register_client(&self) -> Result<()> {
        self.request(ClientRequest::register_client(&self.client_name))
            .await
            .map(|_| ())
    }

    pub async fn deregister_client(&self) -> Result<()> {
        self.request(ClientRequest::deregister_client(&self.client_name))
            .await
            .map(|_| ())
    }

    /// `timeout_secs` of 0 asks for the configured default.
    pub async fn register_action(&self, action: &str, timeout_secs: u64) -> Result<()> {
        self.request(ClientRequest::register_action(
            &self.client_name,
            action,
            timeout_secs,
        ))
        .await
        .map(|_| ())
    }

    pub async fn deregister_action(&self, action: &str) -> Result<()> {
        self.request(ClientRequest::deregister_action(&self.client_name, action))
            .await
            .map(|_| ())
    }

    /// Wait for the next work item. `timeout_secs` of 0 waits indefinitely.
    pub async fn recv_server_request(&self, timeout_secs: u64) -> Result<ServerRequest> {
        let response = self
            .request(ClientRequest::recv_server_request(
                &self.client_name,
                timeout_secs,
            ))
            .await?;

        match response.payload {
            ResponsePayload::ServerRequest(request) => Ok(request),
            ResponsePayload::None => Err(EngineError::transport(
                "successful pull carried no work item",
            )),
        }
    }

    pub async fn send_server_response(&self, response: ActionResponse) -> Result<()> {
        self.request(ClientRequest::send_server_response(
            &self.client_name,
            response,
        ))
        .await
        .map(|_| ())
    }

    pub async fn notify_heartbeat(&self, action: &str, timestamp: i64) -> Result<()> {
        self.request(ClientRequest::notify_heartbeat(
            &self.client_name,
            action,
            timestamp,
        ))
        .await
        .map(|_| ())
    }
}

fn lost(addr: SocketAddr, err: EngineError) -> EngineError {
    EngineError::transport(format!("connection to {} lost: {}", addr, err))
}

fn closed(addr: SocketAddr) -> EngineError {
    EngineError::transport(format!("connection to {} closed by engine", addr))
}
