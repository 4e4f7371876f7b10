//! TCP listeners feeding the request multiplexer.
//!
//! Each listener speaks one [`Binding`]. Every accepted connection gets its
//! own task, which reads one request at a time, submits it through a
//! [`TransportHandle`] and writes the reply back before reading the next.
//! A connection blocked on a pull therefore only holds up itself, and a
//! peer that hangs up mid-request drops its reply slot so pushed work goes
//! to a caller that is still there.
//!
//! # Thread Safety
//!
//! Connection tasks share nothing but the cloned handle and a connection
//! counter, so listeners for both bindings can run over the same engine.

use super::protocol::{
    read_frame, read_line, write_frame, write_line, Binding, JsonRpcRequest, JsonRpcResponse,
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
    REQUEST_METHOD,
};
use crate::config::TransportConfig;
use crate::error::{EngineError, Result};
use crate::transport::TransportHandle;
use crate::types::{ClientRequest, ClientResponse};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running listener. Dropping shuts it down.
pub struct BindingServerHandle {
    addr: SocketAddr,
    binding: Binding,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    active_connections: Arc<AtomicUsize>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BindingServerHandle {
    /// Get the address the listener is bound to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }

    /// Number of connections currently being served.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Stop accepting and close every connection task.
    pub fn shutdown(&mut self) {
        // Signal accept loop to stop
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        // Signal all connection handlers to close
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for BindingServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Listener for one binding.
pub struct BindingServer;

impl BindingServer {
    /// Bind `addr` and start serving `binding` in background tasks.
    pub async fn start<A: ToSocketAddrs>(
        binding: Binding,
        addr: A,
        transport: TransportHandle,
    ) -> Result<BindingServerHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        info!("{} listener on {}", binding, addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            binding,
            transport,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections.clone(),
        ));

        Ok(BindingServerHandle {
            addr,
            binding,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            active_connections,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: TcpListener,
        binding: Binding,
        transport: TransportHandle,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("{} listener shutting down", binding);
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= TransportConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting {} connection from {}: at max capacity ({})",
                                    binding,
                                    peer_addr,
                                    TransportConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let transport = transport.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("{} connection from {}", binding, peer_addr);
                                if let Err(e) = Self::handle_connection(
                                    stream,
                                    binding,
                                    &transport,
                                    &mut conn_shutdown,
                                )
                                .await
                                {
                                    debug!("{} connection {} ended: {}", binding, peer_addr, e);
                                }
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("{} accept error: {}", binding, e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        binding: Binding,
        transport: &TransportHandle,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        loop {
            let message = tokio::select! {
                result = Self::read_message(binding, &mut reader) => {
                    match result? {
                        Some(m) => m,
                        None => return Ok(()), // Clean disconnect
                    }
                }
                _ = shutdown_rx.changed() => {
                    return Ok(()); // Listener shutting down
                }
            };

            let reply = tokio::select! {
                reply = Self::process_message(binding, &message, transport) => reply,
                _ = Self::peer_closed(&mut reader) => {
                    debug!("{} peer closed with a request outstanding", binding);
                    return Ok(());
                }
                _ = shutdown_rx.changed() => return Ok(()),
            };

            Self::write_message(binding, &mut writer, &reply).await?;
        }
    }

    /// Resolves once the peer has hung up.
    async fn peer_closed<R: AsyncBufRead + Unpin>(reader: &mut R) {
        match reader.fill_buf().await {
            Ok([]) | Err(_) => {}
            // Pipelined input stays buffered for the next read.
            Ok(_) => std::future::pending().await,
        }
    }

    async fn read_message<R: AsyncBufRead + Unpin>(
        binding: Binding,
        reader: &mut R,
    ) -> Result<Option<Vec<u8>>> {
        match binding {
            Binding::Framed => read_frame(reader).await,
            Binding::JsonRpc => loop {
                match read_line(reader).await? {
                    // Blank lines between requests are ignored.
                    Some(line) if line.iter().all(u8::is_ascii_whitespace) => continue,
                    other => break Ok(other),
                }
            },
        }
    }

    async fn write_message<W: AsyncWrite + Unpin>(
        binding: Binding,
        writer: &mut W,
        payload: &[u8],
    ) -> Result<()> {
        match binding {
            Binding::Framed => write_frame(writer, payload).await,
            Binding::JsonRpc => write_line(writer, payload).await,
        }
    }

    async fn process_message(binding: Binding, message: &[u8], transport: &TransportHandle) -> Vec<u8> {
        let encoded = match binding {
            Binding::Framed => {
                let response = Self::process_framed(message, transport).await;
                serde_json::to_vec(&response)
            }
            Binding::JsonRpc => {
                let response = Self::process_jsonrpc(message, transport).await;
                serde_json::to_vec(&response)
            }
        };

        encoded.unwrap_or_else(|e| {
            error!("Failed to encode {} reply: {}", binding, e);
            match binding {
                Binding::Framed => {
                    br#"{"resultCode":4110,"resultMessage":"reply encoding failed"}"#.to_vec()
                }
                Binding::JsonRpc => br#"{"jsonrpc":"2.0","error":{"code":-32603,"message":"reply encoding failed"},"id":null}"#
                    .to_vec(),
            }
        })
    }

    async fn submit(request: ClientRequest, transport: &TransportHandle) -> ClientResponse {
        match transport.submit(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("Submit failed: {}", e);
                ClientResponse::from_error(&e)
            }
        }
    }

    async fn process_framed(message: &[u8], transport: &TransportHandle) -> ClientResponse {
        let request: ClientRequest = match serde_json::from_slice(message) {
            Ok(request) => request,
            Err(e) => {
                let err = EngineError::IncorrectRequestData {
                    message: format!("Malformed request: {}", e),
                };
                warn!("{}", err);
                return ClientResponse::from_error(&err);
            }
        };

        Self::submit(request, transport).await
    }

    async fn process_jsonrpc(message: &[u8], transport: &TransportHandle) -> JsonRpcResponse {
        let request: JsonRpcRequest = match serde_json::from_slice(message) {
            Ok(req) => req,
            Err(e) => {
                return JsonRpcResponse::error(None, PARSE_ERROR, format!("Parse error: {}", e));
            }
        };

        // Validate JSON-RPC version
        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::error(
                request.id,
                INVALID_REQUEST,
                "Invalid Request: expected jsonrpc 2.0".to_string(),
            );
        }

        if request.method != REQUEST_METHOD {
            return JsonRpcResponse::error(
                request.id,
                METHOD_NOT_FOUND,
                format!("Method not found: {}", request.method),
            );
        }

        let params = request.params.unwrap_or(serde_json::Value::Null);
        let client_request: ClientRequest = match serde_json::from_value(params) {
            Ok(r) => r,
            Err(e) => {
                return JsonRpcResponse::error(
                    request.id,
                    INVALID_PARAMS,
                    format!("Invalid params: {}", e),
                );
            }
        };

        let response = Self::submit(client_request, transport).await;
        match serde_json::to_value(&response) {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(e) => JsonRpcResponse::error(request.id, INTERNAL_ERROR, e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::AbortSignal;
    use crate::transport::{self, TransportServer};
    use crate::types::{ErrorCode, RequestKind};
    use tokio::io::AsyncWriteExt;

    /// Answers every request with success, echoing nothing.
    fn spawn_acceptor(mut server: TransportServer) -> AbortSignal {
        let abort = AbortSignal::new();
        let signal = abort.clone();
        tokio::spawn(async move {
            while let Ok(envelope) = server.receive_next(&signal).await {
                let response = match envelope.request.kind {
                    RequestKind::RegisterClient => ClientResponse::success(),
                    other => ClientResponse::failure(
                        ErrorCode::ReqFailed,
                        format!("unsupported {}", other),
                    ),
                };
                let _ = envelope.reply.send(response);
            }
        });
        abort
    }

    async fn start(binding: Binding) -> (BindingServerHandle, AbortSignal) {
        let (handle, server) = transport::channel(8);
        let abort = spawn_acceptor(server);
        let listener = BindingServer::start(binding, "127.0.0.1:0", handle)
            .await
            .unwrap();
        (listener, abort)
    }

    #[tokio::test]
    async fn test_server_start_and_shutdown() {
        let (mut handle, abort) = start(Binding::Framed).await;

        assert!(handle.port() > 0);
        assert_eq!(handle.addr().ip(), std::net::Ipv4Addr::LOCALHOST);
        assert_eq!(handle.binding(), Binding::Framed);

        handle.shutdown();
        abort.abort();
    }

    #[tokio::test]
    async fn test_framed_roundtrip() {
        let (mut handle, abort) = start(Binding::Framed).await;

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();

        let request = serde_json::to_vec(&ClientRequest::register_client("c1")).unwrap();
        write_frame(&mut writer, &request).await.unwrap();

        let bytes = read_frame(&mut reader).await.unwrap().unwrap();
        let response: ClientResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(response.is_success());

        handle.shutdown();
        abort.abort();
    }

    #[tokio::test]
    async fn test_framed_malformed_request_gets_incorrect_data() {
        let (mut handle, abort) = start(Binding::Framed).await;

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();

        write_frame(&mut writer, b"not valid json").await.unwrap();

        let bytes = read_frame(&mut reader).await.unwrap().unwrap();
        let response: ClientResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response.error_code(), Some(ErrorCode::IncorrectReqData));

        // The connection survives a bad request.
        let request = serde_json::to_vec(&ClientRequest::register_client("c1")).unwrap();
        write_frame(&mut writer, &request).await.unwrap();
        let bytes = read_frame(&mut reader).await.unwrap().unwrap();
        let response: ClientResponse = serde_json::from_slice(&bytes).unwrap();
        assert!(response.is_success());

        handle.shutdown();
        abort.abort();
    }

    async fn jsonrpc_exchange(handle: &BindingServerHandle, line: &str) -> JsonRpcResponse {
        let stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer.write_all(line.as_bytes()).await.unwrap();
        writer.write_all(b"\n").await.unwrap();

        let bytes = read_line(&mut reader).await.unwrap().unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_jsonrpc_roundtrip() {
        let (mut handle, abort) = start(Binding::JsonRpc).await;

        let response = jsonrpc_exchange(
            &handle,
            r#"{"jsonrpc":"2.0","method":"lom.request","params":{"kind":1,"clientName":"c1"},"id":7}"#,
        )
        .await;

        assert!(response.error.is_none());
        assert_eq!(response.id, Some(serde_json::json!(7)));
        let result: ClientResponse = serde_json::from_value(response.result.unwrap()).unwrap();
        assert!(result.is_success());

        handle.shutdown();
        abort.abort();
    }

    #[tokio::test]
    async fn test_jsonrpc_protocol_errors() {
        let (mut handle, abort) = start(Binding::JsonRpc).await;

        let parse = jsonrpc_exchange(&handle, "not valid json").await;
        assert_eq!(parse.error.unwrap().code, PARSE_ERROR);

        let version = jsonrpc_exchange(
            &handle,
            r#"{"jsonrpc":"1.0","method":"lom.request","params":{},"id":1}"#,
        )
        .await;
        assert_eq!(version.error.unwrap().code, INVALID_REQUEST);

        let method = jsonrpc_exchange(
            &handle,
            r#"{"jsonrpc":"2.0","method":"lom.unknown","params":{},"id":2}"#,
        )
        .await;
        assert_eq!(method.error.unwrap().code, METHOD_NOT_FOUND);

        let params = jsonrpc_exchange(
            &handle,
            r#"{"jsonrpc":"2.0","method":"lom.request","params":{"kind":"x"},"id":3}"#,
        )
        .await;
        assert_eq!(params.error.unwrap().code, INVALID_PARAMS);

        handle.shutdown();
        abort.abort();
    }

    #[tokio::test]
    async fn test_engine_failure_is_a_result_not_an_rpc_error() {
        let (mut handle, abort) = start(Binding::JsonRpc).await;

        let response = jsonrpc_exchange(
            &handle,
            r#"{"jsonrpc":"2.0","method":"lom.request","params":{"kind":2,"clientName":"c1"},"id":4}"#,
        )
        .await;

        assert!(response.error.is_none());
        let result: ClientResponse = serde_json::from_value(response.result.unwrap()).unwrap();
        assert_eq!(result.error_code(), Some(ErrorCode::ReqFailed));

        handle.shutdown();
        abort.abort();
    }

    #[tokio::test]
    async fn test_hangup_during_request_releases_reply_slot() {
        let (transport, mut server) = transport::channel(8);
        let mut handle = BindingServer::start(Binding::Framed, "127.0.0.1:0", transport)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let request = serde_json::to_vec(&ClientRequest::recv_server_request("c1", 0)).unwrap();
        write_frame(&mut stream, &request).await.unwrap();

        let envelope = server.receive_next(&AbortSignal::new()).await.unwrap();
        assert!(!envelope.reply.is_closed());

        drop(stream);
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while !envelope.reply.is_closed() {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("reply slot still open after the peer hung up");

        handle.shutdown();
    }

    #[tokio::test]
    async fn test_stopped_engine_reported_per_request() {
        let (transport, server) = transport::channel(8);
        drop(server);
        let mut handle = BindingServer::start(Binding::Framed, "127.0.0.1:0", transport)
            .await
            .unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        let (mut reader, mut writer) = stream.split();
        let request = serde_json::to_vec(&ClientRequest::register_client("c1")).unwrap();
        write_frame(&mut writer, &request).await.unwrap();

        let bytes = read_frame(&mut reader).await.unwrap().unwrap();
        let response: ClientResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(response.error_code(), Some(ErrorCode::UnknownError));

        handle.shutdown();
    }
}
