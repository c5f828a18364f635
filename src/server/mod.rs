//! Server: accepts connections, performs the handshake, reads requests and
//! dispatches each to an independent worker.
//!
//! Per connection, after the handshake:
//! 1. Read a header, resolve its `"Service.Method"` key, read the body.
//! 2. Spawn one worker per request; the worker runs the handler on its own
//!    task so a handle timeout abandons the result without cancelling the
//!    method.
//! 3. Serialize every response write through the per-connection sending
//!    lock.
//!
//! When the read loop stops (EOF or framing corruption), in-flight workers
//! are drained before the codec is closed. Per-request failures — unknown
//! service or method, argument decode errors, handler errors, handle
//! timeouts — travel in the response header's error field with a sentinel
//! body and never terminate the connection.

mod service;

pub use service::{MethodDescriptor, MethodError, Service};

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;

use crate::codec::{BoxedStream, CodecReader, CodecType, CodecWriter};
use crate::error::{Result, RpcError};
use crate::protocol::{
    self, Header, Options, CONNECTED_STATUS, DEFAULT_HANDLE_TIMEOUT, DEFAULT_RPC_PATH,
    MAGIC_NUMBER,
};

/// Body payload for responses whose header carries an error. Clients
/// detect the failure via the header and never decode this into a typed
/// reply.
#[derive(Serialize)]
struct InvalidRequest {}

/// An rpc server holding a set of registered services.
pub struct Server {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Server {
    pub fn new() -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
        }
    }

    /// Register a service. Duplicate names are rejected.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write().unwrap();
        match services.entry(service.name().to_string()) {
            Entry::Occupied(entry) => Err(RpcError::ServiceDefined(entry.key().clone())),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(service));
                Ok(())
            }
        }
    }

    /// Resolve a dotted `"Service.Method"` key, split at the last `.`.
    fn find_service(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodDescriptor>)> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(RpcError::IllFormedServiceMethod(service_method.to_string()));
        };
        let service = self
            .services
            .read()
            .unwrap()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;
        let method = service
            .method_descriptor(method_name)
            .ok_or_else(|| RpcError::MethodNotFound(method_name.to_string()))?;
        Ok((service, method))
    }

    /// Accept loop: serve every connection from the listener.
    pub async fn accept(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(%err, "rpc server: accept error");
                    return;
                }
            };
            tracing::debug!(%peer, "rpc server: accepted connection");
            let server = self.clone();
            tokio::spawn(server.serve_conn(Box::new(stream)));
        }
    }

    /// Accept loop over a Unix socket listener.
    #[cfg(unix)]
    pub async fn accept_unix(self: Arc<Self>, listener: tokio::net::UnixListener) {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(%err, "rpc server: accept error");
                    return;
                }
            };
            let server = self.clone();
            tokio::spawn(server.serve_conn(Box::new(stream)));
        }
    }

    /// Accept loop for HTTP-tunneled connections: each connection must
    /// open with `CONNECT /_geeprc_/` before the normal handshake runs.
    pub async fn accept_http(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::error!(%err, "rpc server: accept error");
                    return;
                }
            };
            let server = self.clone();
            tokio::spawn(server.serve_http_conn(stream));
        }
    }

    /// Serve a single connection: handshake, then the request loop.
    ///
    /// A connection whose handshake cannot be decoded, whose magic number
    /// mismatches, or whose codec tag is unknown is closed without
    /// writing anything back.
    pub async fn serve_conn(self: Arc<Self>, stream: BoxedStream) {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = BufReader::new(read_half);

        let options = match protocol::read_options(&mut reader).await {
            Ok(options) => options,
            Err(err) => {
                tracing::error!(%err, "rpc server: options error");
                return;
            }
        };
        if options.magic_number != MAGIC_NUMBER {
            tracing::error!("rpc server: invalid magic number {:#x}", options.magic_number);
            return;
        }

        let codec_reader = CodecReader::new(options.codec_type, reader);
        let codec_writer = CodecWriter::new(options.codec_type, write_half);
        self.serve_codec(options, codec_reader, codec_writer).await;
    }

    async fn serve_http_conn(self: Arc<Self>, stream: TcpStream) {
        let mut reader = BufReader::new(stream);

        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await.is_err() {
            return;
        }
        // Drain the rest of the request head.
        loop {
            let mut line = String::new();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => return,
                Ok(_) if line.trim_end().is_empty() => break,
                Ok(_) => {}
            }
        }

        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default();
        let path = parts.next().unwrap_or_default();
        if method != "CONNECT" || path.trim_end_matches('/') != DEFAULT_RPC_PATH.trim_end_matches('/')
        {
            let _ = reader
                .get_mut()
                .write_all(b"HTTP/1.0 404 Not Found\r\n\r\n")
                .await;
            return;
        }
        if reader
            .get_mut()
            .write_all(format!("{CONNECTED_STATUS}\r\n\r\n").as_bytes())
            .await
            .is_err()
        {
            return;
        }
        self.serve_conn(Box::new(reader)).await;
    }

    async fn serve_codec(
        self: Arc<Self>,
        options: Options,
        mut reader: CodecReader,
        writer: CodecWriter,
    ) {
        let kind = reader.kind();
        let writer = Arc::new(AsyncMutex::new(writer));
        let mut workers = JoinSet::new();
        let handle_timeout = if options.handle_timeout.is_zero() {
            DEFAULT_HANDLE_TIMEOUT
        } else {
            options.handle_timeout
        };

        loop {
            let header = match reader.read_header().await {
                Ok(Some(header)) => header,
                Ok(None) => break,
                Err(err) => {
                    tracing::error!(%err, "rpc server: read header error");
                    break;
                }
            };

            let (_service, method) = match self.find_service(&header.service_method) {
                Ok(found) => found,
                Err(err) => {
                    // Keep the stream in sync before reporting the lookup
                    // failure in the response header.
                    let drained = reader.discard_body().await;
                    let mut header = header;
                    header.error = err.to_string();
                    send_response(&writer, &header, &InvalidRequest {}).await;
                    if drained.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let body = match reader.read_body_bytes().await {
                Ok(body) => body,
                Err(err) => {
                    tracing::error!(%err, "rpc server: read body error");
                    let mut header = header;
                    header.error = format!("rpc server: read body error: {err}");
                    send_response(&writer, &header, &InvalidRequest {}).await;
                    break;
                }
            };

            workers.spawn(handle_request(
                method,
                kind,
                header,
                body,
                writer.clone(),
                handle_timeout,
            ));
        }

        // Let in-flight workers finish writing before the codec goes away.
        while workers.join_next().await.is_some() {}
        let _ = writer.lock().await.close().await;
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one request to completion and write its response.
///
/// The handler runs on its own task: if the handle timeout fires first, a
/// timeout error response is written and the handler is left running, its
/// eventual result discarded. The response write itself is not timed.
async fn handle_request(
    method: Arc<MethodDescriptor>,
    kind: CodecType,
    mut header: Header,
    body: Bytes,
    writer: Arc<AsyncMutex<CodecWriter>>,
    handle_timeout: Duration,
) {
    let invocation = method.invoke(kind, body);
    let mut task = tokio::spawn(invocation);

    match tokio::time::timeout(handle_timeout, &mut task).await {
        Ok(Ok(Ok(reply))) => {
            send_response_raw(&writer, &header, &reply).await;
        }
        Ok(Ok(Err(message))) => {
            header.error = message;
            send_response(&writer, &header, &InvalidRequest {}).await;
        }
        Ok(Err(join_err)) => {
            header.error = format!("rpc server: method aborted: {join_err}");
            send_response(&writer, &header, &InvalidRequest {}).await;
        }
        Err(_) => {
            header.error = format!("server handle timeout {handle_timeout:?}");
            send_response(&writer, &header, &InvalidRequest {}).await;
        }
    }
}

async fn send_response<T: Serialize>(
    writer: &AsyncMutex<CodecWriter>,
    header: &Header,
    body: &T,
) {
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write(header, body).await {
        tracing::error!(%err, "rpc server: write response error");
    }
}

async fn send_response_raw(writer: &AsyncMutex<CodecWriter>, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().await;
    if let Err(err) = writer.write_raw(header, body).await {
        tracing::error!(%err, "rpc server: write response error");
    }
}
