//! Client: owns one connection, multiplexes concurrent calls over it.
//!
//! A [`Client`] allocates monotonically increasing sequence numbers, keeps a
//! pending table of in-flight calls, and runs one receive loop that
//! demultiplexes responses purely by sequence number. Responses may arrive
//! in any order relative to request order.
//!
//! Two locks, in a fixed order:
//!
//! - the *sending* lock (`tokio::sync::Mutex` around the codec writer) is
//!   held for the duration of one wire write, header then body;
//! - the *state* lock (`std::sync::Mutex` around the pending table and the
//!   lifecycle flags) is only ever taken while holding, or without, the
//!   sending lock — never the other way around.
//!
//! Ownership of a pending entry transfers to whoever removes it from the
//! table; only that party may signal the call. This is what makes a
//! caller-side cancellation race-free against the receive loop.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex as AsyncMutex};

use crate::codec::{BoxedStream, CodecReader, CodecType, CodecWriter};
use crate::error::{Result, RpcError};
use crate::protocol::{
    self, Header, Options, CONNECTED_STATUS, DEFAULT_RPC_PATH, MAGIC_NUMBER,
};

type CallOutcome = std::result::Result<Bytes, RpcError>;

struct ClientState {
    /// Next sequence number; starts at 1, never reused.
    seq: u64,
    pending: HashMap<u64, oneshot::Sender<CallOutcome>>,
    /// Set by `close`.
    closing: bool,
    /// Set by the receive loop when the connection dies.
    shutdown: bool,
}

/// An rpc client bound to a single connection.
pub struct Client {
    /// Sending lock: one wire write at a time.
    writer: AsyncMutex<CodecWriter>,
    /// State lock: pending table, sequence counter, lifecycle flags.
    state: Mutex<ClientState>,
    options: Options,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("options", &self.options).finish()
    }
}

impl Client {
    /// Build a client over an established stream: send the handshake
    /// options line, then spawn the receive loop.
    pub async fn with_stream(stream: BoxedStream, options: Options) -> Result<Arc<Client>> {
        if options.magic_number != MAGIC_NUMBER {
            return Err(RpcError::Protocol(format!(
                "invalid magic number {:#x}",
                options.magic_number
            )));
        }
        let (read_half, mut write_half) = tokio::io::split(stream);
        protocol::write_options(&mut write_half, &options).await?;

        let reader = CodecReader::new(options.codec_type, BufReader::new(read_half));
        let writer = CodecWriter::new(options.codec_type, write_half);
        let client = Arc::new(Client {
            writer: AsyncMutex::new(writer),
            state: Mutex::new(ClientState {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
            options,
        });
        tokio::spawn(receive_loop(Arc::downgrade(&client), reader));
        Ok(client)
    }

    /// Dial a TCP endpoint. Connect plus handshake are bounded by
    /// `options.connect_timeout` unless it is zero.
    pub async fn dial(addr: &str, options: Options) -> Result<Arc<Client>> {
        let connect_timeout = options.connect_timeout;
        let addr = addr.to_string();
        bounded(connect_timeout, async move {
            let stream = TcpStream::connect(&addr).await?;
            Client::with_stream(Box::new(stream), options).await
        })
        .await
    }

    /// Dial a Unix socket endpoint.
    #[cfg(unix)]
    pub async fn dial_unix(path: &str, options: Options) -> Result<Arc<Client>> {
        let connect_timeout = options.connect_timeout;
        let path = path.to_string();
        bounded(connect_timeout, async move {
            let stream = tokio::net::UnixStream::connect(&path).await?;
            Client::with_stream(Box::new(stream), options).await
        })
        .await
    }

    /// Dial through an HTTP `CONNECT` tunnel, then run the normal
    /// handshake on the hijacked stream.
    pub async fn dial_http(addr: &str, options: Options) -> Result<Arc<Client>> {
        let connect_timeout = options.connect_timeout;
        let addr = addr.to_string();
        bounded(connect_timeout, async move {
            let mut stream = TcpStream::connect(&addr).await?;
            stream
                .write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\r\n\r\n").as_bytes())
                .await?;

            let mut reader = BufReader::new(stream);
            let mut status = String::new();
            reader.read_line(&mut status).await?;
            if status.trim_end() != CONNECTED_STATUS {
                return Err(RpcError::Protocol(format!(
                    "unexpected HTTP response: {}",
                    status.trim_end()
                )));
            }
            // Drain the rest of the response head.
            loop {
                let mut line = String::new();
                let n = reader.read_line(&mut line).await?;
                if n == 0 || line.trim_end().is_empty() {
                    break;
                }
            }
            Client::with_stream(Box::new(reader), options).await
        })
        .await
    }

    /// Dial an `protocol@address` endpoint: `http@host:port` tunnels over
    /// HTTP `CONNECT`, `tcp@host:port` and `unix@/path` connect directly.
    ///
    /// A malformed address fails before any socket is opened.
    pub async fn xdial(rpc_addr: &str, options: Options) -> Result<Arc<Client>> {
        let parts: Vec<&str> = rpc_addr.split('@').collect();
        if parts.len() != 2 {
            return Err(RpcError::InvalidAddress(format!(
                "expected protocol@addr, got {rpc_addr}"
            )));
        }
        let (protocol, addr) = (parts[0], parts[1]);
        match protocol {
            "http" => Client::dial_http(addr, options).await,
            "tcp" => Client::dial(addr, options).await,
            #[cfg(unix)]
            "unix" => Client::dial_unix(addr, options).await,
            _ => Err(RpcError::InvalidAddress(format!(
                "unsupported protocol {protocol}"
            ))),
        }
    }

    /// Whether the client can still register calls.
    pub fn is_available(&self) -> bool {
        let state = self.state.lock().unwrap();
        !state.shutdown && !state.closing
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Mark the client closing and shut the write half down.
    ///
    /// Returns [`RpcError::Shutdown`] if already closing.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.closing {
                return Err(RpcError::Shutdown);
            }
            state.closing = true;
        }
        let mut writer = self.writer.lock().await;
        writer.close().await
    }

    /// Start a call and return its handle immediately.
    ///
    /// The handle completes through [`Call::done`]; registration or write
    /// failures are delivered through the same path. Dropping the handle
    /// cancels the call.
    pub async fn go<A, R>(self: &Arc<Self>, service_method: &str, args: &A) -> Call<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        match self.options.codec_type.encode(args) {
            Ok(body) => self.go_raw(service_method, &body).await,
            Err(err) => self.failed_call(err),
        }
    }

    /// Raw-body form of [`Client::go`]: the arguments are already encoded
    /// with this connection's codec. Broadcast encodes once and fans the
    /// same bytes out to every endpoint.
    pub(crate) async fn go_raw<R>(self: &Arc<Self>, service_method: &str, body: &[u8]) -> Call<R>
    where
        R: DeserializeOwned,
    {
        let (tx, rx) = oneshot::channel();

        // Sending lock first, state lock second. Holding the sending lock
        // across registration keeps seq assignment in wire-write order.
        let mut writer = self.writer.lock().await;
        let seq = match self.register_call(tx) {
            Ok(seq) => seq,
            Err(tx) => {
                drop(writer);
                let _ = tx.send(Err(RpcError::Shutdown));
                return Call {
                    seq: 0,
                    client: self.clone(),
                    kind: self.options.codec_type,
                    rx,
                    _reply: PhantomData,
                };
            }
        };
        let header = Header {
            service_method: service_method.to_string(),
            seq,
            error: String::new(),
        };
        if let Err(err) = writer.write_raw(&header, body).await {
            // Whoever removes the entry owns the signal; the receive loop
            // may already have taken it if the connection died racily.
            if let Some(tx) = self.remove_call(seq) {
                let _ = tx.send(Err(err));
            }
        }
        drop(writer);

        Call {
            seq,
            client: self.clone(),
            kind: self.options.codec_type,
            rx,
            _reply: PhantomData,
        }
    }

    fn failed_call<R>(self: &Arc<Self>, err: RpcError) -> Call<R> {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Call {
            seq: 0,
            client: self.clone(),
            kind: self.options.codec_type,
            rx,
            _reply: PhantomData,
        }
    }

    /// Blocking call form: start the call and wait for its completion.
    pub async fn call<A, R>(self: &Arc<Self>, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        self.go(service_method, args).await.done().await
    }

    /// Deadline-bounded call form. On expiry the call is unregistered and
    /// a timeout error returned; a late response for its sequence number
    /// is consumed and discarded by the receive loop.
    pub async fn call_timeout<A, R>(
        self: &Arc<Self>,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let call = self.go(service_method, args).await;
        match tokio::time::timeout(timeout, call.done()).await {
            Ok(result) => result,
            // Dropping the in-flight `done` future dropped the Call, which
            // removed the pending entry.
            Err(_) => Err(RpcError::CallTimeout(timeout)),
        }
    }

    /// Register a call in the pending table and assign it the next
    /// sequence number. Hands the sender back if the client is no longer
    /// accepting calls, so the caller keeps the right to signal.
    fn register_call(
        &self,
        tx: oneshot::Sender<CallOutcome>,
    ) -> std::result::Result<u64, oneshot::Sender<CallOutcome>> {
        let mut state = self.state.lock().unwrap();
        if state.closing || state.shutdown {
            return Err(tx);
        }
        let seq = state.seq;
        state.seq += 1;
        state.pending.insert(seq, tx);
        Ok(seq)
    }

    fn remove_call(&self, seq: u64) -> Option<oneshot::Sender<CallOutcome>> {
        self.state.lock().unwrap().pending.remove(&seq)
    }

    /// Fail every pending call exactly once and refuse new registrations.
    async fn terminate_calls(&self, reason: String) {
        let _sending = self.writer.lock().await;
        let mut state = self.state.lock().unwrap();
        state.shutdown = true;
        for (_, tx) in state.pending.drain() {
            let _ = tx.send(Err(RpcError::ConnectionLost(reason.clone())));
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }
}

/// Handle for one in-flight call.
///
/// Resolve it with [`Call::done`]. Dropping the handle before completion
/// cancels the call: the pending entry is removed, and any response that
/// later arrives for its sequence number is discarded.
pub struct Call<R> {
    seq: u64,
    client: Arc<Client>,
    kind: CodecType,
    rx: oneshot::Receiver<CallOutcome>,
    _reply: PhantomData<fn() -> R>,
}

impl<R: DeserializeOwned> Call<R> {
    /// The sequence number assigned to this call (0 if registration failed).
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Wait for the call to complete and decode the reply.
    pub async fn done(mut self) -> Result<R> {
        match (&mut self.rx).await {
            Ok(Ok(body)) => self.kind.decode(&body),
            Ok(Err(err)) => Err(err),
            // Sender dropped without a signal; only reachable through
            // teardown races.
            Err(_) => Err(RpcError::Shutdown),
        }
    }

}

impl<R> Drop for Call<R> {
    fn drop(&mut self) {
        // No-op once the receive loop (or teardown) has taken the entry.
        self.client.remove_call(self.seq);
    }
}

/// Receive loop: demultiplex responses to their pending calls until the
/// connection dies, then terminate every call still in flight.
async fn receive_loop(client: Weak<Client>, mut reader: CodecReader) {
    let reason = loop {
        let header = match reader.read_header().await {
            Ok(Some(header)) => header,
            Ok(None) => break "connection closed".to_string(),
            Err(err) => break err.to_string(),
        };
        let Some(client) = client.upgrade() else {
            return;
        };
        match client.remove_call(header.seq) {
            // Cancelled or never registered: skip the body frame, keep
            // the stream in sync.
            None => {
                tracing::debug!(seq = header.seq, "discarding response with no pending call");
                if let Err(err) = reader.discard_body().await {
                    break err.to_string();
                }
            }
            Some(tx) if !header.error.is_empty() => {
                let skipped = reader.discard_body().await;
                let _ = tx.send(Err(RpcError::Remote(header.error)));
                if let Err(err) = skipped {
                    break err.to_string();
                }
            }
            Some(tx) => match reader.read_body_bytes().await {
                Ok(body) => {
                    let _ = tx.send(Ok(body));
                }
                Err(err) => {
                    let reason = err.to_string();
                    let _ = tx.send(Err(RpcError::ConnectionLost(reason.clone())));
                    break reason;
                }
            },
        }
    };
    if let Some(client) = client.upgrade() {
        tracing::debug!(%reason, "rpc client: receive loop exited");
        client.terminate_calls(reason).await;
    }
}

async fn bounded<F>(timeout: Duration, dial: F) -> Result<Arc<Client>>
where
    F: std::future::Future<Output = Result<Arc<Client>>>,
{
    if timeout.is_zero() {
        return dial.await;
    }
    match tokio::time::timeout(timeout, dial).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::ConnectTimeout(timeout)),
    }
}
