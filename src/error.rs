//! Error types for geerpc.

use std::time::Duration;

use thiserror::Error;

/// Main error type for all rpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (handshake frame or json codec).
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// MessagePack serialization error.
    #[error("msgpack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MessagePack deserialization error.
    #[error("msgpack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// HTTP error while talking to the registry.
    #[error("registry http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Protocol violation (bad magic number, corrupt frame, bad handshake).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An rpc address did not have the `protocol@addr` shape.
    #[error("invalid rpc address: {0}")]
    InvalidAddress(String),

    /// The dotted service method string had no service part.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),

    /// No service registered under the requested name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),

    /// The service exists but has no such method.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),

    /// A service with the same name was already registered.
    #[error("rpc server: service already defined: {0}")]
    ServiceDefined(String),

    /// Error string carried back in a response header.
    #[error("{0}")]
    Remote(String),

    /// Connection establishment exceeded the configured connect timeout.
    #[error("rpc client: connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// A call did not complete within the caller's deadline.
    #[error("rpc client: call timeout after {0:?}")]
    CallTimeout(Duration),

    /// The client is closing or already shut down.
    #[error("connection is shut down")]
    Shutdown,

    /// The connection died while calls were still in flight.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Endpoint discovery failure.
    #[error("rpc discovery: {0}")]
    Discovery(String),
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
