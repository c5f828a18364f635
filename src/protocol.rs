//! Wire protocol types: the handshake `Options` frame and the message `Header`.
//!
//! A connection carries, in order:
//!
//! 1. Exactly one [`Options`] frame — a single line of JSON terminated by
//!    `\n`. JSON is self-describing, so the receiver can decode it from the
//!    stream prefix before any codec has been chosen.
//! 2. Zero or more `(Header, Body)` frame pairs produced by the codec named
//!    in `Options::codec_type`.
//!
//! Any connection whose first decoded `Options` does not carry
//! [`MAGIC_NUMBER`] is closed without further I/O.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::codec::CodecType;
use crate::error::{Result, RpcError};

/// Magic number identifying the protocol; first field of the handshake frame.
pub const MAGIC_NUMBER: u64 = 0x3bef5c;

/// Path requested by the client's `CONNECT` line when tunneling over HTTP.
pub const DEFAULT_RPC_PATH: &str = "/_geeprc_/";

/// Registry endpoint path.
pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc_/registry";

/// Exact status line the server answers a `CONNECT` upgrade with.
pub const CONNECTED_STATUS: &str = "HTTP/1.0 200 Connected to Gee RPC";

/// Default server-side bound on a single dispatch when the handshake
/// carries a zero handle timeout.
pub const DEFAULT_HANDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection handshake options.
///
/// Sent once by the client as a JSON line before any message frames.
/// Durations travel as integer nanoseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Options {
    pub magic_number: u64,
    pub codec_type: CodecType,
    /// Bounds dial + handshake on the client. Zero disables the bound.
    #[serde(with = "duration_ns")]
    pub connect_timeout: Duration,
    /// Bounds each dispatch on the server. Zero selects the server default.
    #[serde(with = "duration_ns")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            magic_number: MAGIC_NUMBER,
            codec_type: CodecType::MsgPack,
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

/// Header of one message frame.
///
/// `error` is empty on success; a non-empty value carries a per-request
/// failure back to the caller and the body degrades to a sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    /// Dotted `"Service.Method"` dispatch key.
    pub service_method: String,
    /// Per-client monotonic sequence number, never reused.
    pub seq: u64,
    #[serde(default)]
    pub error: String,
}

/// Read one handshake frame from the stream prefix.
///
/// Returns a protocol error if the peer closed the stream before sending
/// a complete line, or if the line is not a valid `Options` encoding.
pub async fn read_options<R>(reader: &mut R) -> Result<Options>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(RpcError::Protocol(
            "connection closed before handshake".to_string(),
        ));
    }
    let options = serde_json::from_str(line.trim_end())?;
    Ok(options)
}

/// Write one handshake frame and flush it.
pub async fn write_options<W>(writer: &mut W, options: &Options) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(options)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

mod duration_ns {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let nanos = u64::deserialize(deserializer)?;
        Ok(Duration::from_nanos(nanos))
    }
}
