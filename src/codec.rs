//! Codec layer: length-delimited framing plus pluggable payload encodings.
//!
//! After the handshake, every message on a connection is a `(Header, Body)`
//! pair. Each half of the pair travels as one frame:
//!
//! ```text
//! ┌──────────┬─────────────┐
//! │ Length   │ Payload     │
//! │ 4 bytes  │ N bytes     │
//! │ u32 BE   │ codec bytes │
//! └──────────┴─────────────┘
//! ```
//!
//! The payload encoding is selected by name at handshake time via
//! [`CodecType`]. Two encodings are registered: MessagePack (`rmp-serde`,
//! struct-as-map via `to_vec_named`) and JSON.
//!
//! A connection's codec is split into an owned reader/writer pair so a
//! receive loop can block on reads while senders write behind a mutex.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};

use crate::error::{Result, RpcError};
use crate::protocol::Header;

/// Maximum size of a single frame payload (1 GB).
pub const MAX_FRAME_SIZE: u32 = 1_073_741_824;

/// Duplex byte stream a codec can be layered over.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

/// Boxed duplex stream (TCP, Unix socket, in-memory duplex in tests).
pub type BoxedStream = Box<dyn Stream>;

/// Payload encoding, identified on the wire by its tag string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecType {
    /// MessagePack via `rmp-serde`, struct-as-map format.
    MsgPack,
    /// JSON via `serde_json`.
    Json,
}

impl CodecType {
    /// The tag this codec registers under.
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecType::MsgPack => "application/msgpack",
            CodecType::Json => "application/json",
        }
    }

    /// Look up a codec by tag. `None` for unknown tags.
    pub fn from_name(name: &str) -> Option<CodecType> {
        match name {
            "application/msgpack" => Some(CodecType::MsgPack),
            "application/json" => Some(CodecType::Json),
            _ => None,
        }
    }

    /// Encode a value to payload bytes.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            CodecType::MsgPack => Ok(rmp_serde::to_vec_named(value)?),
            CodecType::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    /// Decode payload bytes to a value.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            CodecType::MsgPack => Ok(rmp_serde::from_slice(bytes)?),
            CodecType::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

impl Serialize for CodecType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CodecType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        CodecType::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown codec type {name}")))
    }
}

/// Buffered read half of a connection, shared between the handshake reader
/// and the codec built on top of it.
pub type SplitReader = BufReader<ReadHalf<BoxedStream>>;

/// Split a stream into a codec reader/writer pair.
pub fn split_codec(kind: CodecType, stream: BoxedStream) -> (CodecReader, CodecWriter) {
    let (read_half, write_half) = tokio::io::split(stream);
    (
        CodecReader::new(kind, BufReader::new(read_half)),
        CodecWriter::new(kind, write_half),
    )
}

/// Reading side of a codec: header frames and body frames, in wire order.
pub struct CodecReader {
    kind: CodecType,
    reader: SplitReader,
}

impl CodecReader {
    /// Build a reader over an already-buffered read half, so bytes buffered
    /// during the handshake are not lost.
    pub fn new(kind: CodecType, reader: SplitReader) -> Self {
        Self { kind, reader }
    }

    pub fn kind(&self) -> CodecType {
        self.kind
    }

    /// Read one header frame.
    ///
    /// Returns `Ok(None)` on clean end of stream — a distinguished
    /// condition, not an error. EOF in the middle of a frame is an error.
    pub async fn read_header(&mut self) -> Result<Option<Header>> {
        match self.read_frame().await? {
            None => Ok(None),
            Some(frame) => Ok(Some(self.kind.decode(&frame)?)),
        }
    }

    /// Read one body frame and decode it.
    pub async fn read_body<T: DeserializeOwned>(&mut self) -> Result<T> {
        let frame = self.require_frame().await?;
        self.kind.decode(&frame)
    }

    /// Read one body frame without decoding it.
    pub async fn read_body_bytes(&mut self) -> Result<Bytes> {
        self.require_frame().await
    }

    /// Consume one body frame and drop it.
    ///
    /// Used to skip bodies of orphaned or errored responses without
    /// desynchronizing the stream.
    pub async fn discard_body(&mut self) -> Result<()> {
        self.require_frame().await.map(|_| ())
    }

    async fn require_frame(&mut self) -> Result<Bytes> {
        self.read_frame().await?.ok_or_else(|| {
            RpcError::Io(std::io::ErrorKind::UnexpectedEof.into())
        })
    }

    async fn read_frame(&mut self) -> Result<Option<Bytes>> {
        let mut len_buf = [0u8; 4];
        // A zero-byte first read is the only clean EOF point.
        let n = self.reader.read(&mut len_buf[..1]).await?;
        if n == 0 {
            return Ok(None);
        }
        self.reader.read_exact(&mut len_buf[1..]).await?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::Protocol(format!(
                "frame size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        self.reader.read_exact(&mut payload).await?;
        Ok(Some(payload.into()))
    }
}

/// Writing side of a codec.
///
/// `write` emits the header frame then the body frame with a single flush;
/// callers serialize access behind a mutex, so a pair is never interleaved
/// with another writer's frames.
pub struct CodecWriter {
    kind: CodecType,
    writer: WriteHalf<BoxedStream>,
}

impl CodecWriter {
    pub fn new(kind: CodecType, writer: WriteHalf<BoxedStream>) -> Self {
        Self { kind, writer }
    }

    pub fn kind(&self) -> CodecType {
        self.kind
    }

    /// Write one `(Header, Body)` pair.
    pub async fn write<T: Serialize + ?Sized>(&mut self, header: &Header, body: &T) -> Result<()> {
        let body = self.kind.encode(body)?;
        self.write_raw(header, &body).await
    }

    /// Write one `(Header, Body)` pair with a pre-encoded body.
    pub async fn write_raw(&mut self, header: &Header, body: &[u8]) -> Result<()> {
        let header = self.kind.encode(header)?;
        self.write_frame(&header).await?;
        self.write_frame(body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the stream.
    pub async fn close(&mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<()> {
        self.writer
            .write_all(&(payload.len() as u32).to_be_bytes())
            .await?;
        self.writer.write_all(payload).await?;
        Ok(())
    }
}
