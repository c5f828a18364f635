//! # geerpc
//!
//! A minimal RPC framework: a connection-framed wire protocol with
//! pluggable codecs, a server that dispatches named methods on registered
//! services, and a multiplexing client that interleaves concurrent calls
//! over a single connection. Around the core sit an HTTP registry with
//! TTL-based liveness and a failure-aware load-balanced client.
//!
//! ## Architecture
//!
//! - **Handshake** (stream prefix): one JSON line carrying the magic
//!   number, codec tag and timeouts.
//! - **Messages**: length-delimited `(Header, Body)` frame pairs in the
//!   negotiated codec (MessagePack or JSON).
//!
//! ## Example
//!
//! ```ignore
//! use geerpc::{Client, Options, Server, Service};
//!
//! #[tokio::main]
//! async fn main() -> geerpc::Result<()> {
//!     let server = std::sync::Arc::new(Server::new());
//!     server.register(
//!         Service::new("Arith")
//!             .method("Sum", |args: (i32, i32)| async move { Ok(args.0 + args.1) }),
//!     )?;
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:9999").await?;
//!     tokio::spawn(server.accept(listener));
//!
//!     let client = Client::dial("127.0.0.1:9999", Options::default()).await?;
//!     let sum: i32 = client.call("Arith.Sum", &(1, 2)).await?;
//!     assert_eq!(sum, 3);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod xclient;

mod client;

pub use client::{Call, Client};
pub use codec::CodecType;
pub use error::{Result, RpcError};
pub use protocol::{Header, Options, MAGIC_NUMBER};
pub use registry::{heartbeat, Registry};
pub use server::{MethodError, Server, Service};
pub use xclient::{
    Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, XClient,
};
