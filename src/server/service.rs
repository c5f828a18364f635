//! Services and their invocable methods.
//!
//! A [`Service`] wraps a set of named async handlers. Registration is
//! explicit and typed: each method is a function object of shape
//! `Fn(Arg) -> Future<Output = Result<Reply, MethodError>>`, and the codec
//! bridges typed values to wire bytes at the edge. The method shape rule —
//! one argument in, one reply out, error-typed failure — is enforced by
//! this signature at compile time.
//!
//! # Example
//!
//! ```ignore
//! let service = Service::new("Arith")
//!     .method("Sum", |args: Args| async move { Ok(args.a + args.b) });
//! server.register(service)?;
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;

/// Error returned by a service method.
///
/// Its text travels back to the caller in the response header's error
/// field; the response body degrades to the invalid-request sentinel.
#[derive(Debug)]
pub struct MethodError(String);

impl MethodError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for MethodError {}

impl From<String> for MethodError {
    fn from(msg: String) -> Self {
        Self(msg)
    }
}

impl From<&str> for MethodError {
    fn from(msg: &str) -> Self {
        Self(msg.to_string())
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Type-erased method body: argument bytes in, encoded reply bytes out.
/// The error string is what ends up in the response header.
type BoxedMethod =
    Box<dyn Fn(CodecType, Bytes) -> BoxFuture<std::result::Result<Vec<u8>, String>> + Send + Sync>;

/// One registered method: its erased handler and a call counter.
pub struct MethodDescriptor {
    name: String,
    handler: BoxedMethod,
    num_calls: AtomicU64,
}

impl fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("num_calls", &self.num_calls)
            .finish()
    }
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this method has been dispatched.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Invoke the method on one request. Bumps the call counter and
    /// returns the future that runs the handler.
    pub(crate) fn invoke(
        &self,
        kind: CodecType,
        body: Bytes,
    ) -> BoxFuture<std::result::Result<Vec<u8>, String>> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.handler)(kind, body)
    }
}

/// A named set of invocable methods.
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Service {
    /// Create an empty service.
    ///
    /// # Panics
    ///
    /// Panics unless the name starts with an uppercase letter; services
    /// must be registered under exported names, and violating that is a
    /// programming error caught at registration.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(
            name.chars().next().is_some_and(|c| c.is_uppercase()),
            "rpc service: {name:?} is not an exported service name"
        );
        Self {
            name,
            methods: HashMap::new(),
        }
    }

    /// Register a method under `name`.
    ///
    /// # Panics
    ///
    /// Panics unless the method name starts with an uppercase letter.
    pub fn method<Arg, Reply, F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        Arg: DeserializeOwned + Send + 'static,
        Reply: Serialize + Send + 'static,
        F: Fn(Arg) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Reply, MethodError>> + Send + 'static,
    {
        assert!(
            name.chars().next().is_some_and(|c| c.is_uppercase()),
            "rpc service: {name:?} is not an exported method name"
        );
        let boxed: BoxedMethod = Box::new(move |kind, body| {
            let arg: Arg = match kind.decode(&body) {
                Ok(arg) => arg,
                Err(err) => {
                    let msg = format!("rpc server: decode args error: {err}");
                    return Box::pin(async move { Err(msg) });
                }
            };
            let fut = handler(arg);
            Box::pin(async move {
                match fut.await {
                    Ok(reply) => kind
                        .encode(&reply)
                        .map_err(|err| format!("rpc server: encode reply error: {err}")),
                    Err(err) => Err(err.to_string()),
                }
            })
        });
        self.methods.insert(
            name.to_string(),
            Arc::new(MethodDescriptor {
                name: name.to_string(),
                handler: boxed,
                num_calls: AtomicU64::new(0),
            }),
        );
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up a method by name.
    pub fn method_descriptor(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(name).cloned()
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }
}
