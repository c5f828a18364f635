//! Load-balanced client: pools one [`Client`] per endpoint and picks
//! endpoints through a [`Discovery`] policy.
//!
//! `call` routes one request to one endpoint. `broadcast` fans a request
//! out to every endpoint in parallel with first-error cancellation and
//! first-success reply capture.

mod discovery;

pub use discovery::{
    Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, DEFAULT_UPDATE_INTERVAL,
};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::error::{Result, RpcError};
use crate::protocol::Options;

/// A client that multiplexes per-endpoint [`Client`]s behind a selection
/// policy.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    options: Options,
    /// Pooled clients keyed by `protocol@address`. Creation happens under
    /// this lock; dials are rare, calls are not in the critical path.
    clients: AsyncMutex<HashMap<String, Arc<Client>>>,
}

impl<D: Discovery + 'static> XClient<D> {
    pub fn new(discovery: D, mode: SelectMode, options: Options) -> Arc<Self> {
        Arc::new(Self {
            discovery,
            mode,
            options,
            clients: AsyncMutex::new(HashMap::new()),
        })
    }

    pub fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Close and drop every pooled client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (_, client) in clients.drain() {
            let _ = client.close().await;
        }
    }

    /// Fetch the pooled client for an endpoint, replacing it if it has
    /// become unavailable.
    pub async fn dial(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            let _ = client.close().await;
            clients.remove(rpc_addr);
        }
        let client = Client::xdial(rpc_addr, self.options.clone()).await?;
        clients.insert(rpc_addr.to_string(), client.clone());
        Ok(client)
    }

    /// Call one endpoint chosen by the selection policy.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        let client = self.dial(&rpc_addr).await?;
        client.call(service_method, args).await
    }

    /// Deadline-bounded variant of [`XClient::call`].
    pub async fn call_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let rpc_addr = self.discovery.get(self.mode).await?;
        let client = self.dial(&rpc_addr).await?;
        client.call_timeout(service_method, args, timeout).await
    }

    /// Call every known endpoint in parallel.
    ///
    /// The first error cancels the remaining workers and wins; the first
    /// success supplies the returned reply, later successes are ignored.
    /// Returns once every worker has finished. Callers that don't need
    /// the reply can decode into [`serde::de::IgnoredAny`].
    pub async fn broadcast<A, R>(self: &Arc<Self>, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Send + 'static,
    {
        let servers = self.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(RpcError::Discovery("no available servers".to_string()));
        }

        // One encode; every pooled client speaks this XClient's codec.
        let body: Arc<[u8]> = self.options.codec_type.encode(args)?.into();
        let token = CancellationToken::new();
        let state = Arc::new(Mutex::new(BroadcastState::<R> {
            first_err: None,
            reply: None,
        }));

        let mut workers = JoinSet::new();
        for rpc_addr in servers {
            let xclient = self.clone();
            let service_method = service_method.to_string();
            let body = body.clone();
            let token = token.clone();
            let state = state.clone();
            workers.spawn(async move {
                let client = match xclient.dial(&rpc_addr).await {
                    Ok(client) => client,
                    Err(err) => {
                        record_error(&state, &token, err);
                        return;
                    }
                };
                // The send completes unconditionally; cancellation only
                // interrupts the wait, and dropping the call handle
                // unregisters it so a late response is discarded.
                let call = client.go_raw::<R>(&service_method, &body).await;
                let outcome = tokio::select! {
                    _ = token.cancelled() => return,
                    outcome = call.done() => outcome,
                };
                match outcome {
                    Ok(reply) => {
                        let mut state = state.lock().unwrap();
                        if state.reply.is_none() {
                            state.reply = Some(reply);
                        }
                    }
                    Err(err) => record_error(&state, &token, err),
                }
            });
        }
        while workers.join_next().await.is_some() {}

        let mut state = state.lock().unwrap();
        if let Some(err) = state.first_err.take() {
            return Err(err);
        }
        state
            .reply
            .take()
            .ok_or_else(|| RpcError::Discovery("broadcast produced no reply".to_string()))
    }
}

struct BroadcastState<R> {
    first_err: Option<RpcError>,
    reply: Option<R>,
}

fn record_error<R>(
    state: &Mutex<BroadcastState<R>>,
    token: &CancellationToken,
    err: RpcError,
) {
    let mut state = state.lock().unwrap();
    if state.first_err.is_none() {
        state.first_err = Some(err);
        token.cancel();
    }
}
