//! Endpoint discovery: where a load-balanced client finds its servers.
//!
//! [`MultiServersDiscovery`] serves a static list; [`RegistryDiscovery`]
//! refreshes the list from a registry's GET endpoint. Both share state
//! behind a mutex so `update` is visible to every holder.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{Result, RpcError};

/// Endpoint selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Pick a random endpoint.
    Random,
    /// Cycle through endpoints in order.
    RoundRobin,
}

/// Read-only source of `protocol@address` endpoints.
pub trait Discovery: Send + Sync {
    /// Re-fetch the endpoint list from its origin, if it has one.
    fn refresh(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Replace the endpoint list.
    fn update(&self, servers: Vec<String>) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Pick one endpoint according to the selection policy.
    fn get(&self, mode: SelectMode) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Snapshot of every known endpoint.
    fn get_all(&self) -> impl std::future::Future<Output = Result<Vec<String>>> + Send;
}

struct ServerList {
    servers: Vec<String>,
    /// Round-robin cursor, randomly seeded so clients don't herd onto the
    /// same first endpoint.
    index: usize,
}

/// Discovery over a fixed, caller-maintained server list.
pub struct MultiServersDiscovery {
    state: Mutex<ServerList>,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        let index = rand::thread_rng().gen_range(0..u32::MAX as usize);
        Self {
            state: Mutex::new(ServerList { servers, index }),
        }
    }
}

impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.state.lock().unwrap().servers = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        let n = state.servers.len();
        if n == 0 {
            return Err(RpcError::Discovery("no available servers".to_string()));
        }
        match mode {
            SelectMode::Random => {
                Ok(state.servers[rand::thread_rng().gen_range(0..n)].clone())
            }
            SelectMode::RoundRobin => {
                let server = state.servers[state.index % n].clone();
                state.index = (state.index + 1) % n;
                Ok(server)
            }
        }
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().unwrap().servers.clone())
    }
}

/// How long a fetched server list stays fresh before the next `get`
/// triggers a refresh.
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(10);

/// Discovery backed by a registry's HTTP listing endpoint.
///
/// The alive set travels in the `X-Geerpc-Servers` response header as a
/// comma-separated list.
pub struct RegistryDiscovery {
    servers: MultiServersDiscovery,
    registry: String,
    update_interval: Duration,
    last_update: Mutex<Option<Instant>>,
    http: reqwest::Client,
}

impl RegistryDiscovery {
    pub fn new(registry_url: impl Into<String>, update_interval: Option<Duration>) -> Self {
        Self {
            servers: MultiServersDiscovery::new(Vec::new()),
            registry: registry_url.into(),
            update_interval: update_interval.unwrap_or(DEFAULT_UPDATE_INTERVAL),
            last_update: Mutex::new(None),
            http: reqwest::Client::new(),
        }
    }

    fn is_fresh(&self) -> bool {
        self.last_update
            .lock()
            .unwrap()
            .is_some_and(|at| at.elapsed() < self.update_interval)
    }

    fn mark_updated(&self) {
        *self.last_update.lock().unwrap() = Some(Instant::now());
    }

    async fn refresh_if_stale(&self) -> Result<()> {
        if self.is_fresh() {
            return Ok(());
        }
        tracing::debug!(registry = %self.registry, "rpc discovery: refreshing server list");
        let response = self.http.get(&self.registry).send().await?;
        let listed = response
            .headers()
            .get("X-Geerpc-Servers")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let servers: Vec<String> = listed
            .split(',')
            .map(str::trim)
            .filter(|server| !server.is_empty())
            .map(str::to_string)
            .collect();
        self.servers.update(servers).await?;
        self.mark_updated();
        Ok(())
    }
}

impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        // Forced refresh ignores the freshness window.
        *self.last_update.lock().unwrap() = None;
        self.refresh_if_stale().await
    }

    async fn update(&self, servers: Vec<String>) -> Result<()> {
        self.servers.update(servers).await?;
        self.mark_updated();
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh_if_stale().await?;
        self.servers.get(mode).await
    }

    async fn get_all(&self) -> Result<Vec<String>> {
        self.refresh_if_stale().await?;
        self.servers.get_all().await
    }
}
