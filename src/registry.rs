//! HTTP registry: a server directory with TTL-based liveness.
//!
//! Servers POST their `protocol@address` to `/_geerpc_/registry` in the
//! `X-Geerpc-Server` header on a heartbeat interval; clients GET the same
//! path and receive the alive set, lexicographically sorted and
//! comma-separated, in the `X-Geerpc-Servers` header. Expired entries are
//! evicted lazily on each listing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::error::Result;
use crate::protocol::DEFAULT_REGISTRY_PATH;

/// Entries older than this are considered dead.
pub const DEFAULT_REGISTRY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

static SERVERS_HEADER: HeaderName = HeaderName::from_static("x-geerpc-servers");
static SERVER_HEADER: HeaderName = HeaderName::from_static("x-geerpc-server");

/// In-memory map from server address to its last heartbeat time.
pub struct Registry {
    timeout: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// A registry whose entries expire after `timeout`. Zero disables
    /// expiry.
    pub fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            servers: Mutex::new(HashMap::new()),
        })
    }

    /// Register a server or refresh its heartbeat.
    pub fn put_server(&self, addr: &str) {
        self.servers
            .lock()
            .unwrap()
            .insert(addr.to_string(), Instant::now());
    }

    /// The alive set, sorted. Evicts expired entries as it scans.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        let mut alive: Vec<String> = Vec::with_capacity(servers.len());
        servers.retain(|addr, heartbeat| {
            if self.timeout.is_zero() || heartbeat.elapsed() <= self.timeout {
                alive.push(addr.clone());
                true
            } else {
                false
            }
        });
        alive.sort();
        alive
    }

    /// Router exposing the registry at [`DEFAULT_REGISTRY_PATH`].
    ///
    /// GET lists alive servers, POST registers a heartbeat, anything else
    /// is 405.
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(DEFAULT_REGISTRY_PATH, get(list_servers).post(register_server))
            .with_state(self.clone())
    }

    /// Serve the registry on a listener until the task is dropped.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!(path = DEFAULT_REGISTRY_PATH, "rpc registry serving");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

async fn list_servers(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let alive = registry.alive_servers().join(",");
    (StatusCode::OK, [(SERVERS_HEADER.clone(), alive)])
}

async fn register_server(
    State(registry): State<Arc<Registry>>,
    headers: HeaderMap,
) -> StatusCode {
    match headers.get(&SERVER_HEADER).and_then(|value| value.to_str().ok()) {
        Some(addr) if !addr.is_empty() => {
            registry.put_server(addr);
            StatusCode::OK
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Send one heartbeat now, then keep beating on `period` until a send
/// fails. The default period leaves a minute of slack before the default
/// registry timeout.
pub async fn heartbeat(registry_url: &str, addr: &str, period: Option<Duration>) -> Result<()> {
    let period =
        period.unwrap_or_else(|| DEFAULT_REGISTRY_TIMEOUT - Duration::from_secs(60));
    let http = reqwest::Client::new();
    send_heartbeat(&http, registry_url, addr).await?;

    let registry_url = registry_url.to_string();
    let addr = addr.to_string();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await; // first tick fires immediately; already sent
        loop {
            ticker.tick().await;
            if let Err(err) = send_heartbeat(&http, &registry_url, &addr).await {
                tracing::error!(%err, "rpc registry: heartbeat failed, stopping");
                return;
            }
        }
    });
    Ok(())
}

async fn send_heartbeat(http: &reqwest::Client, registry_url: &str, addr: &str) -> Result<()> {
    tracing::debug!(addr, registry_url, "sending heartbeat");
    http.post(registry_url)
        .header(&SERVER_HEADER, addr)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_and_list() {
        let registry = Registry::new(DEFAULT_REGISTRY_TIMEOUT);
        registry.put_server("tcp@127.0.0.1:9002");
        registry.put_server("tcp@127.0.0.1:9001");
        assert_eq!(
            registry.alive_servers(),
            vec!["tcp@127.0.0.1:9001", "tcp@127.0.0.1:9002"]
        );
    }

    #[test]
    fn test_expired_entries_evicted_on_listing() {
        let registry = Registry::new(Duration::from_millis(10));
        registry.put_server("tcp@a");
        std::thread::sleep(Duration::from_millis(30));
        registry.put_server("tcp@b");
        assert_eq!(registry.alive_servers(), vec!["tcp@b"]);
        // The expired entry is gone, not just hidden.
        assert_eq!(registry.servers.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_zero_timeout_never_expires() {
        let registry = Registry::new(Duration::ZERO);
        registry.put_server("tcp@a");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.alive_servers(), vec!["tcp@a"]);
    }

    #[test]
    fn test_heartbeat_refreshes_entry() {
        let registry = Registry::new(Duration::from_millis(40));
        registry.put_server("tcp@a");
        std::thread::sleep(Duration::from_millis(25));
        registry.put_server("tcp@a");
        std::thread::sleep(Duration::from_millis(25));
        assert_eq!(registry.alive_servers(), vec!["tcp@a"]);
    }
}
