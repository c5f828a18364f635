//! End-to-end demo: registry, two servers with heartbeats, and a
//! load-balanced client that calls and broadcasts over both.
//!
//! ```sh
//! cargo run --example arith
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use geerpc::{
    heartbeat, Options, Registry, RegistryDiscovery, SelectMode, Server, Service, XClient,
};

#[derive(Serialize, Deserialize)]
struct Args {
    a: i32,
    b: i32,
}

async fn start_server(registry_url: &str) -> geerpc::Result<()> {
    let server = Arc::new(Server::new());
    server.register(
        Service::new("Arith").method("Sum", |args: Args| async move { Ok(args.a + args.b) }),
    )?;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(server.accept(listener));
    heartbeat(registry_url, &format!("tcp@{addr}"), None).await
}

#[tokio::main]
async fn main() -> geerpc::Result<()> {
    tracing_subscriber::fmt::init();

    let registry = Registry::new(Duration::from_secs(300));
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let registry_addr = listener.local_addr()?;
    tokio::spawn(registry.clone().serve(listener));
    let registry_url = format!("http://{registry_addr}/_geerpc_/registry");

    start_server(&registry_url).await?;
    start_server(&registry_url).await?;

    let discovery = RegistryDiscovery::new(&registry_url, None);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    for i in 0..5 {
        let sum: i32 = xclient.call("Arith.Sum", &Args { a: i, b: i * i }).await?;
        println!("Arith.Sum({i}, {}) = {sum}", i * i);
    }

    let everywhere: i32 = xclient.broadcast("Arith.Sum", &Args { a: 20, b: 22 }).await?;
    println!("broadcast Arith.Sum = {everywhere}");

    xclient.close().await;
    Ok(())
}
