//! End-to-end tests over real loopback connections.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use geerpc::server::MethodDescriptor;
use geerpc::{
    heartbeat, Client, CodecType, Discovery, MethodError, MultiServersDiscovery, Options,
    Registry, RegistryDiscovery, RpcError, SelectMode, Server, Service, XClient,
};

#[derive(Serialize, Deserialize, Clone, Copy)]
struct Args {
    a: i32,
    b: i32,
}

fn arith_service() -> Service {
    Service::new("Arith")
        .method("Sum", |args: Args| async move { Ok(args.a + args.b) })
        .method("Div", |args: Args| async move {
            if args.b == 0 {
                return Err(MethodError::new("divide by zero"));
            }
            Ok(args.a / args.b)
        })
        .method("Sleep", |ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        })
}

/// Bind an arith server on an ephemeral port; returns its address and the
/// `Sum` descriptor for call-counter assertions.
async fn start_server() -> (String, Arc<MethodDescriptor>) {
    let service = arith_service();
    let sum = service.method_descriptor("Sum").unwrap();
    let server = Arc::new(Server::new());
    server.register(service).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.accept(listener));
    (addr, sum)
}

#[tokio::test]
async fn test_call_roundtrip_and_counter() {
    let (addr, sum) = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let reply: i32 = client.call("Arith.Sum", &Args { a: 1, b: 2 }).await.unwrap();
    assert_eq!(reply, 3);
    assert_eq!(sum.num_calls(), 1);
}

#[tokio::test]
async fn test_method_error_reaches_caller() {
    let (addr, _) = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call::<_, i32>("Arith.Div", &Args { a: 1, b: 0 })
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::Remote(_)));
    assert!(err.to_string().contains("divide by zero"));

    let ok: i32 = client.call("Arith.Div", &Args { a: 6, b: 3 }).await.unwrap();
    assert_eq!(ok, 2);
}

#[tokio::test]
async fn test_unknown_service_keeps_connection_usable() {
    let (addr, _) = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call::<_, i32>("Nope.X", &Args { a: 1, b: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("service"));

    let reply: i32 = client.call("Arith.Sum", &Args { a: 4, b: 5 }).await.unwrap();
    assert_eq!(reply, 9);
}

#[tokio::test]
async fn test_unknown_method_keeps_connection_usable() {
    let (addr, _) = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call::<_, i32>("Arith.Mod", &Args { a: 1, b: 2 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("can't find method"));

    let reply: i32 = client.call("Arith.Sum", &Args { a: 1, b: 1 }).await.unwrap();
    assert_eq!(reply, 2);
}

#[tokio::test]
async fn test_hundred_concurrent_calls_contiguous_seqs() {
    let (addr, sum) = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    // Issue all hundred before resolving any.
    let mut calls = Vec::new();
    for i in 0..100i32 {
        let call = client.go::<_, i32>("Arith.Sum", &Args { a: i, b: i }).await;
        calls.push((i, call));
    }

    let mut seqs: Vec<u64> = calls.iter().map(|(_, call)| call.seq()).collect();
    seqs.sort_unstable();
    assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());

    for (i, call) in calls {
        assert_eq!(call.done().await.unwrap(), i * 2);
    }
    assert_eq!(sum.num_calls(), 100);
}

#[tokio::test]
async fn test_parallel_callers_share_one_connection() {
    let (addr, _) = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..50i32 {
        let client = client.clone();
        tasks.spawn(async move {
            let reply: i32 = client.call("Arith.Sum", &Args { a: i, b: 1 }).await.unwrap();
            assert_eq!(reply, i + 1);
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }
}

#[tokio::test]
async fn test_server_handle_timeout_keeps_connection_usable() {
    let (addr, _) = start_server().await;
    let options = Options {
        handle_timeout: Duration::from_millis(100),
        ..Options::default()
    };
    let client = Client::dial(&addr, options).await.unwrap();

    let err = client.call::<_, u64>("Arith.Sleep", &500u64).await.unwrap_err();
    assert!(err.to_string().contains("timeout"));

    let reply: i32 = client.call("Arith.Sum", &Args { a: 2, b: 2 }).await.unwrap();
    assert_eq!(reply, 4);
}

#[tokio::test]
async fn test_client_call_timeout_keeps_connection_usable() {
    let (addr, _) = start_server().await;
    let client = Client::dial(&addr, Options::default()).await.unwrap();

    let err = client
        .call_timeout::<_, u64>("Arith.Sleep", &500u64, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RpcError::CallTimeout(_)));

    let reply: i32 = client.call("Arith.Sum", &Args { a: 3, b: 4 }).await.unwrap();
    assert_eq!(reply, 7);
}

#[tokio::test]
async fn test_json_codec_roundtrip() {
    let (addr, _) = start_server().await;
    let options = Options {
        codec_type: CodecType::Json,
        ..Options::default()
    };
    let client = Client::dial(&addr, options).await.unwrap();

    let reply: i32 = client.call("Arith.Sum", &Args { a: 10, b: 20 }).await.unwrap();
    assert_eq!(reply, 30);
}

#[tokio::test]
async fn test_bad_magic_number_closes_silently() {
    let (addr, _) = start_server().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(
            b"{\"MagicNumber\":1,\"CodecType\":\"application/msgpack\",\"ConnectTimeout\":0,\"HandleTimeout\":0}\n",
        )
        .await
        .unwrap();

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "server must close without writing");
}

#[tokio::test]
async fn test_unknown_codec_tag_closes_silently() {
    let (addr, _) = start_server().await;
    let mut stream = TcpStream::connect(&addr).await.unwrap();
    stream
        .write_all(
            b"{\"MagicNumber\":3927900,\"CodecType\":\"application/gob\",\"ConnectTimeout\":0,\"HandleTimeout\":0}\n",
        )
        .await
        .unwrap();

    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "server must close without writing");
}

#[tokio::test]
async fn test_http_connect_tunnel() {
    let service = arith_service();
    let server = Arc::new(Server::new());
    server.register(service).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.accept_http(listener));

    let client = Client::xdial(&format!("http@{addr}"), Options::default())
        .await
        .unwrap();
    let reply: i32 = client.call("Arith.Sum", &Args { a: 8, b: 9 }).await.unwrap();
    assert_eq!(reply, 17);
}

#[cfg(unix)]
#[tokio::test]
async fn test_unix_socket_transport() {
    let dir = std::env::temp_dir().join(format!("geerpc-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("arith.sock");
    let _ = std::fs::remove_file(&path);

    let server = Arc::new(Server::new());
    server.register(arith_service()).unwrap();
    let listener = tokio::net::UnixListener::bind(&path).unwrap();
    tokio::spawn(server.accept_unix(listener));

    let client = Client::xdial(&format!("unix@{}", path.display()), Options::default())
        .await
        .unwrap();
    let reply: i32 = client.call("Arith.Sum", &Args { a: 20, b: 22 }).await.unwrap();
    assert_eq!(reply, 42);
}

#[tokio::test]
async fn test_xclient_call_over_pool() {
    let (addr_a, _) = start_server().await;
    let (addr_b, _) = start_server().await;

    let discovery = MultiServersDiscovery::new(vec![
        format!("tcp@{addr_a}"),
        format!("tcp@{addr_b}"),
    ]);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());

    for i in 0..10i32 {
        let reply: i32 = xclient.call("Arith.Sum", &Args { a: i, b: i }).await.unwrap();
        assert_eq!(reply, i * 2);
    }
    xclient.close().await;
}

/// One endpoint whose `Arith.Maybe` either errors immediately or sleeps
/// then echoes its argument.
async fn start_maybe_server(ok_after_ms: Option<u64>) -> String {
    let service = Service::new("Arith").method("Maybe", move |x: i32| async move {
        match ok_after_ms {
            Some(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(x)
            }
            None => Err(MethodError::new("boom")),
        }
    });
    let server = Arc::new(Server::new());
    server.register(service).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(server.accept(listener));
    addr
}

#[tokio::test]
async fn test_broadcast_all_succeed() {
    let a = start_maybe_server(Some(0)).await;
    let b = start_maybe_server(Some(0)).await;
    let c = start_maybe_server(Some(0)).await;

    let discovery = MultiServersDiscovery::new(vec![
        format!("tcp@{a}"),
        format!("tcp@{b}"),
        format!("tcp@{c}"),
    ]);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let reply: i32 = xclient.broadcast("Arith.Maybe", &7).await.unwrap();
    assert_eq!(reply, 7);
}

#[tokio::test]
async fn test_broadcast_first_error_wins() {
    let a = start_maybe_server(Some(200)).await;
    let b = start_maybe_server(Some(200)).await;
    let c = start_maybe_server(None).await; // errors immediately

    let discovery = MultiServersDiscovery::new(vec![
        format!("tcp@{a}"),
        format!("tcp@{b}"),
        format!("tcp@{c}"),
    ]);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    let started = std::time::Instant::now();
    let err = xclient.broadcast::<_, i32>("Arith.Maybe", &7).await.unwrap_err();
    assert!(err.to_string().contains("boom"));
    // Cancellation aborts the sleepers; the fan-out must not wait them out.
    assert!(started.elapsed() < Duration::from_millis(200));
}

#[tokio::test]
async fn test_broadcast_ignoring_reply() {
    let a = start_maybe_server(Some(0)).await;
    let b = start_maybe_server(Some(0)).await;

    let discovery =
        MultiServersDiscovery::new(vec![format!("tcp@{a}"), format!("tcp@{b}")]);
    let xclient = XClient::new(discovery, SelectMode::Random, Options::default());

    xclient
        .broadcast::<_, serde::de::IgnoredAny>("Arith.Maybe", &1)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_registry_expiry() {
    let registry = Registry::new(Duration::from_millis(50));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(registry.clone().serve(listener));
    let url = format!("http://{addr}/_geerpc_/registry");

    // Long heartbeat periods: each server beats exactly once here.
    let hour = Some(Duration::from_secs(3600));
    heartbeat(&url, "tcp@a", hour).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    heartbeat(&url, "tcp@b", hour).await.unwrap();

    let discovery = RegistryDiscovery::new(&url, None);
    assert_eq!(discovery.get_all().await.unwrap(), vec!["tcp@b"]);
}

#[tokio::test]
async fn test_registry_backed_discovery_serves_calls() {
    let (addr, _) = start_server().await;

    let registry = Registry::new(Duration::from_secs(60));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let registry_addr = listener.local_addr().unwrap();
    tokio::spawn(registry.clone().serve(listener));
    let url = format!("http://{registry_addr}/_geerpc_/registry");

    heartbeat(&url, &format!("tcp@{addr}"), Some(Duration::from_secs(3600)))
        .await
        .unwrap();

    let discovery = RegistryDiscovery::new(&url, None);
    let xclient = XClient::new(discovery, SelectMode::RoundRobin, Options::default());
    let reply: i32 = xclient.call("Arith.Sum", &Args { a: 30, b: 12 }).await.unwrap();
    assert_eq!(reply, 42);
}
