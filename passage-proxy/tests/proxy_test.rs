use std::time::Duration;

use assert_matches::assert_matches;
use passage_proxy::{CloseReason, Proxy, ProxyConfig, SessionEventKind, SessionEvents};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\nConnection: close\r\n\r\n";

fn test_config(workers: usize) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listen.port = 0;
    config.listen.workers = workers;
    config.connect.timeout_ms = 1_000;
    config.relay.poll_interval_ms = 50;
    config.relay.first_read_timeout_ms = 1_000;
    config.relay.preamble_timeout_ms = 20;
    config
}

async fn start_proxy(
    config: ProxyConfig,
) -> (
    std::net::SocketAddr,
    SessionEvents,
    CancellationToken,
    JoinHandle<Result<(), passage_proxy::ProxyError>>,
) {
    let (proxy, events) = Proxy::bind(config).await.unwrap();
    let addr = proxy.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(proxy.run(shutdown.clone()));
    (addr, events, shutdown, handle)
}

async fn open_tunnel(proxy: std::net::SocketAddr, port: u16) -> TcpStream {
    let mut client = TcpStream::connect(proxy).await.unwrap();
    let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n");
    client.write_all(request.as_bytes()).await.unwrap();
    client
}

#[tokio::test]
async fn relays_through_listener_and_reports_events() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = destination.local_addr().unwrap().port();
    let (proxy_addr, mut events, shutdown, handle) = start_proxy(test_config(2)).await;

    let mut client = open_tunnel(proxy_addr, port).await;
    let (mut upstream, _) = destination.accept().await.unwrap();
    let mut established = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut established).await.unwrap();
    assert_eq!(established, ESTABLISHED);

    upstream.write_all(b"banner").await.unwrap();
    let mut banner = [0u8; 6];
    client.read_exact(&mut banner).await.unwrap();
    assert_eq!(&banner, b"banner");
    drop(client);

    let accepted = events.next().await.unwrap();
    assert_matches!(accepted.kind, SessionEventKind::Accepted { .. });
    let connected = events.next().await.unwrap();
    assert_eq!(connected.session_id, accepted.session_id);
    assert_matches!(
        connected.kind,
        SessionEventKind::Connected { port: p, tunnel: true, .. } if p == port
    );
    let closed = events.next().await.unwrap();
    assert_eq!(closed.session_id, accepted.session_id);
    assert_matches!(
        closed.kind,
        SessionEventKind::Closed {
            reason: CloseReason::ClientClosed,
            server_to_client: 6,
            ..
        }
    );

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn surplus_clients_wait_for_a_free_worker() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = destination.local_addr().unwrap().port();
    let (proxy_addr, _events, shutdown, handle) = start_proxy(test_config(1)).await;

    let first = open_tunnel(proxy_addr, port).await;
    let (_first_upstream, _) = destination.accept().await.unwrap();

    let mut second = open_tunnel(proxy_addr, port).await;
    let waiting = tokio::time::timeout(Duration::from_millis(300), destination.accept()).await;
    assert!(waiting.is_err(), "second client served while worker busy");

    drop(first);
    let (_second_upstream, _) = tokio::time::timeout(Duration::from_secs(5), destination.accept())
        .await
        .unwrap()
        .unwrap();
    let mut established = vec![0u8; ESTABLISHED.len()];
    second.read_exact(&mut established).await.unwrap();
    assert_eq!(established, ESTABLISHED);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn shutdown_closes_open_sessions() {
    let destination = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = destination.local_addr().unwrap().port();
    let (proxy_addr, _events, shutdown, handle) = start_proxy(test_config(4)).await;

    let mut client = open_tunnel(proxy_addr, port).await;
    let (_upstream, _) = destination.accept().await.unwrap();
    let mut established = vec![0u8; ESTABLISHED.len()];
    client.read_exact(&mut established).await.unwrap();

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn bind_rejects_invalid_config() {
    let err = Proxy::bind(test_config(0)).await.err().unwrap();
    assert_matches!(err, passage_proxy::ProxyError::Config(_));
}
