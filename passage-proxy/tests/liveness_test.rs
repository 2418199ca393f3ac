use std::time::Duration;

use passage_proxy::{ConnectConfig, Liveness, configure_socket, probe, probe_pair};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let near = TcpStream::connect(listener.local_addr().unwrap())
        .await
        .unwrap();
    let (far, _) = listener.accept().await.unwrap();
    (near, far)
}

#[tokio::test]
async fn idle_peer_is_alive() {
    let (near, _far) = pair().await;
    let answer = probe(&near, Duration::from_millis(20)).await.unwrap();
    assert_eq!(answer, Liveness::Quiet);
}

#[tokio::test]
async fn closed_peer_is_reported_dead() {
    let (near, far) = pair().await;
    drop(far);

    let err = probe(&near, Duration::from_secs(2)).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn liveness_check_leaves_pending_data_unread() {
    let (mut near, mut far) = pair().await;
    far.write_all(b"data").await.unwrap();

    let answer = probe(&near, Duration::from_secs(2)).await.unwrap();
    assert_eq!(answer, Liveness::Readable);

    let mut buffer = [0u8; 4];
    near.read_exact(&mut buffer).await.unwrap();
    assert_eq!(&buffer, b"data");
}

#[tokio::test]
async fn pending_data_ends_pair_check_without_waiting_for_quiet_peer() {
    let (client, _client_peer) = pair().await;
    let (server, mut server_peer) = pair().await;
    server_peer.write_all(b"x").await.unwrap();

    let started = tokio::time::Instant::now();
    let answer = probe_pair(&client, &server, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(answer, Liveness::Readable);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn pair_check_fails_when_either_peer_is_gone() {
    let (client, client_peer) = pair().await;
    let (server, _server_peer) = pair().await;
    drop(client_peer);

    let err = probe_pair(&client, &server, Duration::from_secs(5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn configures_keepalive_and_nodelay() {
    let (near, _far) = pair().await;
    configure_socket(&near, &ConnectConfig::default()).unwrap();
    assert!(near.nodelay().unwrap());

    let disabled = ConnectConfig {
        keepalive_secs: 0,
        ..ConnectConfig::default()
    };
    configure_socket(&near, &disabled).unwrap();
}
