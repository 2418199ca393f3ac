use std::io;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

use crate::config::ConnectConfig;

/// Enables `TCP_NODELAY` and OS keepalive so a peer that vanished without a
/// FIN eventually surfaces as a socket error.
pub fn configure_socket(stream: &TcpStream, config: &ConnectConfig) -> io::Result<()> {
    stream.set_nodelay(true)?;
    if config.keepalive_secs == 0 {
        return Ok(());
    }

    let keepalive = TcpKeepalive::new().with_time(config.keepalive());
    #[cfg(any(
        target_os = "android",
        target_os = "freebsd",
        target_os = "linux",
        target_os = "macos",
        windows
    ))]
    let keepalive = if config.keepalive_interval_secs > 0 {
        keepalive.with_interval(config.keepalive_interval())
    } else {
        keepalive
    };
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// How a peer answered a liveness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// Bytes are waiting to be read.
    Readable,
    /// Nothing arrived within the timeout and no error is pending.
    Quiet,
}

/// Checks that the peer of `stream` is still there without writing to it or
/// consuming any of its bytes.
///
/// A pending socket error or an orderly close counts as dead.
pub async fn probe(stream: &TcpStream, timeout: Duration) -> io::Result<Liveness> {
    if let Some(err) = SockRef::from(stream).take_error()? {
        return Err(err);
    }

    let mut byte = [0u8; 1];
    match tokio::time::timeout(timeout, stream.peek(&mut byte)).await {
        Ok(Ok(0)) => Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed the connection",
        )),
        Ok(Ok(_)) => Ok(Liveness::Readable),
        Ok(Err(err)) => Err(err),
        Err(_) => Ok(Liveness::Quiet),
    }
}

/// Checks both ends of a relay at once.
///
/// Returns as soon as either end fails or has bytes waiting, so a quiet peer
/// never delays traffic that is already queued on the other one.
pub async fn probe_pair(
    client: &TcpStream,
    server: &TcpStream,
    timeout: Duration,
) -> io::Result<Liveness> {
    let client_probe = probe(client, timeout);
    let server_probe = probe(server, timeout);
    tokio::pin!(client_probe, server_probe);
    let mut client_done = false;
    let mut server_done = false;

    while !(client_done && server_done) {
        let answer = tokio::select! {
            answer = &mut client_probe, if !client_done => {
                client_done = true;
                answer?
            }
            answer = &mut server_probe, if !server_done => {
                server_done = true;
                answer?
            }
        };
        if answer == Liveness::Readable {
            return Ok(Liveness::Readable);
        }
    }
    Ok(Liveness::Quiet)
}
