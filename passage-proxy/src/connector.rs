use std::io;
use std::time::Duration;

use passage_net::{Destination, ParsedRequest};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::config::{ConnectConfig, ProxyConfig};
use crate::error::ProxyError;
use crate::liveness::configure_socket;

pub const CONNECT_ESTABLISHED_REASON: &str = "Connection Established";

/// What the destination must receive before relaying starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub preamble: Vec<u8>,
    pub tunnel: bool,
}

#[derive(Debug, Clone)]
pub struct DestinationConnector {
    connect: ConnectConfig,
    preamble_timeout: Duration,
    buffer_size: usize,
}

impl DestinationConnector {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            connect: config.connect.clone(),
            preamble_timeout: config.relay.preamble_timeout(),
            buffer_size: config.relay.buffer_size,
        }
    }

    /// Opens the destination named by `request`. Nothing is written to the
    /// client here; the caller takes ownership of the socket before
    /// [`DestinationConnector::handshake`] runs.
    pub async fn connect(&self, request: &ParsedRequest) -> Result<TcpStream, ProxyError> {
        let destination = request
            .destination
            .as_ref()
            .ok_or(ProxyError::MissingDestination)?;
        self.open(destination).await
    }

    /// Completes the client side once the destination is open.
    ///
    /// Forwarded requests get their original bytes back as the preamble. For
    /// CONNECT the established line is written to `client`, and the preamble is
    /// whatever tunneled data the client sent along with or right after the
    /// handshake.
    pub async fn handshake<C>(
        &self,
        request: &ParsedRequest,
        client: &mut C,
    ) -> Result<Handshake, ProxyError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        if !request.is_tunnel() {
            return Ok(Handshake {
                preamble: request.raw.clone(),
                tunnel: false,
            });
        }

        client
            .write_all(&connect_established(request.version.as_str()))
            .await?;
        client.flush().await?;

        let preamble = if request.body.is_empty() {
            self.read_preamble(client).await?
        } else {
            request.body.clone()
        };

        Ok(Handshake {
            preamble,
            tunnel: true,
        })
    }

    async fn open(&self, destination: &Destination) -> Result<TcpStream, ProxyError> {
        let unreachable = |source| ProxyError::DestinationUnreachable {
            host: destination.host.clone(),
            port: destination.port,
            source,
        };

        let connecting = TcpStream::connect((destination.host.as_str(), destination.port));
        let stream = match tokio::time::timeout(self.connect.timeout(), connecting).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => return Err(unreachable(err)),
            Err(_) => {
                return Err(unreachable(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "connect timed out",
                )));
            }
        };

        if let Err(err) = configure_socket(&stream, &self.connect) {
            debug!(%destination, error = %err, "could not tune destination socket");
        }
        debug!(%destination, "destination connected");
        Ok(stream)
    }

    async fn read_preamble<C>(&self, client: &mut C) -> Result<Vec<u8>, ProxyError>
    where
        C: AsyncRead + Unpin,
    {
        if self.preamble_timeout.is_zero() {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; self.buffer_size];
        match tokio::time::timeout(self.preamble_timeout, client.read(&mut buffer)).await {
            Ok(Ok(n)) => {
                buffer.truncate(n);
                Ok(buffer)
            }
            Ok(Err(err)) => Err(ProxyError::RelayIo(err)),
            // Server-speaks-first protocols send nothing here.
            Err(_) => Ok(Vec::new()),
        }
    }
}

pub fn connect_established(version: &str) -> Vec<u8> {
    format!("{version} 200 {CONNECT_ESTABLISHED_REASON}\r\nConnection: close\r\n\r\n").into_bytes()
}
