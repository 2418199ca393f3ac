use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use passage_net::{Destination, ParseStatus, ParsedRequest, RequestParser};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug};
use uuid::Uuid;

use crate::config::ProxyConfig;
use crate::connector::DestinationConnector;
use crate::error::ProxyError;
use crate::events::{SessionEvent, SessionEventKind};
use crate::liveness::{Liveness, probe_pair};

pub const MISSING_HOST_MESSAGE: &[u8] = b"request host is empty";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Pending,
    Connected,
    Relaying,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    /// The client went away, or stayed silent, before sending a request.
    Empty,
    MalformedRequest,
    MissingDestination,
    DestinationUnreachable,
    ClientClosed,
    DestinationClosed,
    RelayIo,
    LivenessProbe,
    Shutdown,
}

impl From<&ProxyError> for CloseReason {
    fn from(err: &ProxyError) -> Self {
        match err {
            ProxyError::MalformedRequest(_) => Self::MalformedRequest,
            ProxyError::MissingDestination => Self::MissingDestination,
            ProxyError::DestinationUnreachable { .. } => Self::DestinationUnreachable,
            ProxyError::LivenessProbe(_) => Self::LivenessProbe,
            ProxyError::RelayIo(_)
            | ProxyError::Io(_)
            | ProxyError::Config(_)
            | ProxyError::Runtime(_) => Self::RelayIo,
        }
    }
}

/// Which endpoints a teardown call actually closed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Teardown {
    pub client_closed: bool,
    pub server_closed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub state: SessionState,
    pub reason: CloseReason,
    pub destination: Option<Destination>,
    pub client_to_server: u64,
    pub server_to_client: u64,
    pub teardown: Teardown,
}

/// One proxied client connection, from its first request to teardown.
///
/// The session is the only owner of both sockets. Every path out of
/// [`RelaySession::run`] goes through [`RelaySession::teardown`], which closes
/// each endpoint that was opened and nothing else.
pub struct RelaySession {
    id: Uuid,
    peer: Option<SocketAddr>,
    config: Arc<ProxyConfig>,
    connector: DestinationConnector,
    events: Option<mpsc::Sender<SessionEvent>>,
    client: Option<TcpStream>,
    server: Option<TcpStream>,
    state: SessionState,
    destination: Option<Destination>,
    client_to_server: u64,
    server_to_client: u64,
}

impl RelaySession {
    pub fn new(client: TcpStream, config: Arc<ProxyConfig>) -> Self {
        let peer = client.peer_addr().ok();
        Self {
            id: Uuid::new_v4(),
            peer,
            connector: DestinationConnector::new(&config),
            config,
            events: None,
            client: Some(client),
            server: None,
            state: SessionState::Pending,
            destination: None,
            client_to_server: 0,
            server_to_client: 0,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<SessionEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(&mut self, shutdown: &CancellationToken) -> SessionReport {
        let span = tracing::info_span!("session", id = %self.id, peer = ?self.peer);
        async {
            if let Some(peer) = self.peer {
                self.emit(SessionEventKind::Accepted { peer }).await;
            }

            let result = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Ok(CloseReason::Shutdown),
                result = self.drive() => result,
            };
            let reason = match result {
                Ok(reason) => reason,
                Err(err) => {
                    debug!(error = %err, "session failed");
                    CloseReason::from(&err)
                }
            };

            let teardown = self.teardown().await;
            debug!(
                ?reason,
                client_to_server = self.client_to_server,
                server_to_client = self.server_to_client,
                "session closed"
            );
            self.emit(SessionEventKind::Closed {
                reason,
                client_to_server: self.client_to_server,
                server_to_client: self.server_to_client,
            })
            .await;

            SessionReport {
                session_id: self.id,
                state: self.state,
                reason,
                destination: self.destination.clone(),
                client_to_server: self.client_to_server,
                server_to_client: self.server_to_client,
                teardown,
            }
        }
        .instrument(span)
        .await
    }

    /// Closes whichever endpoints are still open. Later calls close nothing.
    pub async fn teardown(&mut self) -> Teardown {
        let mut teardown = Teardown::default();
        if let Some(mut server) = self.server.take() {
            let _ = server.shutdown().await;
            teardown.server_closed = true;
        }
        if let Some(mut client) = self.client.take() {
            let _ = client.shutdown().await;
            teardown.client_closed = true;
        }
        self.state = SessionState::Closed;
        teardown
    }

    async fn drive(&mut self) -> Result<CloseReason, ProxyError> {
        let Some(request) = self.read_request().await? else {
            return Ok(CloseReason::Empty);
        };
        debug!(method = %request.method, target = %request.target, "request parsed");

        let Some(destination) = request.destination.clone() else {
            let client = self.client_mut()?;
            client.write_all(MISSING_HOST_MESSAGE).await?;
            client.flush().await?;
            return Ok(CloseReason::MissingDestination);
        };
        self.destination = Some(destination.clone());

        // Stored before the handshake so teardown closes it on every path.
        self.server = Some(self.connector.connect(&request).await?);
        self.state = SessionState::Connected;

        let client = self
            .client
            .as_mut()
            .ok_or_else(|| ProxyError::Runtime("client endpoint missing".to_string()))?;
        let handshake = self.connector.handshake(&request, client).await?;

        if !handshake.preamble.is_empty() {
            let server = self
                .server
                .as_mut()
                .ok_or_else(|| ProxyError::Runtime("destination endpoint missing".to_string()))?;
            server
                .write_all(&handshake.preamble)
                .await
                .map_err(ProxyError::RelayIo)?;
            self.client_to_server += handshake.preamble.len() as u64;
        }
        self.emit(SessionEventKind::Connected {
            host: destination.host,
            port: destination.port,
            tunnel: handshake.tunnel,
        })
        .await;

        self.relay().await
    }

    async fn read_request(&mut self) -> Result<Option<ParsedRequest>, ProxyError> {
        let mut parser = RequestParser::with_limits(self.config.parser_limits());
        let mut temp = vec![0u8; self.config.relay.buffer_size];
        let deadline = tokio::time::Instant::now() + self.config.relay.first_read_timeout();
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| ProxyError::Runtime("client endpoint missing".to_string()))?;

        let status = loop {
            let n = match tokio::time::timeout_at(deadline, client.read(&mut temp)).await {
                Ok(read) => read?,
                Err(_) => 0,
            };
            if n == 0 {
                if parser.buffered() == 0 {
                    return Ok(None);
                }
                break parser.finish();
            }
            match parser.push(&temp[..n]) {
                ParseStatus::NeedMore { .. } => continue,
                other => break other,
            }
        };

        match status {
            ParseStatus::Complete { message, warnings } => {
                for warning in warnings {
                    debug!(?warning, "request parse warning");
                }
                Ok(Some(message))
            }
            ParseStatus::Error { error, .. } => Err(ProxyError::MalformedRequest(error)),
            ParseStatus::NeedMore { .. } => {
                Err(ProxyError::Runtime("request head incomplete".to_string()))
            }
        }
    }

    /// Copies bytes both ways until one side ends, fails, or stops answering
    /// liveness probes.
    async fn relay(&mut self) -> Result<CloseReason, ProxyError> {
        let (Some(client), Some(server)) = (self.client.as_mut(), self.server.as_mut()) else {
            return Err(ProxyError::Runtime("relay started without both endpoints".to_string()));
        };
        self.state = SessionState::Relaying;

        let relay = &self.config.relay;
        let mut client_buffer = vec![0u8; relay.buffer_size];
        let mut server_buffer = vec![0u8; relay.buffer_size];
        let period = relay.poll_interval().max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut idle = IdleTracker::new(relay.idle_threshold);

        loop {
            tokio::select! {
                read = server.read(&mut server_buffer) => {
                    let n = read.map_err(ProxyError::RelayIo)?;
                    if n == 0 {
                        return Ok(CloseReason::DestinationClosed);
                    }
                    client
                        .write_all(&server_buffer[..n])
                        .await
                        .map_err(ProxyError::RelayIo)?;
                    self.server_to_client += n as u64;
                    idle.record_traffic();
                }
                read = client.read(&mut client_buffer) => {
                    let n = read.map_err(ProxyError::RelayIo)?;
                    if n == 0 {
                        return Ok(CloseReason::ClientClosed);
                    }
                    server
                        .write_all(&client_buffer[..n])
                        .await
                        .map_err(ProxyError::RelayIo)?;
                    self.client_to_server += n as u64;
                    idle.record_traffic();
                }
                _ = ticker.tick() => {
                    if !idle.tick() {
                        continue;
                    }
                    debug!(idle_cycles = idle.idle_cycles(), "checking idle peers");
                    check_peers(client, server, relay.probe_timeout()).await?;
                    idle.reset();
                }
            }
        }
    }

    fn client_mut(&mut self) -> Result<&mut TcpStream, ProxyError> {
        self.client
            .as_mut()
            .ok_or_else(|| ProxyError::Runtime("client endpoint missing".to_string()))
    }

    async fn emit(&self, kind: SessionEventKind) {
        if let Some(events) = &self.events {
            let _ = events.send(SessionEvent::now(self.id, kind)).await;
        }
    }
}

/// Counts poll ticks that saw no traffic in either direction.
#[derive(Debug)]
struct IdleTracker {
    threshold: u32,
    idle_cycles: u32,
    active: bool,
}

impl IdleTracker {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            idle_cycles: 0,
            active: false,
        }
    }

    fn record_traffic(&mut self) {
        self.active = true;
    }

    /// Closes one tick. Returns true once the idle count passes the threshold.
    fn tick(&mut self) -> bool {
        if std::mem::take(&mut self.active) {
            self.idle_cycles = 0;
            return false;
        }
        self.idle_cycles += 1;
        self.idle_cycles > self.threshold
    }

    fn idle_cycles(&self) -> u32 {
        self.idle_cycles
    }

    fn reset(&mut self) {
        self.idle_cycles = 0;
    }
}

/// Fails with [`ProxyError::LivenessProbe`] when either peer is gone.
///
/// The relay reads stay armed while idle, so an orderly close usually ends the
/// session as `ClientClosed` or `DestinationClosed` first. This catches peers
/// whose loss only shows up as a socket error, such as a keepalive timeout.
async fn check_peers(
    client: &TcpStream,
    server: &TcpStream,
    timeout: Duration,
) -> Result<Liveness, ProxyError> {
    probe_pair(client, server, timeout)
        .await
        .map_err(ProxyError::LivenessProbe)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use tokio::net::{TcpListener, TcpStream};

    use super::{CloseReason, IdleTracker, check_peers};
    use crate::error::ProxyError;
    use crate::liveness::Liveness;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let near = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (far, _) = listener.accept().await.unwrap();
        (near, far)
    }

    #[test]
    fn idle_ticks_trigger_check_after_threshold() {
        let mut idle = IdleTracker::new(2);
        assert!(!idle.tick());
        assert!(!idle.tick());
        assert!(idle.tick());
        assert_eq!(idle.idle_cycles(), 3);

        idle.reset();
        assert!(!idle.tick());
    }

    #[test]
    fn traffic_resets_idle_count() {
        let mut idle = IdleTracker::new(1);
        assert!(!idle.tick());
        idle.record_traffic();
        assert!(!idle.tick());
        assert_eq!(idle.idle_cycles(), 0);
        assert!(!idle.tick());
        assert!(idle.tick());
    }

    #[test]
    fn zero_threshold_checks_on_first_idle_tick() {
        let mut idle = IdleTracker::new(0);
        assert!(idle.tick());
    }

    #[tokio::test]
    async fn lost_destination_closes_as_liveness_failure() {
        let (client, _client_peer) = pair().await;
        let (server, server_peer) = pair().await;
        drop(server_peer);

        let err = check_peers(&client, &server, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_matches!(err, ProxyError::LivenessProbe(_));
        assert_eq!(CloseReason::from(&err), CloseReason::LivenessProbe);
    }

    #[tokio::test]
    async fn quiet_peers_pass_check() {
        let (client, _client_peer) = pair().await;
        let (server, _server_peer) = pair().await;

        let answer = check_peers(&client, &server, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(answer, Liveness::Quiet);
    }
}
