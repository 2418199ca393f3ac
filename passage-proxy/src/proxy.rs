use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::events::{SessionEvent, SessionEvents, event_channel};
use crate::liveness::configure_socket;
use crate::session::RelaySession;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepts client connections and runs one [`RelaySession`] per connection,
/// never more than `listen.workers` at a time.
pub struct Proxy {
    listener: TcpListener,
    config: Arc<ProxyConfig>,
    sender: mpsc::Sender<SessionEvent>,
    workers: Arc<Semaphore>,
}

impl Proxy {
    pub async fn bind(config: ProxyConfig) -> Result<(Self, SessionEvents), ProxyError> {
        config.validate()?;
        let addr = config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|err| ProxyError::Runtime(format!("bind {addr}: {err}")))?;
        let (sender, events) = event_channel();
        let workers = Arc::new(Semaphore::new(config.listen.workers));

        Ok((
            Self {
                listener,
                config: Arc::new(config),
                sender,
                workers,
            },
            events,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProxyError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ProxyError> {
        info!(
            addr = %self.local_addr()?,
            workers = self.config.listen.workers,
            "proxy listening"
        );
        let mut sessions = JoinSet::new();

        loop {
            // Waiting for a worker before accepting leaves surplus clients in
            // the listen backlog.
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = joined {
                        warn!(error = %err, "session task failed");
                    }
                    continue;
                }
                permit = Arc::clone(&self.workers).acquire_owned() => permit
                    .map_err(|err| ProxyError::Runtime(err.to_string()))?,
            };

            let (stream, peer) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(error = %err, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            if let Err(err) = configure_socket(&stream, &self.config.connect) {
                debug!(%peer, error = %err, "could not tune client socket");
            }

            let config = Arc::clone(&self.config);
            let sender = self.sender.clone();
            let shutdown = shutdown.clone();
            sessions.spawn(async move {
                let _permit = permit;
                let mut session = RelaySession::new(stream, config).with_events(sender);
                session.run(&shutdown).await
            });
        }

        let in_flight = sessions.len();
        if in_flight > 0 {
            info!(in_flight, "waiting for sessions to close");
        }
        while let Some(joined) = sessions.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "session task failed");
            }
        }
        info!("proxy stopped");
        Ok(())
    }
}
