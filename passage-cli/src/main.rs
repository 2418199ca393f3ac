use clap::Parser;
use std::path::PathBuf;

use passage_proxy::{Proxy, ProxyConfig, SessionEventKind, SessionEvents};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "passage", about = "Forward HTTP and CONNECT proxy")]
struct Cli {
    /// Port to listen on. Required without --config; with a config file it
    /// overrides `[listen] port`, which defaults to 8080.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    host: Option<String>,
    /// Maximum number of sessions relayed at once.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), String> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let (proxy, events) = Proxy::bind(config).await.map_err(|err| err.to_string())?;
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
        }
        signal_token.cancel();
    });

    let events_task = tokio::spawn(log_events(events));
    let proxy_task = tokio::spawn(proxy.run(shutdown));

    let result = proxy_task.await.map_err(|err| err.to_string())?;
    events_task.abort();
    result.map_err(|err| err.to_string())
}

fn build_config(cli: &Cli) -> Result<ProxyConfig, String> {
    let mut config = match &cli.config {
        Some(path) => ProxyConfig::load(path).map_err(|err| err.to_string())?,
        None => {
            if cli.port.is_none() {
                return Err("--port is required when no --config is given".to_string());
            }
            ProxyConfig::default()
        }
    };

    if let Some(port) = cli.port {
        config.listen.port = port;
    }
    if let Some(host) = &cli.host {
        config.listen.host = host.clone();
    }
    if let Some(workers) = cli.workers {
        config.listen.workers = workers;
    }
    config.validate().map_err(|err| err.to_string())?;
    Ok(config)
}

async fn log_events(mut events: SessionEvents) {
    while let Some(event) = events.next().await {
        match event.kind {
            SessionEventKind::Accepted { peer } => {
                debug!(session = %event.session_id, %peer, "accepted");
            }
            SessionEventKind::Connected { host, port, tunnel } => {
                info!(session = %event.session_id, %host, port, tunnel, "connected");
            }
            SessionEventKind::Closed {
                reason,
                client_to_server,
                server_to_client,
            } => {
                info!(
                    session = %event.session_id,
                    ?reason,
                    client_to_server,
                    server_to_client,
                    "closed"
                );
            }
        }
    }
}
