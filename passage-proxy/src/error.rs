use passage_net::ParseError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy configuration error: {0}")]
    Config(String),
    #[error("proxy runtime error: {0}")]
    Runtime(String),
    #[error("proxy IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed request: {0}")]
    MalformedRequest(#[from] ParseError),
    #[error("request has no destination host")]
    MissingDestination,
    #[error("destination {host}:{port} unreachable: {source}")]
    DestinationUnreachable {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("relay IO error: {0}")]
    RelayIo(#[source] std::io::Error),
    #[error("liveness probe failed: {0}")]
    LivenessProbe(#[source] std::io::Error),
}
