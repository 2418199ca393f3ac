mod config;
mod connector;
mod error;
mod events;
mod liveness;
mod proxy;
mod session;

pub use config::{ConnectConfig, ListenConfig, ProxyConfig, RelayConfig, RequestLimits};
pub use connector::{CONNECT_ESTABLISHED_REASON, DestinationConnector, Handshake};
pub use error::ProxyError;
pub use events::{SessionEvent, SessionEventKind, SessionEvents, event_channel};
pub use liveness::{Liveness, configure_socket, probe, probe_pair};
pub use proxy::Proxy;
pub use session::{
    CloseReason, MISSING_HOST_MESSAGE, RelaySession, SessionReport, SessionState, Teardown,
};
