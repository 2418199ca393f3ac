use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use crate::session::CloseReason;

pub type SessionEvents = ReceiverStream<SessionEvent>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEvent {
    pub session_id: Uuid,
    pub at: String,
    pub kind: SessionEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionEventKind {
    Accepted {
        peer: SocketAddr,
    },
    Connected {
        host: String,
        port: u16,
        tunnel: bool,
    },
    Closed {
        reason: CloseReason,
        client_to_server: u64,
        server_to_client: u64,
    },
}

impl SessionEvent {
    pub fn now(session_id: Uuid, kind: SessionEventKind) -> Self {
        Self {
            session_id,
            at: chrono::Utc::now().to_rfc3339(),
            kind,
        }
    }
}

pub fn event_channel() -> (mpsc::Sender<SessionEvent>, SessionEvents) {
    let (sender, receiver) = mpsc::channel(50_000);
    (sender, ReceiverStream::new(receiver))
}
