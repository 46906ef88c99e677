use std::net::SocketAddr;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerConnected {
        addr: SocketAddr,
    },
    PeerRemoved {
        addr: SocketAddr,
        reason: RemoveReason,
    },
    MessageFailed {
        addr: SocketAddr,
        message: u16,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy)]
pub enum RemoveReason {
    Idle,
    Closed,
}

impl RemoveReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemoveReason::Idle => "went idle",
            RemoveReason::Closed => "closed",
        }
    }
}
