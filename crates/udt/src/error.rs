use std::io;
use std::net::SocketAddr;

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("datagram too short: need {needed} bytes, got {actual}")]
    Truncated { needed: usize, actual: usize },
    #[error("unknown control kind {0:#04x}")]
    UnknownControlKind(u8),
    #[error("message part {part} of {count} is out of range")]
    InvalidMessagePart { part: u16, count: u16 },
}

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("payload of {size} bytes exceeds datagram limit of {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("connection to {0} refused")]
    ConnectionRefused(SocketAddr),
    #[error("invalid socket configuration: {0}")]
    InvalidConfig(String),
}
