pub mod buffer;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod pacer;
pub mod protocol;
pub mod sequence;
pub mod socket;
pub mod stats;
pub mod tracking;

pub use buffer::{ByteBuffer, ByteBufferMut};
pub use config::{
    DEFAULT_CONTROL_INTERVAL, DEFAULT_MAX_DATAGRAM_SIZE, DEFAULT_PORT, MAX_DATAGRAM_SIZE,
    MIN_DATAGRAM_SIZE, SocketConfig, TrackerConfig,
};
pub use connection::{Connection, ConnectionFilter, ConnectionTable, Delivery, DeliveryOrder};
pub use error::{PacketError, SocketError};
pub use message::{CompletedMessage, MessageAssembler, split_message};
pub use pacer::{ControlPacer, PacerStopHandle, sleep_budget};
pub use protocol::{
    ControlKind, ControlSummary, HEADER_SIZE, MESSAGE_HEADER_SIZE, MIN_CONTROL_SIZE, MessagePart,
    PacketFlags, PacketHeader, frame_datagram, parse_datagram,
};
pub use sequence::{SEQUENCE_SPACE, SequenceNumber, circular_distance, sequence_greater_than};
pub use socket::{MAX_DATAGRAMS_PER_RECEIVE, PacerHandle, Socket};
pub use stats::{ConnectionStats, NetworkStats, PacketLossSimulation};
pub use tracking::{Arrival, SequenceStats, SequenceTracker};
