use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::buffer::ByteBuffer;
use crate::config::TrackerConfig;
use crate::error::SocketError;
use crate::message::MessageAssembler;
use crate::protocol::{ControlSummary, PacketHeader};
use crate::sequence::SequenceNumber;
use crate::stats::ConnectionStats;
use crate::tracking::{Arrival, SequenceTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOrder {
    InOrder,
    OutOfOrder,
    /// Unreliable datagram; never sequenced against the stream.
    Unsequenced,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub from: SocketAddr,
    pub packet_type: u8,
    pub sequence: SequenceNumber,
    pub order: DeliveryOrder,
    pub arrival: Option<Arrival>,
    /// Message number when the payload is a reassembled multi-datagram message.
    pub message: Option<u16>,
    pub payload: ByteBuffer,
}

#[derive(Debug)]
pub struct Connection {
    addr: SocketAddr,
    tracker: SequenceTracker,
    max_reasonable_gap: u16,
    messages: MessageAssembler,
    next_outbound: SequenceNumber,
    next_unreliable: SequenceNumber,
    next_message: u16,
    last_receive_time: Instant,
    last_peer_summary: Option<ControlSummary>,
    reliable_sent: u64,
    unreliable_sent: u64,
    bytes_sent: u64,
    bytes_received: u64,
    control_received: u64,
    want_debug: bool,
}

impl Connection {
    pub fn new(addr: SocketAddr, tracker: TrackerConfig) -> Self {
        Self {
            addr,
            tracker: SequenceTracker::new(tracker),
            max_reasonable_gap: tracker.max_reasonable_gap,
            messages: MessageAssembler::new(),
            next_outbound: SequenceNumber::ZERO,
            next_unreliable: SequenceNumber::ZERO,
            next_message: 0,
            last_receive_time: Instant::now(),
            last_peer_summary: None,
            reliable_sent: 0,
            unreliable_sent: 0,
            bytes_sent: 0,
            bytes_received: 0,
            control_received: 0,
            want_debug: false,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn set_debug(&mut self, want_debug: bool) {
        self.want_debug = want_debug;
    }

    pub fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Classifies a reliable datagram and hands back what the application
    /// should see. Duplicates and unreasonable numbers yield `None`, as do
    /// message parts until their message is complete.
    ///
    /// Only deliverable arrivals count as activity for the idle timeout.
    pub fn on_datagram(&mut self, header: &PacketHeader, payload: ByteBuffer) -> Option<Delivery> {
        let arrival = self
            .tracker
            .on_sequence_received(header.sequence, self.want_debug);

        let delivery = if arrival.should_deliver() {
            self.touch();
            self.bytes_received += payload.len() as u64;
            self.deliver(header, arrival, payload)
        } else {
            None
        };

        if self.messages.has_pending() {
            self.messages
                .check_failures(&self.tracker, self.max_reasonable_gap);
        }

        delivery
    }

    fn deliver(
        &mut self,
        header: &PacketHeader,
        arrival: Arrival,
        payload: ByteBuffer,
    ) -> Option<Delivery> {
        let Some(part) = header.message else {
            return Some(Delivery {
                from: self.addr,
                packet_type: header.packet_type,
                sequence: header.sequence,
                order: order_of(arrival.is_out_of_order()),
                arrival: Some(arrival),
                message: None,
                payload,
            });
        };

        let completed = self.messages.on_part(
            header.packet_type,
            header.sequence,
            part,
            arrival.is_out_of_order(),
            payload,
        )?;

        Some(Delivery {
            from: self.addr,
            packet_type: completed.packet_type,
            sequence: completed.first_sequence,
            order: order_of(completed.out_of_order),
            arrival: Some(arrival),
            message: Some(completed.number),
            payload: completed.payload,
        })
    }

    /// Message numbers from this peer that failed since the last call.
    pub fn take_failed_messages(&mut self) -> Vec<u16> {
        self.messages.take_failed()
    }

    pub fn pending_messages(&self) -> usize {
        self.messages.pending_len()
    }

    pub fn on_control(&mut self, summary: ControlSummary) {
        self.touch();
        self.control_received += 1;
        self.last_peer_summary = Some(summary);
    }

    /// The most recent ACK/NAK summary the peer sent about our outbound stream.
    pub fn last_peer_summary(&self) -> Option<&ControlSummary> {
        self.last_peer_summary.as_ref()
    }

    pub fn next_outbound_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_outbound;
        self.next_outbound = self.next_outbound.next();
        sequence
    }

    pub fn next_unreliable_sequence(&mut self) -> SequenceNumber {
        let sequence = self.next_unreliable;
        self.next_unreliable = self.next_unreliable.next();
        sequence
    }

    /// The number the next send of this kind will carry, without consuming it.
    pub fn peek_sequence(&self, reliable: bool) -> SequenceNumber {
        if reliable {
            self.next_outbound
        } else {
            self.next_unreliable
        }
    }

    pub fn next_message_number(&mut self) -> u16 {
        let number = self.next_message;
        self.next_message = self.next_message.wrapping_add(1);
        number
    }

    /// Current ACK point and missing set, or `None` before anything reliable
    /// has arrived from this peer.
    pub fn build_control_summary(&self) -> Option<ControlSummary> {
        let ack = self.tracker.last_received()?;
        Some(ControlSummary {
            ack,
            missing: self.tracker.missing_ranges(),
        })
    }

    /// Consumes the sequence number of a datagram that left the socket and
    /// counts it.
    pub fn commit_send(&mut self, bytes: usize, reliable: bool) -> SequenceNumber {
        self.bytes_sent += bytes as u64;
        if reliable {
            self.reliable_sent += 1;
            self.next_outbound_sequence()
        } else {
            self.unreliable_sent += 1;
            self.next_unreliable_sequence()
        }
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_receive_time.elapsed() > timeout
    }

    pub fn touch(&mut self) {
        self.last_receive_time = Instant::now();
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            sequence: self.tracker.stats(),
            missing: self.tracker.missing_len(),
            reliable_sent: self.reliable_sent,
            unreliable_sent: self.unreliable_sent,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            control_received: self.control_received,
            pending_messages: self.messages.pending_len(),
            idle_ms: self.last_receive_time.elapsed().as_millis() as u64,
        }
    }
}

fn order_of(out_of_order: bool) -> DeliveryOrder {
    if out_of_order {
        DeliveryOrder::OutOfOrder
    } else {
        DeliveryOrder::InOrder
    }
}

pub type ConnectionFilter = Box<dyn Fn(&SocketAddr) -> bool + Send + Sync>;

pub struct ConnectionTable {
    connections: HashMap<SocketAddr, Connection>,
    max_connections: usize,
    timeout: Duration,
    tracker: TrackerConfig,
    filter: Option<ConnectionFilter>,
}

impl fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTable")
            .field("connections", &self.connections.len())
            .field("max_connections", &self.max_connections)
            .field("timeout", &self.timeout)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

impl ConnectionTable {
    pub fn new(max_connections: usize, timeout: Duration, tracker: TrackerConfig) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
            timeout,
            tracker,
            filter: None,
        }
    }

    pub fn set_filter(&mut self, filter: Option<ConnectionFilter>) {
        self.filter = filter;
    }

    pub fn find_or_create(&mut self, addr: SocketAddr) -> Result<&mut Connection, SocketError> {
        if !self.connections.contains_key(&addr) {
            if self.connections.len() >= self.max_connections {
                log::debug!("refusing connection to {addr}: table full");
                return Err(SocketError::ConnectionRefused(addr));
            }
            if self.filter.as_ref().is_some_and(|allow| !allow(&addr)) {
                log::debug!("refusing connection to {addr}: rejected by filter");
                return Err(SocketError::ConnectionRefused(addr));
            }

            log::debug!("creating connection to {addr}");
            self.connections
                .insert(addr, Connection::new(addr, self.tracker));
        }

        self.connections
            .get_mut(&addr)
            .ok_or(SocketError::ConnectionRefused(addr))
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<&Connection> {
        self.connections.get(addr)
    }

    pub fn get_mut(&mut self, addr: &SocketAddr) -> Option<&mut Connection> {
        self.connections.get_mut(addr)
    }

    pub fn remove(&mut self, addr: &SocketAddr) -> Option<Connection> {
        self.connections.remove(addr)
    }

    pub fn clear(&mut self) {
        if !self.connections.is_empty() {
            log::debug!("clearing {} connections", self.connections.len());
            self.connections.clear();
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Connection> {
        self.connections.values_mut()
    }

    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.connections.keys().copied().collect()
    }

    pub fn cleanup_timed_out(&mut self) -> Vec<SocketAddr> {
        let timed_out: Vec<SocketAddr> = self
            .connections
            .values()
            .filter(|c| c.is_timed_out(self.timeout))
            .map(|c| c.addr)
            .collect();

        for addr in &timed_out {
            log::debug!("connection to {addr} idle, removing");
            self.connections.remove(addr);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessagePart;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn reliable(seq: u16) -> PacketHeader {
        PacketHeader::data(true, 1, SequenceNumber::new(seq))
    }

    #[test]
    fn test_outbound_sequence_wraps() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        assert_eq!(connection.next_outbound_sequence(), SequenceNumber::new(0));
        assert_eq!(connection.next_outbound_sequence(), SequenceNumber::new(1));

        connection.next_outbound = SequenceNumber::new(u16::MAX);
        assert_eq!(connection.next_outbound_sequence(), SequenceNumber::new(u16::MAX));
        assert_eq!(connection.next_outbound_sequence(), SequenceNumber::new(0));
    }

    #[test]
    fn test_unreliable_counter_is_separate() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        connection.next_outbound_sequence();
        connection.next_outbound_sequence();
        assert_eq!(connection.next_unreliable_sequence(), SequenceNumber::new(0));
    }

    #[test]
    fn test_datagram_delivery_classification() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        let payload = ByteBuffer::from("x");

        let first = connection.on_datagram(&reliable(10), payload.clone()).unwrap();
        assert_eq!(first.order, DeliveryOrder::InOrder);
        assert_eq!(first.from, addr(1000));

        let early = connection.on_datagram(&reliable(12), payload.clone()).unwrap();
        assert_eq!(early.order, DeliveryOrder::OutOfOrder);
        assert_eq!(early.arrival, Some(Arrival::Early));

        let recovered = connection.on_datagram(&reliable(11), payload.clone()).unwrap();
        assert_eq!(recovered.arrival, Some(Arrival::Recovered));
        assert_eq!(recovered.order, DeliveryOrder::OutOfOrder);

        assert!(connection.on_datagram(&reliable(11), payload.clone()).is_none());
        assert!(connection.on_datagram(&reliable(9000), payload).is_none());
        assert_eq!(connection.tracker().duplicate(), 1);
        assert_eq!(connection.tracker().unreasonable(), 1);
    }

    #[test]
    fn test_delivered_payload_is_not_copied() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        let payload = ByteBuffer::from("shared");

        let delivery = connection.on_datagram(&reliable(1), payload.clone()).unwrap();
        assert!(delivery.payload.shares_backing_with(&payload));
    }

    #[test]
    fn test_control_summary() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        assert!(connection.build_control_summary().is_none());

        for seq in [1, 2, 5, 6, 9] {
            connection.on_datagram(&reliable(seq), ByteBuffer::new());
        }

        let summary = connection.build_control_summary().unwrap();
        assert_eq!(summary.ack, SequenceNumber::new(9));
        assert_eq!(
            summary.missing,
            vec![
                (SequenceNumber::new(3), SequenceNumber::new(4)),
                (SequenceNumber::new(7), SequenceNumber::new(8)),
            ]
        );
        assert_eq!(summary.missing_count(), 4);
    }

    #[test]
    fn test_peer_summary_recorded() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        let summary = ControlSummary {
            ack: SequenceNumber::new(4),
            missing: vec![(SequenceNumber::new(2), SequenceNumber::new(2))],
        };

        connection.on_control(summary.clone());
        assert_eq!(connection.last_peer_summary(), Some(&summary));
        assert_eq!(connection.stats().control_received, 1);
        assert_eq!(connection.stats().sequence.received, 0);
    }

    #[test]
    fn test_table_limit_and_filter() {
        let mut table = ConnectionTable::new(2, Duration::from_secs(10), TrackerConfig::default());
        table.set_filter(Some(Box::new(|a: &SocketAddr| a.port() != 666)));

        assert!(table.find_or_create(addr(1)).is_ok());
        assert!(table.find_or_create(addr(1)).is_ok());
        assert!(matches!(
            table.find_or_create(addr(666)),
            Err(SocketError::ConnectionRefused(_))
        ));
        assert!(table.find_or_create(addr(2)).is_ok());
        assert!(matches!(
            table.find_or_create(addr(3)),
            Err(SocketError::ConnectionRefused(_))
        ));
        assert_eq!(table.len(), 2);

        assert!(table.remove(&addr(1)).is_some());
        assert!(table.find_or_create(addr(3)).is_ok());
    }

    #[test]
    fn test_cleanup_timed_out() {
        let mut table = ConnectionTable::new(8, Duration::from_millis(20), TrackerConfig::default());
        table.find_or_create(addr(1)).unwrap();
        std::thread::sleep(Duration::from_millis(40));
        table.find_or_create(addr(2)).unwrap();

        let removed = table.cleanup_timed_out();
        assert_eq!(removed, vec![addr(1)]);
        assert_eq!(table.addrs(), vec![addr(2)]);
    }

    #[test]
    fn test_commit_send_consumes_sequence() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        assert_eq!(connection.peek_sequence(true), SequenceNumber::new(0));
        assert_eq!(connection.peek_sequence(true), SequenceNumber::new(0));

        assert_eq!(connection.commit_send(10, true), SequenceNumber::new(0));
        assert_eq!(connection.peek_sequence(true), SequenceNumber::new(1));
        assert_eq!(connection.peek_sequence(false), SequenceNumber::new(0));

        let stats = connection.stats();
        assert_eq!(stats.reliable_sent, 1);
        assert_eq!(stats.unreliable_sent, 0);
        assert_eq!(stats.bytes_sent, 10);
    }

    #[test]
    fn test_undeliverable_traffic_does_not_keep_connection_alive() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        connection.on_datagram(&reliable(10), ByteBuffer::from("x"));
        std::thread::sleep(Duration::from_millis(30));

        assert!(connection.on_datagram(&reliable(10), ByteBuffer::from("x")).is_none());
        assert!(connection.on_datagram(&reliable(30000), ByteBuffer::from("x")).is_none());
        assert!(connection.is_timed_out(Duration::from_millis(20)));
        assert_eq!(connection.stats().bytes_received, 1);

        connection.on_datagram(&reliable(11), ByteBuffer::from("y"));
        assert!(!connection.is_timed_out(Duration::from_millis(20)));
    }

    #[test]
    fn test_message_parts_reassembled() {
        let mut connection = Connection::new(addr(1000), TrackerConfig::default());
        let header = |seq: u16, part: u16| {
            PacketHeader::message_part(
                5,
                SequenceNumber::new(seq),
                MessagePart {
                    number: 0,
                    part,
                    count: 2,
                },
            )
        };

        assert!(connection.on_datagram(&header(41, 1), ByteBuffer::from("lo")).is_none());
        assert_eq!(connection.pending_messages(), 1);

        let delivery = connection
            .on_datagram(&header(40, 0), ByteBuffer::from("hel"))
            .unwrap();
        assert_eq!(delivery.message, Some(0));
        assert_eq!(delivery.packet_type, 5);
        assert_eq!(delivery.sequence, SequenceNumber::new(40));
        assert_eq!(delivery.order, DeliveryOrder::OutOfOrder);
        assert_eq!(delivery.payload, &b"hello"[..]);
        assert_eq!(connection.pending_messages(), 0);
        assert_eq!(connection.stats().sequence.received, 2);
    }

    #[test]
    fn test_message_fails_when_part_lost() {
        let config = TrackerConfig {
            aging_horizon: 1,
            ..TrackerConfig::default()
        };
        let mut connection = Connection::new(addr(1000), config);
        let part = |part: u16| MessagePart {
            number: 3,
            part,
            count: 2,
        };

        connection.on_datagram(
            &PacketHeader::message_part(1, SequenceNumber::new(0), part(0)),
            ByteBuffer::from("a"),
        );
        connection.on_datagram(&reliable(2), ByteBuffer::new());
        assert!(connection.take_failed_messages().is_empty());

        connection.on_datagram(&reliable(3), ByteBuffer::new());
        assert_eq!(connection.take_failed_messages(), vec![3]);
        assert_eq!(connection.pending_messages(), 0);
    }
}
