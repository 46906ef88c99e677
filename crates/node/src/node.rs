use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use udt::{ByteBuffer, DeliveryOrder, HEADER_SIZE, Socket, SocketError};

use crate::config::NodeConfig;
use crate::events::{NodeEvent, RemoveReason};

#[derive(Debug, Default, Clone, Copy)]
pub struct DeliveryCounts {
    pub in_order: u64,
    pub out_of_order: u64,
    pub unsequenced: u64,
    pub messages: u64,
    pub bytes: u64,
}

pub struct Node {
    socket: Socket,
    config: NodeConfig,
    payload: ByteBuffer,
    send_interval: Option<Duration>,
    last_send_time: Instant,
    accumulator: Duration,
    known_peers: HashSet<SocketAddr>,
    deliveries: DeliveryCounts,
    pending_events: VecDeque<NodeEvent>,
}

impl Node {
    pub fn new(bind_addr: &str, config: NodeConfig) -> Result<Self, SocketError> {
        let socket = Socket::bind(bind_addr, config.socket.clone())?;

        let send_interval = match (config.peer, config.send_rate) {
            (Some(_), rate) if rate > 0 => Some(Duration::from_secs_f64(1.0 / rate as f64)),
            _ => None,
        };

        Ok(Self {
            socket,
            payload: stream_payload(config.payload_size),
            send_interval,
            last_send_time: Instant::now(),
            accumulator: Duration::ZERO,
            known_peers: HashSet::new(),
            deliveries: DeliveryCounts::default(),
            pending_events: VecDeque::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.socket.local_addr()
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn deliveries(&self) -> DeliveryCounts {
        self.deliveries
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = NodeEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn tick_once(&mut self) {
        if let Err(e) = self.process_network() {
            self.pending_events.push_back(NodeEvent::Error {
                message: format!("Network error: {}", e),
            });
        }

        self.stream_to_peer();

        for addr in self.socket.cleanup_inactive() {
            self.known_peers.remove(&addr);
            self.pending_events.push_back(NodeEvent::PeerRemoved {
                addr,
                reason: RemoveReason::Idle,
            });
        }
    }

    fn process_network(&mut self) -> io::Result<()> {
        for delivery in self.socket.receive()? {
            if self.known_peers.insert(delivery.from) {
                self.pending_events
                    .push_back(NodeEvent::PeerConnected { addr: delivery.from });
            }

            match delivery.order {
                DeliveryOrder::InOrder => self.deliveries.in_order += 1,
                DeliveryOrder::OutOfOrder => self.deliveries.out_of_order += 1,
                DeliveryOrder::Unsequenced => self.deliveries.unsequenced += 1,
            }
            if delivery.message.is_some() {
                self.deliveries.messages += 1;
            }
            self.deliveries.bytes += delivery.payload.len() as u64;

            log::trace!(
                "{} bytes from {} seq {} ({:?})",
                delivery.payload.len(),
                delivery.from,
                delivery.sequence,
                delivery.arrival
            );
        }

        for (addr, message) in self.socket.take_failed_messages() {
            self.pending_events
                .push_back(NodeEvent::MessageFailed { addr, message });
        }
        Ok(())
    }

    fn send_payload(&self, peer: SocketAddr) -> Result<(), SocketError> {
        let packet_type = self.config.packet_type;
        if self.payload.len() + HEADER_SIZE > self.socket.config().max_datagram_size {
            self.socket.send_message(peer, packet_type, &self.payload)?;
        } else {
            self.socket.send_reliable(peer, packet_type, &self.payload)?;
        }
        Ok(())
    }

    fn stream_to_peer(&mut self) {
        let (Some(peer), Some(interval)) = (self.config.peer, self.send_interval) else {
            return;
        };

        let now = Instant::now();
        self.accumulator += now - self.last_send_time;
        self.last_send_time = now;

        while self.accumulator >= interval {
            self.accumulator -= interval;
            if let Err(e) = self.send_payload(peer) {
                self.pending_events.push_back(NodeEvent::Error {
                    message: format!("Send to {} failed: {}", peer, e),
                });
                self.accumulator = Duration::ZERO;
                break;
            }
        }
    }

    pub fn log_stats(&self) {
        let stats = self.socket.stats();
        log::info!(
            "datagrams out {} in {}, control out {} in {}, malformed {}, simulated loss {}, \
             errors out {} in {}",
            stats.datagrams_sent,
            stats.datagrams_received,
            stats.control_sent,
            stats.control_received,
            stats.malformed_dropped,
            stats.simulated_dropped,
            stats.send_errors,
            stats.receive_errors
        );

        for (addr, connection) in self.socket.sample_all_stats() {
            let sequence = connection.sequence;
            log::info!(
                "{}: received {} early {} late {} recovered {} lost {} dup {} unreasonable {} \
                 missing {} loss {:.2}% sent {} peer-missing {}",
                addr,
                sequence.received,
                sequence.early,
                sequence.late,
                sequence.recovered,
                sequence.lost,
                sequence.duplicate,
                sequence.unreasonable,
                connection.missing,
                sequence.loss_rate() * 100.0,
                connection.reliable_sent,
                self.socket
                    .peer_summary(addr)
                    .map_or(0, |summary| summary.missing_count())
            );
        }
    }

    pub fn shutdown(&mut self) {
        for addr in self.socket.connection_addrs() {
            if let Some(stats) = self.socket.close(addr) {
                log::info!(
                    "{} closed after {} received, {} sent",
                    addr,
                    stats.sequence.received,
                    stats.reliable_sent
                );
            }
            self.known_peers.remove(&addr);
            self.pending_events.push_back(NodeEvent::PeerRemoved {
                addr,
                reason: RemoveReason::Closed,
            });
        }
    }
}

fn stream_payload(size: usize) -> ByteBuffer {
    let mut payload = ByteBuffer::create(size);
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }
    payload.freeze()
}
