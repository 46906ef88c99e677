use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::BytesMut;

use crate::buffer::ByteBuffer;
use crate::config::SocketConfig;
use crate::connection::{Connection, ConnectionFilter, ConnectionTable, Delivery, DeliveryOrder};
use crate::error::SocketError;
use crate::message::split_message;
use crate::pacer::{ControlPacer, PacerStopHandle};
use crate::protocol::{
    ControlSummary, HEADER_SIZE, MESSAGE_HEADER_SIZE, MessagePart, PacketHeader, frame_datagram,
    parse_datagram,
};
use crate::sequence::SequenceNumber;
use crate::stats::{ConnectionStats, NetworkStats};

const MAX_RECEIVE_SIZE: usize = 65536;
/// Upper bound on datagrams handled by one `receive` call.
pub const MAX_DATAGRAMS_PER_RECEIVE: usize = 64;

struct Shared {
    udp: UdpSocket,
    local_addr: SocketAddr,
    config: SocketConfig,
    connections: Mutex<ConnectionTable>,
    stats: Mutex<NetworkStats>,
    recv_buffer: Mutex<BytesMut>,
}

/// UDP endpoint that demultiplexes datagrams onto per-peer connections.
///
/// Clones share the same endpoint and connection table. All connection state
/// sits behind one lock, so the receive path and the control pacer never
/// interleave inside a classification. The receive path takes the table lock
/// per datagram, so the pacer gets in between datagrams of a busy drain.
/// Locks are always taken in the order receive buffer, connections, stats.
#[derive(Clone)]
pub struct Socket {
    shared: Arc<Shared>,
}

impl fmt::Debug for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Socket")
            .field("local_addr", &self.shared.local_addr)
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Socket {
    pub fn bind<A: ToSocketAddrs>(addr: A, config: SocketConfig) -> Result<Self, SocketError> {
        config.validate()?;

        let udp = UdpSocket::bind(addr)?;
        udp.set_nonblocking(true)?;

        let local_addr = udp.local_addr()?;
        let connections = ConnectionTable::new(
            config.max_connections,
            config.idle_timeout,
            config.tracker,
        );

        log::debug!("udt socket bound to {local_addr}");

        Ok(Self {
            shared: Arc::new(Shared {
                udp,
                local_addr,
                config,
                connections: Mutex::new(connections),
                stats: Mutex::new(NetworkStats::default()),
                recv_buffer: Mutex::new(BytesMut::with_capacity(MAX_RECEIVE_SIZE)),
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &SocketConfig {
        &self.shared.config
    }

    pub fn stats(&self) -> NetworkStats {
        lock(&self.shared.stats).clone()
    }

    pub fn set_connection_filter(&self, filter: Option<ConnectionFilter>) {
        lock(&self.shared.connections).set_filter(filter);
    }

    pub fn open(&self, addr: SocketAddr) -> Result<(), SocketError> {
        lock(&self.shared.connections).find_or_create(addr)?;
        Ok(())
    }

    pub fn close(&self, addr: SocketAddr) -> Option<ConnectionStats> {
        let connection = lock(&self.shared.connections).remove(&addr)?;
        log::debug!("closed connection to {addr}");
        Some(connection.stats())
    }

    pub fn clear_connections(&self) {
        lock(&self.shared.connections).clear();
    }

    pub fn cleanup_inactive(&self) -> Vec<SocketAddr> {
        lock(&self.shared.connections).cleanup_timed_out()
    }

    pub fn connection_addrs(&self) -> Vec<SocketAddr> {
        lock(&self.shared.connections).addrs()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    pub fn set_connection_debug(&self, addr: SocketAddr, want_debug: bool) {
        if let Some(connection) = lock(&self.shared.connections).get_mut(&addr) {
            connection.set_debug(want_debug);
        }
    }

    pub fn sample_stats(&self, addr: SocketAddr) -> Option<ConnectionStats> {
        lock(&self.shared.connections)
            .get(&addr)
            .map(|connection| connection.stats())
    }

    pub fn sample_all_stats(&self) -> Vec<(SocketAddr, ConnectionStats)> {
        lock(&self.shared.connections)
            .iter()
            .map(|connection| (connection.addr(), connection.stats()))
            .collect()
    }

    pub fn peer_summary(&self, addr: SocketAddr) -> Option<ControlSummary> {
        lock(&self.shared.connections)
            .get(&addr)
            .and_then(|connection| connection.last_peer_summary().cloned())
    }

    pub fn send_reliable(
        &self,
        addr: SocketAddr,
        packet_type: u8,
        payload: &ByteBuffer,
    ) -> Result<SequenceNumber, SocketError> {
        self.send(addr, packet_type, payload, true)
    }

    pub fn send_unreliable(
        &self,
        addr: SocketAddr,
        packet_type: u8,
        payload: &ByteBuffer,
    ) -> Result<SequenceNumber, SocketError> {
        self.send(addr, packet_type, payload, false)
    }

    /// Sends `payload` reliably as one message, split over as many datagrams
    /// as the datagram limit requires. The parts occupy consecutive sequence
    /// numbers; the receiver delivers the message once every part arrived.
    pub fn send_message(
        &self,
        addr: SocketAddr,
        packet_type: u8,
        payload: &ByteBuffer,
    ) -> Result<u16, SocketError> {
        let chunk = self.shared.config.max_datagram_size - HEADER_SIZE - MESSAGE_HEADER_SIZE;
        let parts = split_message(payload, chunk);
        let Ok(count) = u16::try_from(parts.len()) else {
            return Err(SocketError::PayloadTooLarge {
                size: payload.len(),
                max: chunk * u16::MAX as usize,
            });
        };

        let mut connections = lock(&self.shared.connections);
        let connection = connections.find_or_create(addr)?;
        let number = connection.next_message_number();

        for (part, piece) in (0u16..).zip(&parts) {
            let message = MessagePart {
                number,
                part,
                count,
            };
            self.transmit(connection, addr, packet_type, Some(message), piece, true)?;
        }

        log::trace!("message {number} to {addr} sent in {count} parts");
        Ok(number)
    }

    fn send(
        &self,
        addr: SocketAddr,
        packet_type: u8,
        payload: &ByteBuffer,
        reliable: bool,
    ) -> Result<SequenceNumber, SocketError> {
        let max = self.shared.config.max_datagram_size;
        let size = payload.len() + HEADER_SIZE;
        if size > max {
            return Err(SocketError::PayloadTooLarge { size, max });
        }

        let mut connections = lock(&self.shared.connections);
        let connection = connections.find_or_create(addr)?;
        self.transmit(connection, addr, packet_type, None, payload, reliable)
    }

    // The sequence number is only consumed once the datagram has left (or was
    // dropped by loss simulation), so a failed write leaves no gap behind.
    fn transmit(
        &self,
        connection: &mut Connection,
        addr: SocketAddr,
        packet_type: u8,
        message: Option<MessagePart>,
        payload: &ByteBuffer,
        reliable: bool,
    ) -> Result<SequenceNumber, SocketError> {
        let sequence = connection.peek_sequence(reliable);
        let header = match message {
            Some(part) => PacketHeader::message_part(packet_type, sequence, part),
            None => PacketHeader::data(reliable, packet_type, sequence),
        };
        let datagram = frame_datagram(&header, payload);

        let dropped = self
            .shared
            .config
            .loss_simulation
            .as_ref()
            .is_some_and(|sim| sim.should_drop());
        if dropped {
            log::trace!("simulated loss of {sequence} to {addr}");
            connection.commit_send(datagram.len(), reliable);
            lock(&self.shared.stats).simulated_dropped += 1;
            return Ok(sequence);
        }

        match self.shared.udp.send_to(&datagram, addr) {
            Ok(bytes) => {
                connection.commit_send(bytes, reliable);
                let mut stats = lock(&self.shared.stats);
                stats.datagrams_sent += 1;
                stats.bytes_sent += bytes as u64;
                Ok(sequence)
            }
            Err(e) => {
                log::warn!("datagram {sequence} to {addr} failed: {e}");
                lock(&self.shared.stats).send_errors += 1;
                Err(e.into())
            }
        }
    }

    /// Drains datagrams queued on the endpoint, at most
    /// [`MAX_DATAGRAMS_PER_RECEIVE`] per call.
    ///
    /// Returns the payloads the application should see, in arrival order.
    /// Malformed datagrams, control datagrams, duplicates and unreasonable
    /// sequence numbers are consumed here and never surface. A socket error
    /// after some datagrams were handled is logged and counted, and what was
    /// already delivered is returned.
    pub fn receive(&self) -> io::Result<Vec<Delivery>> {
        let mut deliveries = Vec::new();
        let mut buffer = lock(&self.shared.recv_buffer);

        for _ in 0..MAX_DATAGRAMS_PER_RECEIVE {
            buffer.clear();
            buffer.resize(MAX_RECEIVE_SIZE, 0);

            let (size, from) = match self.shared.udp.recv_from(&mut buffer[..]) {
                Ok(received) => received,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    lock(&self.shared.stats).receive_errors += 1;
                    if deliveries.is_empty() {
                        return Err(e);
                    }
                    log::warn!("receive on {} failed: {e}", self.shared.local_addr);
                    break;
                }
            };

            buffer.truncate(size);
            let datagram = ByteBuffer::from(buffer.split().freeze());

            let mut connections = lock(&self.shared.connections);
            let mut stats = lock(&self.shared.stats);
            stats.datagrams_received += 1;
            stats.bytes_received += size as u64;

            if let Some(delivery) = route(&mut connections, &mut stats, from, &datagram) {
                deliveries.push(delivery);
            }
        }

        Ok(deliveries)
    }

    /// Message numbers that failed, per peer, since the last call.
    pub fn take_failed_messages(&self) -> Vec<(SocketAddr, u16)> {
        lock(&self.shared.connections)
            .iter_mut()
            .flat_map(|connection| {
                let addr = connection.addr();
                connection
                    .take_failed_messages()
                    .into_iter()
                    .map(move |number| (addr, number))
            })
            .collect()
    }

    /// Sends the current control summary of every connection that has one.
    /// Returns how many control datagrams went out.
    pub fn emit_control(&self) -> usize {
        let max = self.shared.config.max_datagram_size;
        let summaries: Vec<(SocketAddr, ByteBuffer)> = lock(&self.shared.connections)
            .iter()
            .filter_map(|connection| {
                let summary = connection.build_control_summary()?;
                Some((connection.addr(), summary.encode(max)?))
            })
            .collect();

        let mut sent = 0;
        for (addr, datagram) in summaries {
            match self.shared.udp.send_to(&datagram, addr) {
                Ok(bytes) => {
                    let mut stats = lock(&self.shared.stats);
                    stats.control_sent += 1;
                    stats.bytes_sent += bytes as u64;
                    sent += 1;
                }
                Err(e) => {
                    log::warn!("control datagram to {addr} failed: {e}");
                    lock(&self.shared.stats).send_errors += 1;
                }
            }
        }

        sent
    }

    /// Starts this socket's control pacer on its own thread.
    pub fn spawn_control_pacer(&self) -> io::Result<PacerHandle> {
        let mut pacer = ControlPacer::new(self.shared.config.control_interval);
        let stop = pacer.stop_handle();
        let socket = self.clone();

        let thread = thread::Builder::new()
            .name("udt-control-pacer".into())
            .spawn(move || {
                pacer.run(|| {
                    socket.emit_control();
                })
            })?;

        Ok(PacerHandle {
            stop,
            thread: Some(thread),
        })
    }
}

fn route(
    connections: &mut ConnectionTable,
    stats: &mut NetworkStats,
    from: SocketAddr,
    datagram: &ByteBuffer,
) -> Option<Delivery> {
    let (header, payload) = match parse_datagram(datagram) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::trace!("dropping datagram from {from}: {e}");
            stats.malformed_dropped += 1;
            return None;
        }
    };

    if header.is_control() {
        let summary = match ControlSummary::decode(&header, &payload) {
            Ok(summary) => summary,
            Err(e) => {
                log::trace!("dropping control datagram from {from}: {e}");
                stats.malformed_dropped += 1;
                return None;
            }
        };

        stats.control_received += 1;
        match connections.find_or_create(from) {
            Ok(connection) => connection.on_control(summary),
            Err(_) => stats.refused_dropped += 1,
        }
        return None;
    }

    if !header.is_reliable() {
        if header.message.is_some() {
            log::trace!("dropping unreliable message part from {from}");
            stats.malformed_dropped += 1;
            return None;
        }
        if let Some(connection) = connections.get_mut(&from) {
            connection.touch();
        }
        return Some(Delivery {
            from,
            packet_type: header.packet_type,
            sequence: header.sequence,
            order: DeliveryOrder::Unsequenced,
            arrival: None,
            message: None,
            payload,
        });
    }

    match connections.find_or_create(from) {
        Ok(connection) => connection.on_datagram(&header, payload),
        Err(_) => {
            stats.refused_dropped += 1;
            None
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Owns a running control pacer thread. Dropping the handle stops the pacer
/// and waits for its current cycle to finish.
#[derive(Debug)]
pub struct PacerHandle {
    stop: PacerStopHandle,
    thread: Option<JoinHandle<()>>,
}

impl PacerHandle {
    pub fn stop_handle(&self) -> PacerStopHandle {
        self.stop.clone()
    }

    pub fn shutdown(&mut self) {
        self.stop.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("control pacer thread panicked");
            }
        }
    }
}

impl Drop for PacerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
