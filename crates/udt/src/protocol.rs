use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};

use crate::buffer::ByteBuffer;
use crate::error::PacketError;
use crate::sequence::SequenceNumber;

pub const HEADER_SIZE: usize = 4;
pub const MESSAGE_HEADER_SIZE: usize = 6;
const RANGE_COUNT_SIZE: usize = 2;
const RANGE_SIZE: usize = 4;

/// Smallest datagram limit a control summary (with no ranges) fits in.
pub const MIN_CONTROL_SIZE: usize = HEADER_SIZE + RANGE_COUNT_SIZE;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PacketFlags: u8 {
        const CONTROL = 0x80;
        const RELIABLE = 0x40;
        const MESSAGE = 0x20;
    }
}

/// Position of one datagram inside a multi-datagram message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessagePart {
    pub number: u16,
    pub part: u16,
    pub count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub flags: PacketFlags,
    pub packet_type: u8,
    pub sequence: SequenceNumber,
    pub message: Option<MessagePart>,
}

impl PacketHeader {
    pub fn data(reliable: bool, packet_type: u8, sequence: SequenceNumber) -> Self {
        let flags = if reliable {
            PacketFlags::RELIABLE
        } else {
            PacketFlags::empty()
        };
        Self {
            flags,
            packet_type,
            sequence,
            message: None,
        }
    }

    /// Reliable datagram carrying one part of a message.
    pub fn message_part(packet_type: u8, sequence: SequenceNumber, part: MessagePart) -> Self {
        Self {
            flags: PacketFlags::RELIABLE | PacketFlags::MESSAGE,
            packet_type,
            sequence,
            message: Some(part),
        }
    }

    pub fn control(kind: ControlKind, sequence: SequenceNumber) -> Self {
        Self {
            flags: PacketFlags::CONTROL,
            packet_type: kind as u8,
            sequence,
            message: None,
        }
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        self.flags.contains(PacketFlags::CONTROL)
    }

    #[inline]
    pub fn is_reliable(&self) -> bool {
        self.flags.contains(PacketFlags::RELIABLE)
    }

    pub fn encoded_len(&self) -> usize {
        match self.message {
            Some(_) => HEADER_SIZE + MESSAGE_HEADER_SIZE,
            None => HEADER_SIZE,
        }
    }

    pub fn encode<B: BufMut>(&self, buf: &mut B) {
        let mut flags = self.flags;
        flags.set(PacketFlags::MESSAGE, self.message.is_some());

        buf.put_u8(flags.bits());
        buf.put_u8(self.packet_type);
        buf.put_u16(self.sequence.value());

        if let Some(message) = self.message {
            buf.put_u16(message.number);
            buf.put_u16(message.part);
            buf.put_u16(message.count);
        }
    }

    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, PacketError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(PacketError::Truncated {
                needed: HEADER_SIZE,
                actual: buf.remaining(),
            });
        }

        let flags = PacketFlags::from_bits_retain(buf.get_u8());
        let packet_type = buf.get_u8();
        let sequence = SequenceNumber::new(buf.get_u16());

        let is_message = flags.contains(PacketFlags::MESSAGE) && !flags.contains(PacketFlags::CONTROL);
        let message = if is_message {
            if buf.remaining() < MESSAGE_HEADER_SIZE {
                return Err(PacketError::Truncated {
                    needed: HEADER_SIZE + MESSAGE_HEADER_SIZE,
                    actual: HEADER_SIZE + buf.remaining(),
                });
            }

            let part = MessagePart {
                number: buf.get_u16(),
                part: buf.get_u16(),
                count: buf.get_u16(),
            };
            if part.count == 0 || part.part >= part.count {
                return Err(PacketError::InvalidMessagePart {
                    part: part.part,
                    count: part.count,
                });
            }
            Some(part)
        } else {
            None
        };

        Ok(Self {
            flags,
            packet_type,
            sequence,
            message,
        })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Ack = 1,
}

impl TryFrom<u8> for ControlKind {
    type Error = PacketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ControlKind::Ack),
            other => Err(PacketError::UnknownControlKind(other)),
        }
    }
}

/// ACK point plus the receiver's missing set, as inclusive runs oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlSummary {
    pub ack: SequenceNumber,
    pub missing: Vec<(SequenceNumber, SequenceNumber)>,
}

impl ControlSummary {
    pub fn missing_count(&self) -> usize {
        self.missing
            .iter()
            .map(|&(start, end)| end.value().wrapping_sub(start.value()) as usize + 1)
            .sum()
    }

    /// Frames the summary as a control datagram no larger than `max_size`, or
    /// `None` if not even an empty summary fits.
    ///
    /// Ranges that do not fit are dropped from the newest end; the oldest gaps
    /// are the ones the sender needs to hear about first.
    pub fn encode(&self, max_size: usize) -> Option<ByteBuffer> {
        if max_size < MIN_CONTROL_SIZE {
            return None;
        }

        let room = (max_size - MIN_CONTROL_SIZE) / RANGE_SIZE;
        let ranges = &self.missing[..self.missing.len().min(room).min(u16::MAX as usize)];

        let mut buf = BytesMut::with_capacity(MIN_CONTROL_SIZE + ranges.len() * RANGE_SIZE);
        PacketHeader::control(ControlKind::Ack, self.ack).encode(&mut buf);
        buf.put_u16(ranges.len() as u16);
        for &(start, end) in ranges {
            buf.put_u16(start.value());
            buf.put_u16(end.value());
        }

        Some(ByteBuffer::from(buf.freeze()))
    }

    pub fn decode(header: &PacketHeader, mut body: &[u8]) -> Result<Self, PacketError> {
        ControlKind::try_from(header.packet_type)?;

        let actual = HEADER_SIZE + body.len();
        if body.remaining() < RANGE_COUNT_SIZE {
            return Err(PacketError::Truncated {
                needed: MIN_CONTROL_SIZE,
                actual,
            });
        }

        let count = body.get_u16() as usize;
        if body.remaining() < count * RANGE_SIZE {
            return Err(PacketError::Truncated {
                needed: MIN_CONTROL_SIZE + count * RANGE_SIZE,
                actual,
            });
        }

        let missing = (0..count)
            .map(|_| {
                let start = SequenceNumber::new(body.get_u16());
                let end = SequenceNumber::new(body.get_u16());
                (start, end)
            })
            .collect();

        Ok(Self {
            ack: header.sequence,
            missing,
        })
    }
}

pub fn frame_datagram(header: &PacketHeader, payload: &ByteBuffer) -> ByteBuffer {
    let mut buf = BytesMut::with_capacity(header.encoded_len() + payload.len());
    header.encode(&mut buf);
    buf.put_slice(payload);
    ByteBuffer::from(buf.freeze())
}

/// Splits a received datagram into its header and a zero-copy payload view.
pub fn parse_datagram(datagram: &ByteBuffer) -> Result<(PacketHeader, ByteBuffer), PacketError> {
    let mut cursor = datagram.as_slice();
    let header = PacketHeader::decode(&mut cursor)?;
    let consumed = datagram.len() - cursor.remaining();
    Ok((header, datagram.substring(consumed, None)))
}
