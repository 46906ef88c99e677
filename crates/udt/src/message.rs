use std::collections::{HashMap, VecDeque};

use crate::buffer::ByteBuffer;
use crate::protocol::MessagePart;
use crate::sequence::{SequenceNumber, circular_distance};
use crate::tracking::SequenceTracker;

const FINISHED_HISTORY: usize = 64;

/// A message whose parts have all arrived.
#[derive(Debug, Clone)]
pub struct CompletedMessage {
    pub number: u16,
    pub packet_type: u8,
    pub first_sequence: SequenceNumber,
    pub out_of_order: bool,
    pub payload: ByteBuffer,
}

#[derive(Debug)]
struct PendingMessage {
    packet_type: u8,
    first_sequence: SequenceNumber,
    parts: Vec<Option<ByteBuffer>>,
    remaining: usize,
    out_of_order: bool,
}

impl PendingMessage {
    fn last_sequence(&self) -> SequenceNumber {
        self.first_sequence
            .wrapping_add((self.parts.len() - 1) as u16)
    }

    fn missing_sequences(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.parts
            .iter()
            .enumerate()
            .filter(|(_, part)| part.is_none())
            .map(|(i, _)| self.first_sequence.wrapping_add(i as u16))
    }
}

/// Reassembles multi-datagram messages from one peer.
///
/// The parts of a message travel on consecutive reliable sequence numbers, so
/// the sequence of any part locates the whole message. A message fails as soon
/// as the tracker declares one of its outstanding parts lost, or once its last
/// part falls further behind the stream than a number can reasonably arrive.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    pending: HashMap<u16, PendingMessage>,
    finished: VecDeque<u16>,
    failed: Vec<u16>,
}

impl MessageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Stores one delivered part and returns the message once it is whole.
    pub fn on_part(
        &mut self,
        packet_type: u8,
        sequence: SequenceNumber,
        part: MessagePart,
        out_of_order: bool,
        payload: ByteBuffer,
    ) -> Option<CompletedMessage> {
        if self.finished.contains(&part.number) {
            log::trace!("dropping part {} of finished message {}", part.part, part.number);
            return None;
        }

        let pending = self
            .pending
            .entry(part.number)
            .or_insert_with(|| PendingMessage {
                packet_type,
                first_sequence: sequence.wrapping_sub(part.part),
                parts: vec![None; part.count as usize],
                remaining: part.count as usize,
                out_of_order: false,
            });

        let index = part.part as usize;
        if pending.parts.len() != part.count as usize
            || pending.first_sequence != sequence.wrapping_sub(part.part)
            || pending.parts[index].is_some()
        {
            log::debug!(
                "part {} of message {} does not match its message, dropping",
                part.part,
                part.number
            );
            return None;
        }

        pending.parts[index] = Some(payload);
        pending.remaining -= 1;
        pending.out_of_order |= out_of_order;
        if pending.remaining > 0 {
            return None;
        }

        let pending = self.pending.remove(&part.number)?;
        self.mark_finished(part.number);

        let payload = ByteBuffer::join(pending.parts.iter().flatten());
        Some(CompletedMessage {
            number: part.number,
            packet_type: pending.packet_type,
            first_sequence: pending.first_sequence,
            out_of_order: pending.out_of_order,
            payload,
        })
    }

    /// Fails every pending message that can no longer complete.
    pub fn check_failures(&mut self, tracker: &SequenceTracker, max_reasonable_gap: u16) {
        let Some(last) = tracker.last_received() else {
            return;
        };

        let doomed: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, pending)| {
                let behind = circular_distance(pending.last_sequence(), last);
                i32::from(behind) > i32::from(max_reasonable_gap)
                    || pending.missing_sequences().any(|seq| tracker.is_lost(seq))
            })
            .map(|(&number, _)| number)
            .collect();

        for number in doomed {
            self.pending.remove(&number);
            self.mark_finished(number);
            log::debug!("message {number} failed, a part will not arrive");
            self.failed.push(number);
        }
    }

    pub fn take_failed(&mut self) -> Vec<u16> {
        std::mem::take(&mut self.failed)
    }

    fn mark_finished(&mut self, number: u16) {
        self.finished.push_back(number);
        if self.finished.len() > FINISHED_HISTORY {
            self.finished.pop_front();
        }
    }
}

/// Splits `payload` into message parts of at most `chunk` bytes. An empty
/// payload still yields one (empty) part.
pub fn split_message(payload: &ByteBuffer, chunk: usize) -> Vec<ByteBuffer> {
    if payload.is_empty() || chunk == 0 {
        return vec![ByteBuffer::new()];
    }

    (0..payload.len())
        .step_by(chunk)
        .map(|offset| payload.substring(offset, Some(chunk)))
        .collect()
}
