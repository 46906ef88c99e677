use std::collections::{BTreeMap, BTreeSet};

use crate::config::TrackerConfig;
use crate::sequence::SequenceNumber;

// Internally every number is unwrapped onto a 64-bit line so that ordering of
// the missing set never has to deal with the wrap. The base is a multiple of
// the sequence space, keeping the low 16 bits equal to the wire value.
const EXTENDED_BASE: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    InOrder,
    Early,
    Late,
    Recovered,
    /// A number that had already aged out as lost. Delivered, but not counted.
    ArrivedAfterLoss,
    Duplicate,
    Unreasonable,
}

impl Arrival {
    pub fn should_deliver(self) -> bool {
        !matches!(self, Arrival::Duplicate | Arrival::Unreasonable)
    }

    pub fn is_out_of_order(self) -> bool {
        matches!(
            self,
            Arrival::Early | Arrival::Late | Arrival::Recovered | Arrival::ArrivedAfterLoss
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceStats {
    pub received: u64,
    pub in_order: u64,
    pub early: u64,
    pub late: u64,
    pub recovered: u64,
    pub lost: u64,
    pub duplicate: u64,
    pub unreasonable: u64,
}

impl SequenceStats {
    pub fn out_of_order(&self) -> u64 {
        self.early + self.late
    }

    /// Packets the sender is known to have sent: everything received plus
    /// everything declared lost. Numbers still pending in the missing set are
    /// not included.
    pub fn expected_received(&self) -> u64 {
        self.received + self.lost
    }

    pub fn loss_rate(&self) -> f32 {
        let expected = self.expected_received();
        if expected == 0 {
            return 0.0;
        }
        self.lost as f32 / expected as f32
    }
}

/// Classifies inbound sequence numbers for one connection and keeps the set of
/// numbers that were skipped over but may still arrive.
///
/// Received and lost numbers are remembered for as far back as a number can
/// still be reasonable, so a repeat inside that window is always recognised.
#[derive(Debug)]
pub struct SequenceTracker {
    config: TrackerConfig,
    last_received: Option<u64>,
    advances: u64,
    // extended number -> value of `advances` when it went missing
    missing: BTreeMap<u64, u64>,
    received_window: BTreeSet<u64>,
    lost_window: BTreeSet<u64>,
    stats: SequenceStats,
}

impl Default for SequenceTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl SequenceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            last_received: None,
            advances: 0,
            missing: BTreeMap::new(),
            received_window: BTreeSet::new(),
            lost_window: BTreeSet::new(),
            stats: SequenceStats::default(),
        }
    }

    pub fn on_sequence_received(&mut self, seq: SequenceNumber, want_debug: bool) -> Arrival {
        let Some(last) = self.last_received else {
            let extended = EXTENDED_BASE + u64::from(seq.value());
            self.last_received = Some(extended);
            self.received_window.insert(extended);
            self.stats.received += 1;
            self.stats.in_order += 1;
            if want_debug {
                log::debug!("first sequence number {seq}");
            }
            return Arrival::InOrder;
        };

        let last_seq = wire_value(last);
        let gap = seq.distance_from(last_seq);

        let arrival = if gap == i16::MIN || gap.unsigned_abs() > self.config.max_reasonable_gap {
            self.stats.unreasonable += 1;
            Arrival::Unreasonable
        } else {
            let extended = (last as i64 + i64::from(gap)) as u64;
            if gap > 0 {
                self.advance_to(last, extended)
            } else {
                self.classify_behind(extended)
            }
        };

        if want_debug {
            log::debug!(
                "sequence {seq} classified {arrival:?} (last {last_seq}, gap {gap}, missing {})",
                self.missing.len()
            );
        }

        arrival
    }

    fn advance_to(&mut self, last: u64, extended: u64) -> Arrival {
        self.advances += 1;

        let first_missing = last + 1;
        let gap = extended - first_missing;
        let arrival = if gap == 0 {
            self.stats.in_order += 1;
            Arrival::InOrder
        } else {
            // Numbers that cannot fit in the missing set age out immediately.
            let kept = gap.min(self.config.max_missing as u64);
            let overflow_end = first_missing + (gap - kept);
            for skipped in first_missing..overflow_end {
                self.declare_lost(skipped);
            }
            for candidate in overflow_end..extended {
                self.missing.insert(candidate, self.advances);
            }
            self.stats.early += 1;
            Arrival::Early
        };

        self.last_received = Some(extended);
        self.received_window.insert(extended);
        self.stats.received += 1;

        self.age_missing();
        self.prune_windows(extended);
        arrival
    }

    fn classify_behind(&mut self, extended: u64) -> Arrival {
        if self.missing.remove(&extended).is_some() {
            self.received_window.insert(extended);
            self.stats.recovered += 1;
            self.stats.received += 1;
            Arrival::Recovered
        } else if self.received_window.contains(&extended) {
            self.stats.duplicate += 1;
            Arrival::Duplicate
        } else if self.lost_window.remove(&extended) {
            self.received_window.insert(extended);
            Arrival::ArrivedAfterLoss
        } else {
            self.received_window.insert(extended);
            self.stats.late += 1;
            self.stats.received += 1;
            Arrival::Late
        }
    }

    fn age_missing(&mut self) {
        let horizon = u64::from(self.config.aging_horizon.max(1));

        while let Some((&oldest, &since)) = self.missing.first_key_value() {
            let over_capacity = self.missing.len() > self.config.max_missing;
            if !over_capacity && self.advances - since < horizon {
                break;
            }
            self.missing.remove(&oldest);
            self.declare_lost(oldest);
        }
    }

    fn declare_lost(&mut self, extended: u64) {
        self.stats.lost += 1;
        self.lost_window.insert(extended);
    }

    // Anything further back than the reasonable gap is classified before these
    // sets are consulted, so older entries can never matter again.
    fn prune_windows(&mut self, last: u64) {
        let floor = last.saturating_sub(u64::from(self.config.max_reasonable_gap));
        self.received_window = self.received_window.split_off(&floor);
        self.lost_window = self.lost_window.split_off(&floor);
    }

    fn extend(&self, seq: SequenceNumber) -> Option<u64> {
        let last = self.last_received?;
        let gap = seq.distance_from(wire_value(last));
        Some((last as i64 + i64::from(gap)) as u64)
    }

    pub fn last_received(&self) -> Option<SequenceNumber> {
        self.last_received.map(wire_value)
    }

    pub fn stats(&self) -> SequenceStats {
        self.stats
    }

    pub fn received(&self) -> u64 {
        self.stats.received
    }

    pub fn unreasonable(&self) -> u64 {
        self.stats.unreasonable
    }

    pub fn early(&self) -> u64 {
        self.stats.early
    }

    pub fn late(&self) -> u64 {
        self.stats.late
    }

    pub fn out_of_order(&self) -> u64 {
        self.stats.out_of_order()
    }

    pub fn lost(&self) -> u64 {
        self.stats.lost
    }

    pub fn recovered(&self) -> u64 {
        self.stats.recovered
    }

    pub fn duplicate(&self) -> u64 {
        self.stats.duplicate
    }

    pub fn missing_len(&self) -> usize {
        self.missing.len()
    }

    /// True if `seq` was declared lost and has not arrived since.
    pub fn is_lost(&self, seq: SequenceNumber) -> bool {
        self.extend(seq)
            .is_some_and(|extended| self.lost_window.contains(&extended))
    }

    /// Missing numbers, oldest first in stream order.
    pub fn missing(&self) -> Vec<SequenceNumber> {
        self.missing.keys().map(|&e| wire_value(e)).collect()
    }

    /// Missing numbers collapsed into inclusive runs, oldest first.
    pub fn missing_ranges(&self) -> Vec<(SequenceNumber, SequenceNumber)> {
        let mut ranges: Vec<(u64, u64)> = Vec::new();
        for &extended in self.missing.keys() {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == extended => *end = extended,
                _ => ranges.push((extended, extended)),
            }
        }

        ranges
            .into_iter()
            .map(|(start, end)| (wire_value(start), wire_value(end)))
            .collect()
    }
}

fn wire_value(extended: u64) -> SequenceNumber {
    SequenceNumber::new((extended & 0xFFFF) as u16)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(v: u16) -> SequenceNumber {
        SequenceNumber::new(v)
    }

    fn feed(tracker: &mut SequenceTracker, values: &[u16]) -> Vec<Arrival> {
        values
            .iter()
            .map(|&v| tracker.on_sequence_received(seq(v), false))
            .collect()
    }

    fn assert_conserved(stats: &SequenceStats) {
        assert_eq!(
            stats.received,
            stats.in_order + stats.early + stats.late + stats.recovered
        );
    }

    #[test]
    fn test_gap_then_recovery() {
        let mut tracker = SequenceTracker::default();

        assert_eq!(tracker.on_sequence_received(seq(10), false), Arrival::InOrder);
        assert_eq!(tracker.received(), 1);
        assert!(tracker.missing().is_empty());

        assert_eq!(tracker.on_sequence_received(seq(12), false), Arrival::Early);
        assert_eq!(tracker.received(), 2);
        assert_eq!(tracker.missing(), vec![seq(11)]);
        assert_eq!(tracker.early(), 1);

        assert_eq!(tracker.on_sequence_received(seq(11), false), Arrival::Recovered);
        assert_eq!(tracker.received(), 3);
        assert_eq!(tracker.recovered(), 1);
        assert!(tracker.missing().is_empty());
        assert_eq!(tracker.last_received(), Some(seq(12)));
        assert_conserved(&tracker.stats());
    }

    #[test]
    fn test_in_order_across_wrap() {
        let mut tracker = SequenceTracker::default();
        let arrivals = feed(&mut tracker, &[65533, 65534, 65535, 0, 1]);

        assert!(arrivals.iter().all(|&a| a == Arrival::InOrder));
        assert_eq!(tracker.received(), 5);
        assert_eq!(tracker.out_of_order(), 0);
        assert_eq!(tracker.last_received(), Some(seq(1)));
    }

    #[test]
    fn test_gap_straddling_wrap() {
        let mut tracker = SequenceTracker::default();
        feed(&mut tracker, &[65534, 1]);

        assert_eq!(tracker.missing(), vec![seq(65535), seq(0)]);
        assert_eq!(tracker.missing_ranges(), vec![(seq(65535), seq(0))]);

        assert_eq!(tracker.on_sequence_received(seq(0), false), Arrival::Recovered);
        assert_eq!(tracker.on_sequence_received(seq(65535), false), Arrival::Recovered);
        assert!(tracker.missing().is_empty());
        assert_eq!(tracker.last_received(), Some(seq(1)));
        assert_conserved(&tracker.stats());
    }

    #[test]
    fn test_burst_loss_recovered_in_reverse() {
        let mut tracker = SequenceTracker::default();
        feed(&mut tracker, &[100, 106]);
        assert_eq!(tracker.missing_len(), 5);

        let arrivals = feed(&mut tracker, &[105, 104, 103, 102, 101]);
        assert!(arrivals.iter().all(|&a| a == Arrival::Recovered));
        assert!(arrivals.iter().all(|a| a.is_out_of_order()));

        let stats = tracker.stats();
        assert_eq!(stats.recovered, 5);
        assert_eq!(stats.early, 1);
        assert_eq!(stats.received, 7);
        assert_eq!(stats.lost, 0);
        assert_eq!(tracker.missing_len(), 0);
        assert_conserved(&stats);
    }

    #[test]
    fn test_duplicate_detection() {
        let mut tracker = SequenceTracker::default();
        feed(&mut tracker, &[1, 2]);

        assert_eq!(tracker.on_sequence_received(seq(2), false), Arrival::Duplicate);
        assert_eq!(tracker.on_sequence_received(seq(1), false), Arrival::Duplicate);
        assert_eq!(tracker.duplicate(), 2);
        assert_eq!(tracker.received(), 2);
        assert!(!Arrival::Duplicate.should_deliver());
    }

    #[test]
    fn test_duplicate_of_recovered_packet() {
        let mut tracker = SequenceTracker::default();
        feed(&mut tracker, &[10, 12, 11]);

        assert_eq!(tracker.on_sequence_received(seq(11), false), Arrival::Duplicate);
        let stats = tracker.stats();
        assert_eq!(stats.recovered, 1);
        assert_eq!(stats.duplicate, 1);
        assert_eq!(stats.received, 3);
        assert_conserved(&stats);
    }

    #[test]
    fn test_late_arrival_before_stream_start() {
        let mut tracker = SequenceTracker::default();
        feed(&mut tracker, &[50, 51]);

        let arrival = tracker.on_sequence_received(seq(45), false);
        assert_eq!(arrival, Arrival::Late);
        assert!(arrival.should_deliver());
        assert_eq!(tracker.late(), 1);
        assert_eq!(tracker.received(), 3);
        assert_eq!(tracker.last_received(), Some(seq(51)));
        assert_conserved(&tracker.stats());
    }

    #[test]
    fn test_unreasonable_is_discarded() {
        let mut tracker = SequenceTracker::default();
        feed(&mut tracker, &[10, 12]);
        let before = tracker.stats();

        assert_eq!(tracker.on_sequence_received(seq(5000), false), Arrival::Unreasonable);
        assert_eq!(tracker.on_sequence_received(seq(10 + 32768), false), Arrival::Unreasonable);

        let after = tracker.stats();
        assert_eq!(after.unreasonable, 2);
        assert_eq!(after.received, before.received);
        assert_eq!(tracker.missing(), vec![seq(11)]);
        assert_eq!(tracker.last_received(), Some(seq(12)));
    }

    #[test]
    fn test_missing_ages_out_after_horizon() {
        let config = TrackerConfig {
            aging_horizon: 3,
            ..TrackerConfig::default()
        };
        let mut tracker = SequenceTracker::new(config);

        feed(&mut tracker, &[10, 12, 13, 14]);
        assert_eq!(tracker.missing(), vec![seq(11)]);
        assert_eq!(tracker.lost(), 0);

        tracker.on_sequence_received(seq(15), false);
        assert!(tracker.missing().is_empty());
        assert_eq!(tracker.lost(), 1);

        let before = tracker.stats();
        let arrival = tracker.on_sequence_received(seq(11), false);
        assert_eq!(arrival, Arrival::ArrivedAfterLoss);
        assert!(arrival.should_deliver());
        assert_eq!(tracker.stats(), before);

        assert_eq!(tracker.on_sequence_received(seq(11), false), Arrival::Duplicate);
        assert_eq!(tracker.lost(), 1);
        assert_eq!(tracker.recovered(), 0);
    }

    #[test]
    fn test_missing_set_is_capped() {
        let config = TrackerConfig {
            max_missing: 4,
            ..TrackerConfig::default()
        };
        let mut tracker = SequenceTracker::new(config);

        feed(&mut tracker, &[0, 10]);
        assert_eq!(tracker.missing(), vec![seq(6), seq(7), seq(8), seq(9)]);
        assert_eq!(tracker.lost(), 5);

        feed(&mut tracker, &[13]);
        assert_eq!(tracker.missing(), vec![seq(8), seq(9), seq(11), seq(12)]);
        assert_eq!(tracker.lost(), 7);
    }

    #[test]
    fn test_every_missing_entry_removed_once() {
        let config = TrackerConfig {
            aging_horizon: 2,
            ..TrackerConfig::default()
        };
        let mut tracker = SequenceTracker::new(config);

        // 1..=4 go missing; 2 and 4 come back, 1 and 3 age out.
        feed(&mut tracker, &[0, 5, 4, 2, 6, 7, 1, 3]);

        let stats = tracker.stats();
        assert_eq!(stats.recovered + stats.lost, 4);
        assert_eq!(stats.recovered, 2);
        assert_eq!(stats.lost, 2);
        assert_eq!(tracker.missing_len(), 0);
        assert_conserved(&stats);
    }

    #[test]
    fn test_counters_never_decrease() {
        let mut tracker = SequenceTracker::default();
        let mut previous = tracker.stats();

        for &v in &[3u16, 1, 7, 7, 4, 2000, 5, 6, 9, 8, 65000, 10] {
            tracker.on_sequence_received(seq(v), true);
            let current = tracker.stats();
            assert!(current.received >= previous.received);
            assert!(current.early >= previous.early);
            assert!(current.late >= previous.late);
            assert!(current.lost >= previous.lost);
            assert!(current.recovered >= previous.recovered);
            assert!(current.duplicate >= previous.duplicate);
            assert!(current.unreasonable >= previous.unreasonable);
            assert_conserved(&current);
            previous = current;
        }
    }

    #[test]
    fn test_missing_ranges_compact() {
        let mut tracker = SequenceTracker::default();
        feed(&mut tracker, &[0, 4, 5, 9, 2]);

        assert_eq!(
            tracker.missing_ranges(),
            vec![(seq(1), seq(1)), (seq(3), seq(3)), (seq(6), seq(8))]
        );
    }

    #[test]
    fn test_repeat_inside_window_after_many_late_arrivals() {
        let mut tracker = SequenceTracker::default();
        tracker.on_sequence_received(seq(2000), false);
        for v in 1001..2000 {
            assert_eq!(tracker.on_sequence_received(seq(v), false), Arrival::Late);
        }
        for v in 2001..=2030 {
            tracker.on_sequence_received(seq(v), false);
        }

        let received = tracker.received();
        assert_eq!(tracker.on_sequence_received(seq(2000), false), Arrival::Duplicate);
        assert_eq!(tracker.on_sequence_received(seq(1500), false), Arrival::Duplicate);
        assert_eq!(tracker.received(), received);
        assert_conserved(&tracker.stats());
    }

    #[test]
    fn test_windows_pruned_behind_reasonable_gap() {
        let config = TrackerConfig {
            max_reasonable_gap: 10,
            ..TrackerConfig::default()
        };
        let mut tracker = SequenceTracker::new(config);
        for v in 0..=40 {
            tracker.on_sequence_received(seq(v), false);
        }

        assert_eq!(tracker.received_window.len(), 11);
        assert_eq!(tracker.on_sequence_received(seq(30), false), Arrival::Duplicate);
        assert_eq!(tracker.on_sequence_received(seq(29), false), Arrival::Unreasonable);
    }

    #[test]
    fn test_is_lost_until_arrival() {
        let config = TrackerConfig {
            aging_horizon: 1,
            ..TrackerConfig::default()
        };
        let mut tracker = SequenceTracker::new(config);
        assert!(!tracker.is_lost(seq(0)));

        feed(&mut tracker, &[65534, 1, 2]);
        assert!(tracker.is_lost(seq(65535)));
        assert!(tracker.is_lost(seq(0)));
        assert!(!tracker.is_lost(seq(1)));

        assert_eq!(tracker.on_sequence_received(seq(0), false), Arrival::ArrivedAfterLoss);
        assert!(!tracker.is_lost(seq(0)));
        assert!(tracker.is_lost(seq(65535)));
    }
}
