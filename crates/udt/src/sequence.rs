use std::fmt;

/// Number of distinct sequence numbers before the counter wraps.
pub const SEQUENCE_SPACE: u32 = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceNumber(u16);

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u16 {
        self.0
    }

    pub fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub fn wrapping_add(self, n: u16) -> Self {
        Self(self.0.wrapping_add(n))
    }

    pub fn wrapping_sub(self, n: u16) -> Self {
        Self(self.0.wrapping_sub(n))
    }

    /// Signed circular distance from `from` to `self`.
    ///
    /// The result lies in `[-32768, 32767]`: positive when `self` is ahead of
    /// `from`, negative when it is behind, zero when equal. Two numbers exactly
    /// half the space apart map to `-32768`, so neither is considered ahead.
    pub fn distance_from(self, from: SequenceNumber) -> i16 {
        circular_distance(from, self)
    }
}

impl From<u16> for SequenceNumber {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<SequenceNumber> for u16 {
    fn from(seq: SequenceNumber) -> Self {
        seq.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Modular distance `to - from`, reinterpreted in the signed range.
#[inline]
pub fn circular_distance(from: SequenceNumber, to: SequenceNumber) -> i16 {
    to.0.wrapping_sub(from.0) as i16
}

#[inline]
pub fn sequence_greater_than(s1: SequenceNumber, s2: SequenceNumber) -> bool {
    circular_distance(s2, s1) > 0
}
