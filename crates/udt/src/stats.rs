use crate::tracking::SequenceStats;

#[derive(Debug, Clone, Default)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn with_loss(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent,
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percent
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub control_sent: u64,
    pub control_received: u64,
    pub malformed_dropped: u64,
    pub refused_dropped: u64,
    pub simulated_dropped: u64,
    pub send_errors: u64,
    pub receive_errors: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStats {
    pub sequence: SequenceStats,
    pub missing: usize,
    pub reliable_sent: u64,
    pub unreliable_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub control_received: u64,
    pub pending_messages: usize,
    pub idle_ms: u64,
}

pub fn rand_percent() -> f32 {
    (rand_u64() % 10000) as f32 / 10000.0
}

pub fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hash, Hasher};
    use std::time::Instant;

    let mut hasher = RandomState::new().build_hasher();
    Instant::now().hash(&mut hasher);
    hasher.finish()
}
