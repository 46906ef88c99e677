use std::time::Duration;

use crate::error::SocketError;
use crate::protocol::{HEADER_SIZE, MESSAGE_HEADER_SIZE};
use crate::stats::PacketLossSimulation;

pub const DEFAULT_PORT: u16 = 40102;
pub const DEFAULT_CONTROL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1200;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 120;

/// A message part header plus at least one payload byte must fit.
pub const MIN_DATAGRAM_SIZE: usize = HEADER_SIZE + MESSAGE_HEADER_SIZE + 1;
pub const MAX_DATAGRAM_SIZE: usize = 65507;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Largest circular distance from the last received number that is still
    /// accepted. Anything further away is classified as unreasonable, so this
    /// is also how far back received numbers are remembered.
    pub max_reasonable_gap: u16,
    /// Forward advances a missing number survives before it is declared lost.
    pub aging_horizon: u32,
    pub max_missing: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_reasonable_gap: 1000,
            aging_horizon: 128,
            max_missing: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub control_interval: Duration,
    pub max_connections: usize,
    pub idle_timeout: Duration,
    pub max_datagram_size: usize,
    pub tracker: TrackerConfig,
    pub loss_simulation: Option<PacketLossSimulation>,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            control_interval: DEFAULT_CONTROL_INTERVAL,
            max_connections: 1024,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            tracker: TrackerConfig::default(),
            loss_simulation: None,
        }
    }
}

impl SocketConfig {
    pub fn validate(&self) -> Result<(), SocketError> {
        if !(MIN_DATAGRAM_SIZE..=MAX_DATAGRAM_SIZE).contains(&self.max_datagram_size) {
            return Err(SocketError::InvalidConfig(format!(
                "max_datagram_size {} outside {}..={}",
                self.max_datagram_size, MIN_DATAGRAM_SIZE, MAX_DATAGRAM_SIZE
            )));
        }
        if self.control_interval.is_zero() {
            return Err(SocketError::InvalidConfig(
                "control_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SocketConfig::default().validate().is_ok());
    }

    #[test]
    fn test_datagram_size_bounds() {
        let tiny = SocketConfig {
            max_datagram_size: MIN_DATAGRAM_SIZE - 1,
            ..SocketConfig::default()
        };
        assert!(matches!(tiny.validate(), Err(SocketError::InvalidConfig(_))));

        let smallest = SocketConfig {
            max_datagram_size: MIN_DATAGRAM_SIZE,
            ..SocketConfig::default()
        };
        assert!(smallest.validate().is_ok());

        let huge = SocketConfig {
            max_datagram_size: MAX_DATAGRAM_SIZE + 1,
            ..SocketConfig::default()
        };
        assert!(huge.validate().is_err());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = SocketConfig {
            control_interval: Duration::ZERO,
            ..SocketConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
