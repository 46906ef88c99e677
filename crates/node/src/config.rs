use std::net::SocketAddr;
use std::time::Duration;

use udt::SocketConfig;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub socket: SocketConfig,
    pub peer: Option<SocketAddr>,
    pub send_rate: u32,
    pub payload_size: usize,
    pub packet_type: u8,
    pub stats_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            socket: SocketConfig::default(),
            peer: None,
            send_rate: 60,
            payload_size: 256,
            packet_type: 1,
            stats_interval: Duration::from_secs(5),
        }
    }
}
