use std::path::PathBuf;
use std::time::Duration;

use xnet::{ChannelConfig, PacketLossSimulation};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub tick_rate: u32,
    pub max_clients: usize,
    pub timeout_secs: u64,
    /// Disconnect a client once this many of its datagrams went missing.
    pub drop_limit: Option<u32>,
    pub rate: f32,
    pub compress: bool,
    pub delta_path: Option<PathBuf>,
    /// Props simulated alongside the players.
    pub prop_count: usize,
    pub global_packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            max_clients: 32,
            timeout_secs: 65,
            drop_limit: None,
            rate: xnet::net::protocol::DEFAULT_RATE,
            compress: false,
            delta_path: None,
            prop_count: 8,
            global_packet_loss: None,
        }
    }
}

impl ServerConfig {
    pub fn channel_config(&self, qport: u16) -> ChannelConfig {
        ChannelConfig {
            qport,
            rate: self.rate,
            compress: self.compress,
            resend_interval: Duration::from_millis(500),
            ..Default::default()
        }
    }
}
