use std::time::Duration;

use xnet::ChannelConfig;
use xnet::net::protocol::DEFAULT_RATE;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Identifies this client to the server across source port changes.
    pub qport: u16,
    pub command_rate: u32,
    pub connect_retry_secs: f32,
    pub connect_attempts: u32,
    pub timeout_secs: u64,
    pub rate: f32,
    pub compress: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            qport: 0,
            command_rate: 30,
            connect_retry_secs: 1.0,
            connect_attempts: 5,
            timeout_secs: 65,
            rate: DEFAULT_RATE,
            compress: false,
        }
    }
}

impl ClientConfig {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            qport: self.qport,
            rate: self.rate,
            compress: self.compress,
            resend_interval: Duration::from_millis(500),
            ..Default::default()
        }
    }

    pub fn command_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.command_rate.max(1) as f64)
    }
}
