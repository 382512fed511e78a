use std::time::Duration;

use drift::{NetConfig, PacketLossSimulation};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub name: String,
    pub net: NetConfig,
    pub stats_interval: Duration,
    pub packet_loss: Option<PacketLossSimulation>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "pilot".to_string(),
            net: NetConfig::default(),
            stats_interval: Duration::from_secs(5),
            packet_loss: None,
        }
    }
}
