use std::time::Duration;

use drift::{NetConfig, PacketLossSimulation};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub max_clients: usize,
    pub net: NetConfig,
    /// Length of one match round, replicated to clients as `MatchState`.
    pub round_length: Duration,
    pub stats_interval: Duration,
    pub global_packet_loss: Option<PacketLossSimulation>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_clients: 32,
            net: NetConfig::default(),
            round_length: Duration::from_secs(180),
            stats_interval: Duration::from_secs(5),
            global_packet_loss: None,
        }
    }
}
