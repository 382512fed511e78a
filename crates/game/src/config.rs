use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::{DEFAULT_TICK_RATE, MAX_PACKET_SIZE};

/// Retry throttle for login attempts and replication resends.
///
/// The first retry after a failure goes out immediately; each further one
/// waits `base * factor^(n - 1)`, capped at `max`. With `max_attempts` set,
/// the caller gives up once that many failures have been recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub max_attempts: Option<u32>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(2),
            max_attempts: None,
        }
    }
}

impl Backoff {
    /// No throttling at all: every retry goes out on the next write.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            factor: 1.0,
            max: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Delay before the retry that follows failure number `failures`.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures <= 1 {
            return Duration::ZERO;
        }
        let exponent = (failures - 2).min(31) as i32;
        let scale = self.factor.powi(exponent).max(0.0);
        if self.base.as_secs_f64() * scale >= self.max.as_secs_f64() {
            return self.max;
        }
        self.base.mul_f64(scale)
    }

    pub fn exhausted(&self, failures: u32) -> bool {
        self.max_attempts.is_some_and(|max| failures >= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetConfig {
    pub tick_rate: u32,
    /// Silence from the peer for this long ends the connection.
    pub timeout_delay: Duration,
    pub ping_interval: Duration,
    /// In-flight packets older than this are presumed lost.
    pub in_flight_timeout: Duration,
    pub max_acks_per_packet: usize,
    pub login_backoff: Backoff,
    pub replication_backoff: Backoff,
    /// Most recent unacknowledged inputs repeated in every packet.
    pub max_input_sent: usize,
    /// Frames between two authoritative ship snapshots.
    pub snapshot_interval: u32,
    pub target_frame_lead: u32,
    pub frame_sync_tolerance: u32,
    pub desync_tolerance: f32,
    pub packet_budget: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            tick_rate: DEFAULT_TICK_RATE,
            timeout_delay: Duration::from_secs(10),
            ping_interval: Duration::from_millis(250),
            in_flight_timeout: Duration::from_secs(1),
            max_acks_per_packet: 64,
            login_backoff: Backoff::default(),
            replication_backoff: Backoff::default(),
            max_input_sent: 8,
            snapshot_interval: 7,
            target_frame_lead: 2,
            frame_sync_tolerance: 2,
            desync_tolerance: 1e-3,
            packet_budget: MAX_PACKET_SIZE - 64,
        }
    }
}

impl NetConfig {
    pub fn dt(&self) -> f32 {
        1.0 / self.tick_rate as f32
    }
}
