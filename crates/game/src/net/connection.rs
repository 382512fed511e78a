use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::config::{Backoff, NetConfig};

use super::protocol::{DeliveryOutcome, OutgoingPacket, PacketListener, PacketNotification, Payload};
use super::reliability::ReliabilityLayer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    PendingConnection,
    Connected,
    /// Waiting for the next write to flush a `Disconnect`.
    Stopping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Graceful,
    Remote,
    Timeout,
    Kicked,
    LoginAbandoned,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Graceful => "disconnected",
            DisconnectReason::Remote => "disconnected by peer",
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Kicked => "kicked",
            DisconnectReason::LoginAbandoned => "gave up logging in",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { player_id: u32, ship_id: u32 },
    Disconnected { reason: DisconnectReason },
}

/// Client side of the handshake state machine.
#[derive(Debug)]
pub struct ClientConnection {
    state: ConnectionState,
    reliability: ReliabilityLayer,
    name: String,
    auto_connect: bool,
    player_id: Option<u32>,
    ship_id: Option<u32>,
    rtt_ms: f32,
    timeout_delay: Duration,
    last_response: Instant,
    pending_ping_ack: Option<u32>,
    login_backoff: Backoff,
    login_failures: u32,
    next_login_at: Option<Instant>,
    events: VecDeque<ConnectionEvent>,
}

impl ClientConnection {
    pub fn new(name: impl Into<String>, config: &NetConfig, now: Instant) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reliability: ReliabilityLayer::new(config.max_acks_per_packet),
            name: name.into(),
            auto_connect: false,
            player_id: None,
            ship_id: None,
            rtt_ms: 0.0,
            timeout_delay: config.timeout_delay,
            last_response: now,
            pending_ping_ack: None,
            login_backoff: config.login_backoff.clone(),
            login_failures: 0,
            next_login_at: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn player_id(&self) -> Option<u32> {
        self.player_id
    }

    pub fn ship_id(&self) -> Option<u32> {
        self.ship_id
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt_ms
    }

    pub fn login_failures(&self) -> u32 {
        self.login_failures
    }

    pub fn reliability(&self) -> &ReliabilityLayer {
        &self.reliability
    }

    pub fn reliability_mut(&mut self) -> &mut ReliabilityLayer {
        &mut self.reliability
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain(..)
    }

    /// Starts (or restarts) the login loop; the next write sends `Hello`.
    /// Sequencing starts over, so a host that dropped us sees tag 0 again.
    pub fn connect(&mut self, now: Instant) {
        if self.state == ConnectionState::Disconnected {
            self.reliability.reset();
        }
        self.auto_connect = true;
        self.login_failures = 0;
        self.next_login_at = None;
        self.last_response = now;
    }

    /// Requests a graceful disconnect, flushed on the next write.
    pub fn stop(&mut self) {
        self.auto_connect = false;
        match self.state {
            ConnectionState::Connected | ConnectionState::PendingConnection => {
                log::info!("connection stopping");
                self.state = ConnectionState::Stopping;
            }
            ConnectionState::Disconnected | ConnectionState::Stopping => {}
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_response = now;
    }

    pub fn write(&mut self, packet: &mut OutgoingPacket, client_frame: u32, now: Instant) {
        match self.state {
            ConnectionState::Disconnected => {
                if !self.auto_connect || self.next_login_at.is_some_and(|at| now < at) {
                    return;
                }
                log::debug!(
                    "sending hello as {} (attempt {})",
                    self.name,
                    self.login_failures + 1
                );
                packet.push(Payload::Hello {
                    name: self.name.clone(),
                });
                packet.listen(PacketListener::Hello);
                self.state = ConnectionState::PendingConnection;
            }
            ConnectionState::PendingConnection => {}
            ConnectionState::Connected => {
                if let Some(ping_id) = self.pending_ping_ack.take() {
                    packet.push(Payload::PingAck {
                        ping_id,
                        client_frame,
                    });
                }
            }
            ConnectionState::Stopping => {
                packet.push(Payload::Disconnect);
                self.terminate(DisconnectReason::Graceful);
            }
        }
    }

    /// Handles handshake payloads; returns false for payloads owned by
    /// another subsystem.
    pub fn process(&mut self, payload: &Payload) -> bool {
        match payload {
            Payload::LoginSuccess { player_id, ship_id } => {
                if matches!(
                    self.state,
                    ConnectionState::Disconnected | ConnectionState::PendingConnection
                ) && self.auto_connect
                {
                    log::info!("logged in as player {} (ship {})", player_id, ship_id);
                    self.state = ConnectionState::Connected;
                    self.player_id = Some(*player_id);
                    self.ship_id = Some(*ship_id);
                    self.login_failures = 0;
                    self.next_login_at = None;
                    self.events.push_back(ConnectionEvent::Connected {
                        player_id: *player_id,
                        ship_id: *ship_id,
                    });
                }
                true
            }
            Payload::Disconnect => {
                if self.state != ConnectionState::Disconnected {
                    self.terminate(DisconnectReason::Remote);
                }
                true
            }
            Payload::Ping {
                ping_id,
                previous_rtt_ms,
            } => {
                if self.state == ConnectionState::Connected {
                    self.rtt_ms = *previous_rtt_ms;
                    self.pending_ping_ack = Some(*ping_id);
                }
                true
            }
            Payload::Hello { .. } | Payload::PingAck { .. } => true,
            _ => false,
        }
    }

    pub fn on_notification(&mut self, notification: &PacketNotification, now: Instant) {
        if notification.listener != PacketListener::Hello
            || notification.outcome != DeliveryOutcome::Dropped
            || self.state != ConnectionState::PendingConnection
        {
            return;
        }

        self.login_failures += 1;
        if self.login_backoff.exhausted(self.login_failures) {
            log::warn!("login failed {} times, giving up", self.login_failures);
            self.terminate(DisconnectReason::LoginAbandoned);
            return;
        }

        let delay = self.login_backoff.delay(self.login_failures);
        log::debug!("hello lost, retrying in {:?}", delay);
        self.state = ConnectionState::Disconnected;
        self.next_login_at = Some(now + delay);
    }

    /// Ends a silent connection. Returns true when the timeout fired.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.state != ConnectionState::Connected {
            return false;
        }
        if now.saturating_duration_since(self.last_response) <= self.timeout_delay {
            return false;
        }
        log::warn!(
            "no response from host for {:?}, dropping connection",
            self.timeout_delay
        );
        self.terminate(DisconnectReason::Timeout);
        true
    }

    fn terminate(&mut self, reason: DisconnectReason) {
        log::info!("connection closed: {}", reason.as_str());
        self.state = ConnectionState::Disconnected;
        self.auto_connect = false;
        self.player_id = None;
        self.ship_id = None;
        self.pending_ping_ack = None;
        self.next_login_at = None;
        self.events
            .push_back(ConnectionEvent::Disconnected { reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hello_dropped() -> PacketNotification {
        PacketNotification {
            tag: 0,
            outcome: DeliveryOutcome::Dropped,
            listener: PacketListener::Hello,
        }
    }

    fn written(connection: &mut ClientConnection, now: Instant) -> Vec<Payload> {
        let mut packet = OutgoingPacket::new();
        connection.write(&mut packet, 0, now);
        packet.into_packet().payloads
    }

    #[test]
    fn hello_only_after_connect() {
        let now = Instant::now();
        let mut connection = ClientConnection::new("pilot", &NetConfig::default(), now);

        assert!(written(&mut connection, now).is_empty());

        connection.connect(now);
        let payloads = written(&mut connection, now);
        assert!(matches!(payloads.as_slice(), [Payload::Hello { .. }]));
        assert_eq!(connection.state(), ConnectionState::PendingConnection);

        assert!(written(&mut connection, now).is_empty());
    }

    #[test]
    fn lost_hello_retries_on_next_write() {
        let now = Instant::now();
        let mut connection = ClientConnection::new("pilot", &NetConfig::default(), now);
        connection.connect(now);
        written(&mut connection, now);

        connection.on_notification(&hello_dropped(), now);

        assert_eq!(connection.state(), ConnectionState::Disconnected);
        let payloads = written(&mut connection, now);
        assert!(matches!(payloads.as_slice(), [Payload::Hello { .. }]));
    }

    #[test]
    fn repeated_login_failures_back_off() {
        let now = Instant::now();
        let config = NetConfig::default();
        let mut connection = ClientConnection::new("pilot", &config, now);
        connection.connect(now);

        written(&mut connection, now);
        connection.on_notification(&hello_dropped(), now);
        written(&mut connection, now);
        connection.on_notification(&hello_dropped(), now);

        assert!(written(&mut connection, now).is_empty());
        let later = now + config.login_backoff.base;
        assert!(matches!(
            written(&mut connection, later).as_slice(),
            [Payload::Hello { .. }]
        ));
    }

    #[test]
    fn login_cap_abandons() {
        let now = Instant::now();
        let mut config = NetConfig::default();
        config.login_backoff.max_attempts = Some(1);
        let mut connection = ClientConnection::new("pilot", &config, now);
        connection.connect(now);
        written(&mut connection, now);

        connection.on_notification(&hello_dropped(), now);

        assert!(written(&mut connection, now).is_empty());
        assert_eq!(
            connection.drain_events().collect::<Vec<_>>(),
            vec![ConnectionEvent::Disconnected {
                reason: DisconnectReason::LoginAbandoned
            }]
        );
    }

    #[test]
    fn login_success_connects() {
        let now = Instant::now();
        let mut connection = ClientConnection::new("pilot", &NetConfig::default(), now);
        connection.connect(now);
        written(&mut connection, now);

        assert!(connection.process(&Payload::LoginSuccess {
            player_id: 4,
            ship_id: 9
        }));

        assert!(connection.is_connected());
        assert_eq!(connection.player_id(), Some(4));
        assert_eq!(
            connection.drain_events().collect::<Vec<_>>(),
            vec![ConnectionEvent::Connected {
                player_id: 4,
                ship_id: 9
            }]
        );
    }

    #[test]
    fn ping_is_answered_on_next_write() {
        let now = Instant::now();
        let mut connection = ClientConnection::new("pilot", &NetConfig::default(), now);
        connection.connect(now);
        written(&mut connection, now);
        connection.process(&Payload::LoginSuccess {
            player_id: 1,
            ship_id: 1,
        });

        connection.process(&Payload::Ping {
            ping_id: 12,
            previous_rtt_ms: 48.0,
        });
        let mut packet = OutgoingPacket::new();
        connection.write(&mut packet, 300, now);

        assert_eq!(connection.rtt_ms(), 48.0);
        assert_eq!(
            packet.into_packet().payloads,
            vec![Payload::PingAck {
                ping_id: 12,
                client_frame: 300
            }]
        );
    }

    #[test]
    fn stop_flushes_disconnect_first() {
        let now = Instant::now();
        let mut connection = ClientConnection::new("pilot", &NetConfig::default(), now);
        connection.connect(now);
        written(&mut connection, now);
        connection.process(&Payload::LoginSuccess {
            player_id: 1,
            ship_id: 1,
        });

        connection.stop();
        assert_eq!(connection.state(), ConnectionState::Stopping);

        let payloads = written(&mut connection, now);
        assert_eq!(payloads, vec![Payload::Disconnect]);
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert!(written(&mut connection, now).is_empty());
    }

    #[test]
    fn silence_times_out() {
        let now = Instant::now();
        let config = NetConfig::default();
        let mut connection = ClientConnection::new("pilot", &config, now);
        connection.connect(now);
        written(&mut connection, now);
        connection.process(&Payload::LoginSuccess {
            player_id: 1,
            ship_id: 1,
        });

        assert!(!connection.check_timeout(now + config.timeout_delay));
        assert!(connection.check_timeout(now + config.timeout_delay + Duration::from_millis(1)));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }
}
