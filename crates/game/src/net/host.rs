use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::config::NetConfig;

use super::connection::{ConnectionEvent, ConnectionState, DisconnectReason};
use super::protocol::{DeliveryOutcome, OutgoingPacket, PacketListener, PacketNotification, Payload};
use super::reliability::ReliabilityLayer;

/// Frame counter the client reported in a `PingAck`, with the RTT measured
/// by that same round trip.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub ping_id: u32,
    pub client_frame: u32,
    pub rtt_ms: f32,
}

/// Host side of one peer's handshake state machine.
#[derive(Debug)]
pub struct HostConnection {
    pub addr: SocketAddr,
    pub player_id: u32,
    pub ship_id: u32,
    pub name: String,
    state: ConnectionState,
    reliability: ReliabilityLayer,
    login_success_due: bool,
    rtt_ms: f32,
    timeout_delay: Duration,
    ping_interval: Duration,
    last_response: Instant,
    next_ping_id: u32,
    /// Unanswered ping, cleared by its ack.
    last_ping: Option<(u32, Instant)>,
    last_ping_sent: Option<Instant>,
    frame_report: Option<FrameReport>,
    events: VecDeque<ConnectionEvent>,
}

impl HostConnection {
    pub fn new(
        addr: SocketAddr,
        player_id: u32,
        ship_id: u32,
        config: &NetConfig,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            player_id,
            ship_id,
            name: String::new(),
            state: ConnectionState::Disconnected,
            reliability: ReliabilityLayer::new(config.max_acks_per_packet),
            login_success_due: false,
            rtt_ms: 0.0,
            timeout_delay: config.timeout_delay,
            ping_interval: config.ping_interval,
            last_response: now,
            next_ping_id: 0,
            last_ping: None,
            last_ping_sent: None,
            frame_report: None,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn rtt_ms(&self) -> f32 {
        self.rtt_ms
    }

    pub fn next_ping_id(&self) -> u32 {
        self.next_ping_id
    }

    pub fn reliability(&self) -> &ReliabilityLayer {
        &self.reliability
    }

    pub fn reliability_mut(&mut self) -> &mut ReliabilityLayer {
        &mut self.reliability
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_response = now;
    }

    pub fn take_frame_report(&mut self) -> Option<FrameReport> {
        self.frame_report.take()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain(..)
    }

    /// Asks the peer to leave; the `Disconnect` goes out on the next write.
    pub fn kick(&mut self) {
        if self.state != ConnectionState::Disconnected {
            log::info!("kicking player {}", self.player_id);
            self.state = ConnectionState::Stopping;
        }
    }

    pub fn process(&mut self, payload: &Payload, now: Instant) -> bool {
        match payload {
            Payload::Hello { name } => {
                match self.state {
                    ConnectionState::Disconnected | ConnectionState::PendingConnection => {
                        if self.state == ConnectionState::Disconnected {
                            log::info!("{} says hello from {}", name, self.addr);
                        }
                        self.name.clone_from(name);
                        self.state = ConnectionState::PendingConnection;
                        self.login_success_due = true;
                    }
                    // LoginSuccess got through but the client still retries.
                    ConnectionState::Connected => self.login_success_due = true,
                    ConnectionState::Stopping => {}
                }
                true
            }
            Payload::PingAck {
                ping_id,
                client_frame,
            } => {
                if let Some((_, sent_at)) = self.last_ping.filter(|(id, _)| id == ping_id) {
                    self.rtt_ms = now.saturating_duration_since(sent_at).as_secs_f32() * 1000.0;
                    self.frame_report = Some(FrameReport {
                        ping_id: *ping_id,
                        client_frame: *client_frame,
                        rtt_ms: self.rtt_ms,
                    });
                    self.last_ping = None;
                }
                true
            }
            Payload::Disconnect => {
                if self.state != ConnectionState::Disconnected {
                    self.terminate(DisconnectReason::Remote);
                }
                true
            }
            Payload::LoginSuccess { .. } | Payload::Ping { .. } => true,
            _ => false,
        }
    }

    pub fn write(&mut self, packet: &mut OutgoingPacket, now: Instant) {
        match self.state {
            ConnectionState::Disconnected => {}
            ConnectionState::PendingConnection => {
                if self.login_success_due {
                    self.push_login_success(packet);
                }
            }
            ConnectionState::Connected => {
                if self.login_success_due {
                    self.push_login_success(packet);
                }
                let ping_due = self
                    .last_ping_sent
                    .is_none_or(|sent_at| now.saturating_duration_since(sent_at) >= self.ping_interval);
                if ping_due {
                    let ping_id = self.next_ping_id;
                    self.next_ping_id = self.next_ping_id.wrapping_add(1);
                    packet.push(Payload::Ping {
                        ping_id,
                        previous_rtt_ms: self.rtt_ms,
                    });
                    self.last_ping = Some((ping_id, now));
                    self.last_ping_sent = Some(now);
                }
            }
            ConnectionState::Stopping => {
                packet.push(Payload::Disconnect);
                self.terminate(DisconnectReason::Kicked);
            }
        }
    }

    pub fn on_notification(&mut self, notification: &PacketNotification) {
        if notification.listener != PacketListener::LoginSuccess {
            return;
        }
        match (notification.outcome, self.state) {
            (DeliveryOutcome::Delivered, ConnectionState::PendingConnection) => {
                log::info!(
                    "player {} ({}) connected from {}",
                    self.player_id,
                    self.name,
                    self.addr
                );
                self.state = ConnectionState::Connected;
                self.events.push_back(ConnectionEvent::Connected {
                    player_id: self.player_id,
                    ship_id: self.ship_id,
                });
            }
            (DeliveryOutcome::Dropped, ConnectionState::PendingConnection) => {
                log::debug!("login success to {} lost, resending", self.addr);
                self.login_success_due = true;
            }
            _ => {}
        }
    }

    /// Ends a silent peer. Returns true when the timeout fired.
    pub fn check_timeout(&mut self, now: Instant) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }
        if now.saturating_duration_since(self.last_response) <= self.timeout_delay {
            return false;
        }
        log::warn!("player {} at {} timed out", self.player_id, self.addr);
        self.terminate(DisconnectReason::Timeout);
        true
    }

    fn push_login_success(&mut self, packet: &mut OutgoingPacket) {
        packet.push(Payload::LoginSuccess {
            player_id: self.player_id,
            ship_id: self.ship_id,
        });
        packet.listen(PacketListener::LoginSuccess);
        self.login_success_due = false;
    }

    fn terminate(&mut self, reason: DisconnectReason) {
        log::info!("player {} {}", self.player_id, reason.as_str());
        self.state = ConnectionState::Disconnected;
        self.login_success_due = false;
        self.events
            .push_back(ConnectionEvent::Disconnected { reason });
    }
}

/// Peer table keyed by address, bounded by `max_clients`.
#[derive(Debug)]
pub struct ConnectionManager<P> {
    peers_by_addr: HashMap<SocketAddr, u32>,
    peers: HashMap<u32, P>,
    next_player_id: u32,
    max_clients: usize,
}

impl<P> ConnectionManager<P> {
    pub fn new(max_clients: usize) -> Self {
        Self {
            peers_by_addr: HashMap::new(),
            peers: HashMap::new(),
            next_player_id: 1,
            max_clients,
        }
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.peers_by_addr.contains_key(addr)
    }

    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.max_clients
    }

    /// Registers a new peer built by `make` from a fresh player id.
    pub fn insert_with(&mut self, addr: SocketAddr, make: impl FnOnce(u32) -> P) -> Option<&mut P> {
        if self.is_full() || self.contains(&addr) {
            return None;
        }

        let player_id = self.next_player_id;
        self.next_player_id += 1;

        self.peers.insert(player_id, make(player_id));
        self.peers_by_addr.insert(addr, player_id);
        self.peers.get_mut(&player_id)
    }

    pub fn get_by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut P> {
        let id = self.peers_by_addr.get(addr)?;
        self.peers.get_mut(id)
    }

    pub fn get(&self, player_id: u32) -> Option<&P> {
        self.peers.get(&player_id)
    }

    pub fn get_mut(&mut self, player_id: u32) -> Option<&mut P> {
        self.peers.get_mut(&player_id)
    }

    pub fn remove(&mut self, player_id: u32) -> Option<P> {
        let peer = self.peers.remove(&player_id)?;
        self.peers_by_addr.retain(|_, id| *id != player_id);
        Some(peer)
    }

    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.peers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.peers.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut P> {
        self.peers.values_mut()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn notification(listener: PacketListener, outcome: DeliveryOutcome) -> PacketNotification {
        PacketNotification {
            tag: 0,
            outcome,
            listener,
        }
    }

    fn written(connection: &mut HostConnection, now: Instant) -> Vec<Payload> {
        let mut packet = OutgoingPacket::new();
        connection.write(&mut packet, now);
        packet.into_packet().payloads
    }

    fn connected(now: Instant) -> HostConnection {
        let mut connection = HostConnection::new(addr(), 1, 10, &NetConfig::default(), now);
        connection.process(
            &Payload::Hello {
                name: "pilot".into(),
            },
            now,
        );
        written(&mut connection, now);
        connection.on_notification(&notification(
            PacketListener::LoginSuccess,
            DeliveryOutcome::Delivered,
        ));
        connection
    }

    #[test]
    fn hello_schedules_login_success() {
        let now = Instant::now();
        let mut connection = HostConnection::new(addr(), 3, 7, &NetConfig::default(), now);

        connection.process(
            &Payload::Hello {
                name: "pilot".into(),
            },
            now,
        );

        assert_eq!(connection.state(), ConnectionState::PendingConnection);
        assert_eq!(
            written(&mut connection, now),
            vec![Payload::LoginSuccess {
                player_id: 3,
                ship_id: 7
            }]
        );
        assert!(written(&mut connection, now).is_empty());
    }

    #[test]
    fn lost_login_success_is_resent() {
        let now = Instant::now();
        let mut connection = HostConnection::new(addr(), 1, 1, &NetConfig::default(), now);
        connection.process(&Payload::Hello { name: "a".into() }, now);
        written(&mut connection, now);

        connection.on_notification(&notification(
            PacketListener::LoginSuccess,
            DeliveryOutcome::Dropped,
        ));

        assert!(matches!(
            written(&mut connection, now).as_slice(),
            [Payload::LoginSuccess { .. }]
        ));
    }

    #[test]
    fn delivered_login_success_connects() {
        let now = Instant::now();
        let mut connection = connected(now);

        assert!(connection.is_connected());
        assert_eq!(
            connection.drain_events().collect::<Vec<_>>(),
            vec![ConnectionEvent::Connected {
                player_id: 1,
                ship_id: 10
            }]
        );
    }

    #[test]
    fn ping_round_trip_measures_rtt() {
        let now = Instant::now();
        let mut connection = connected(now);

        let payloads = written(&mut connection, now);
        let [Payload::Ping { ping_id, .. }] = payloads.as_slice() else {
            panic!("expected a ping, got {payloads:?}");
        };
        // Not due again until the interval elapses.
        assert!(written(&mut connection, now + Duration::from_millis(10)).is_empty());

        connection.process(
            &Payload::PingAck {
                ping_id: *ping_id,
                client_frame: 42,
            },
            now + Duration::from_millis(40),
        );

        let report = connection.take_frame_report().unwrap();
        assert_eq!(report.client_frame, 42);
        assert!((report.rtt_ms - 40.0).abs() < 1.0);
        assert!(connection.take_frame_report().is_none());
    }

    #[test]
    fn acked_ping_waits_for_the_interval() {
        let now = Instant::now();
        let mut connection = connected(now);
        let interval = NetConfig::default().ping_interval;

        let mut pings = 0;
        let mut at = now;
        while at < now + interval {
            for payload in written(&mut connection, at) {
                if let Payload::Ping { ping_id, .. } = payload {
                    pings += 1;
                    connection.process(
                        &Payload::PingAck {
                            ping_id,
                            client_frame: 1,
                        },
                        at + Duration::from_millis(5),
                    );
                }
            }
            at += Duration::from_millis(16);
        }
        assert_eq!(pings, 1);

        assert!(matches!(
            written(&mut connection, now + interval).as_slice(),
            [Payload::Ping { ping_id: 1, .. }]
        ));
    }

    #[test]
    fn unknown_ping_ack_ignored() {
        let now = Instant::now();
        let mut connection = connected(now);
        written(&mut connection, now);

        connection.process(
            &Payload::PingAck {
                ping_id: 99,
                client_frame: 1,
            },
            now,
        );
        assert!(connection.take_frame_report().is_none());
    }

    #[test]
    fn kick_flushes_disconnect() {
        let now = Instant::now();
        let mut connection = connected(now);
        connection.drain_events().count();

        connection.kick();
        let payloads = written(&mut connection, now);

        assert!(payloads.contains(&Payload::Disconnect));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        assert_eq!(
            connection.drain_events().collect::<Vec<_>>(),
            vec![ConnectionEvent::Disconnected {
                reason: DisconnectReason::Kicked
            }]
        );
    }

    #[test]
    fn pending_peer_times_out() {
        let now = Instant::now();
        let config = NetConfig::default();
        let mut connection = HostConnection::new(addr(), 1, 1, &config, now);
        connection.process(&Payload::Hello { name: "a".into() }, now);

        assert!(connection.check_timeout(now + config.timeout_delay * 2));
        assert_eq!(connection.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn manager_refuses_when_full() {
        let mut manager: ConnectionManager<u32> = ConnectionManager::new(1);
        let first: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let second: SocketAddr = "127.0.0.1:2".parse().unwrap();

        assert_eq!(manager.insert_with(first, |id| id).copied(), Some(1));
        assert!(manager.insert_with(second, |id| id).is_none());
        assert!(manager.insert_with(first, |id| id).is_none());

        assert_eq!(manager.remove(1), Some(1));
        assert!(!manager.contains(&first));
        assert_eq!(manager.insert_with(second, |id| id).copied(), Some(2));
    }
}
