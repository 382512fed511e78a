use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use drift::net::NetworkSimulator;
use drift::replication::{MatchState, ReplicationFlags, singleton_payload};
use drift::{
    HostEvent, HostSession, NetworkEndpoint, NetworkStats, PhysicsShipSimulation, SessionError,
    ShipMovement,
};

use crate::config::ServerConfig;

pub struct GameServer {
    endpoint: NetworkEndpoint,
    session: HostSession,
    sim: PhysicsShipSimulation,
    incoming: NetworkSimulator,
    outgoing: NetworkSimulator,
    config: ServerConfig,
    match_state: MatchState,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    last_match_broadcast: Instant,
    last_stats_log: Instant,
    running: Arc<AtomicBool>,
}

impl GameServer {
    pub fn new(bind_addr: &str, config: ServerConfig) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind(bind_addr)?;
        let tick_duration = Duration::from_secs_f64(1.0 / config.net.tick_rate as f64);

        let (incoming, outgoing) = match &config.global_packet_loss {
            Some(sim) => (
                NetworkSimulator::with_default(sim.clone()),
                NetworkSimulator::with_default(sim.clone()),
            ),
            None => (NetworkSimulator::new(), NetworkSimulator::new()),
        };

        let now = Instant::now();
        Ok(Self {
            endpoint,
            session: HostSession::new(config.net.clone(), config.max_clients),
            sim: PhysicsShipSimulation::new(config.net.dt(), ShipMovement::default()),
            incoming,
            outgoing,
            match_state: MatchState {
                round: 1,
                time_remaining_ms: config.round_length.as_millis() as u32,
            },
            tick_duration,
            last_tick_time: now,
            accumulator: Duration::ZERO,
            last_match_broadcast: now,
            last_stats_log: now,
            running: Arc::new(AtomicBool::new(true)),
            config,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    /// Shared flag that ends [`Self::run`] once cleared.
    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn run(&mut self) -> io::Result<()> {
        while self.running.load(Ordering::SeqCst) {
            self.tick_once()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections()
    }

    pub fn run_for(&mut self, duration: Duration) -> io::Result<()> {
        let start = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            if start.elapsed() >= duration {
                self.stop();
                break;
            }
            self.tick_once()?;
            std::thread::sleep(Duration::from_millis(1));
        }
        self.shutdown_connections()
    }

    /// Kicks everyone and flushes the resulting `Disconnect` packets.
    pub fn shutdown_connections(&mut self) -> io::Result<()> {
        for player_id in self.session.player_ids() {
            self.kick_player(player_id);
        }
        for (addr, packet) in self.session.write(Instant::now()) {
            self.endpoint.send_to(&packet, addr)?;
        }
        Ok(())
    }

    pub fn kick_player(&mut self, player_id: u32) {
        if let Err(e) = self.session.kick(player_id) {
            log::warn!("cannot kick: {}", e);
        }
    }

    pub fn tick_once(&mut self) -> io::Result<()> {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        self.process_network(now)?;

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick(now);
        }

        for (addr, packet) in self.session.write(now) {
            self.outgoing.enqueue(packet, addr, now);
        }
        for (packet, addr) in self.outgoing.release(now) {
            if let Err(e) = self.endpoint.send_to(&packet, addr) {
                log::warn!("failed to send to {}: {}", addr, e);
            }
        }

        if now.duration_since(self.last_stats_log) >= self.config.stats_interval {
            self.last_stats_log = now;
            self.log_stats();
        }
        Ok(())
    }

    fn process_network(&mut self, now: Instant) -> io::Result<()> {
        for (packet, addr) in self.endpoint.receive()? {
            self.incoming.enqueue(packet, addr, now);
        }

        for (packet, addr) in self.incoming.release(now) {
            match self.session.receive(addr, packet, now) {
                Ok(()) => {}
                Err(SessionError::UnknownPeer(addr)) => {
                    log::trace!("ignoring packet from unknown peer {}", addr)
                }
                Err(e) => log::warn!("rejected packet from {}: {}", addr, e),
            }
        }
        Ok(())
    }

    fn tick(&mut self, now: Instant) {
        self.session.tick(&mut self.sim, now);
        self.advance_match(now);

        let events: Vec<HostEvent> = self.session.drain_events().collect();
        for event in events {
            self.handle_event(event);
        }
    }

    fn advance_match(&mut self, now: Instant) {
        let elapsed = self.tick_duration.as_millis() as u32;
        match self.match_state.time_remaining_ms.checked_sub(elapsed) {
            Some(remaining) if remaining > 0 => self.match_state.time_remaining_ms = remaining,
            _ => {
                self.match_state.round += 1;
                self.match_state.time_remaining_ms = self.config.round_length.as_millis() as u32;
                log::info!("round {} begins", self.match_state.round);
            }
        }

        // Periodic refreshes are superseded by the next one, so a lost one
        // is not worth resending.
        if now.duration_since(self.last_match_broadcast) >= Duration::from_secs(1) {
            self.last_match_broadcast = now;
            if let Err(e) = self
                .session
                .replicate_singleton(&self.match_state, ReplicationFlags::empty())
            {
                log::warn!("failed to replicate match state: {}", e);
            }
        }
    }

    fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::PlayerJoined {
                player_id,
                ship_id,
                addr,
            } => {
                log::info!("player {} joined from {} (ship {})", player_id, addr, ship_id);
                let sent = singleton_payload(&self.match_state)
                    .map_err(SessionError::from)
                    .and_then(|payload| {
                        self.session.replicate_to(
                            player_id,
                            payload,
                            ReplicationFlags::RESEND_UNTIL_REPLICATED,
                        )
                    });
                if let Err(e) = sent {
                    log::warn!("failed to send match state to player {}: {}", player_id, e);
                }
            }
            HostEvent::PlayerLeft {
                player_id,
                ship_id,
                reason,
            } => {
                log::info!(
                    "player {} left ({}), ship {} removed",
                    player_id,
                    reason.as_str(),
                    ship_id
                );
            }
            HostEvent::Replicated { .. } => {}
            HostEvent::ReplicationAbandoned { player_id, handle } => {
                log::warn!("gave up replicating {:?} to player {}", handle, player_id);
            }
        }
    }

    fn log_stats(&self) {
        let stats = self.stats();
        log::info!(
            "frame {} | {}/{} players | {} ships | sent {} recv {} rejected {} | sim dropped {}",
            stats.frame_index,
            stats.client_count,
            stats.max_clients,
            stats.ship_count,
            stats.network_stats.packets_sent,
            stats.network_stats.packets_received,
            self.endpoint.rejected(),
            self.incoming.dropped() + self.outgoing.dropped(),
        );
        for player_id in self.session.player_ids() {
            if let Some(peer) = self.session.peer(player_id) {
                log::debug!(
                    "player {}: rtt {:.1} ms, {} late / {} missing inputs",
                    player_id,
                    peer.connection.rtt_ms(),
                    peer.game.late_inputs(),
                    peer.game.missing_inputs()
                );
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            frame_index: self.session.frame_index(),
            client_count: self.session.connected_count(),
            max_clients: self.config.max_clients,
            ship_count: self.sim.ship_ids().count(),
            network_stats: self.endpoint.stats().clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerStats {
    pub frame_index: u32,
    pub client_count: usize,
    pub max_clients: usize,
    pub ship_count: usize,
    pub network_stats: NetworkStats,
}
