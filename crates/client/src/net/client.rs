use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use drift::net::NetworkSimulator;
use drift::replication::MatchState;
use drift::{
    ClientSession, ConnectionEvent, ConnectionState, NetworkEndpoint, NetworkStats,
    PhysicsShipSimulation, ShipMovement, ShipState,
};

use super::config::ClientConfig;
use super::input::Pilot;

pub struct NetworkClient {
    endpoint: NetworkEndpoint,
    session: ClientSession,
    sim: PhysicsShipSimulation,
    incoming: NetworkSimulator,
    outgoing: NetworkSimulator,
    config: ClientConfig,
    server_addr: Option<SocketAddr>,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
    last_stats_log: Instant,
    latest_state: Option<ShipState>,
    running: Arc<AtomicBool>,
}

impl NetworkClient {
    pub fn new(config: ClientConfig) -> io::Result<Self> {
        let endpoint = NetworkEndpoint::bind("0.0.0.0:0")?;
        let tick_duration = Duration::from_secs_f64(1.0 / config.net.tick_rate as f64);

        let (incoming, outgoing) = match &config.packet_loss {
            Some(sim) => (
                NetworkSimulator::with_default(sim.clone()),
                NetworkSimulator::with_default(sim.clone()),
            ),
            None => (NetworkSimulator::new(), NetworkSimulator::new()),
        };

        let now = Instant::now();
        Ok(Self {
            endpoint,
            session: ClientSession::new(config.name.clone(), config.net.clone(), now),
            sim: PhysicsShipSimulation::new(config.net.dt(), ShipMovement::default()),
            incoming,
            outgoing,
            server_addr: None,
            tick_duration,
            last_tick_time: now,
            accumulator: Duration::ZERO,
            last_stats_log: now,
            latest_state: None,
            running: Arc::new(AtomicBool::new(true)),
            config,
        })
    }

    pub fn connect(&mut self, server_addr: SocketAddr) {
        log::info!("Connecting to {} as {}", server_addr, self.config.name);
        self.server_addr = Some(server_addr);
        self.session.connect(Instant::now());
    }

    pub fn state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn stats(&self) -> &NetworkStats {
        self.endpoint.stats()
    }

    /// Runs until the connection ends or `duration` elapses.
    pub fn run(&mut self, pilot: &mut Pilot, duration: Option<Duration>) -> io::Result<()> {
        let start = Instant::now();
        while self.running.load(Ordering::SeqCst) {
            if duration.is_some_and(|limit| start.elapsed() >= limit) {
                break;
            }
            self.tick_once(pilot)?;
            std::thread::sleep(Duration::from_millis(1));
        }
        self.disconnect()
    }

    /// Sends a graceful `Disconnect` if connected.
    pub fn disconnect(&mut self) -> io::Result<()> {
        if self.session.state() != ConnectionState::Connected {
            return Ok(());
        }
        self.session.stop();
        let now = Instant::now();
        if let (Some(packet), Some(addr)) = (self.session.write(now), self.server_addr) {
            self.endpoint.send_to(&packet, addr)?;
        }
        for event in self.session.drain_events() {
            log::debug!("{:?}", event);
        }
        Ok(())
    }

    pub fn tick_once(&mut self, pilot: &mut Pilot) -> io::Result<()> {
        let Some(server_addr) = self.server_addr else {
            return Ok(());
        };

        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        for (packet, addr) in self.endpoint.receive()? {
            if addr != server_addr {
                log::debug!("ignoring packet from {}", addr);
                continue;
            }
            self.incoming.enqueue(packet, addr, now);
        }
        for (packet, _) in self.incoming.release(now) {
            self.session.receive(packet, now);
        }

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;

            let frame = self.session.game().frame_index();
            let input = pilot.input(frame).to_ship_input();
            if let Some(state) = self.session.update(input, &mut self.sim, now) {
                self.latest_state = Some(state);
            }

            if let Some(packet) = self.session.write(now) {
                self.outgoing.enqueue(packet, server_addr, now);
            }
        }

        for (packet, addr) in self.outgoing.release(now) {
            if let Err(e) = self.endpoint.send_to(&packet, addr) {
                log::warn!("failed to send to {}: {}", addr, e);
            }
        }

        let events: Vec<ConnectionEvent> = self.session.drain_events().collect();
        for event in events {
            self.handle_event(event);
        }

        if now.duration_since(self.last_stats_log) >= self.config.stats_interval {
            self.last_stats_log = now;
            self.log_stats();
        }
        Ok(())
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { player_id, ship_id } => {
                log::info!("Connected as player {} flying ship {}", player_id, ship_id);
            }
            ConnectionEvent::Disconnected { reason } => {
                log::info!("Connection ended: {}", reason.as_str());
                self.latest_state = None;
                self.running.store(false, Ordering::SeqCst);
            }
        }
    }

    fn log_stats(&self) {
        if !self.session.is_connected() {
            log::info!("state {:?}", self.session.state());
            return;
        }

        let game = self.session.game();
        let connection = self.session.connection();
        log::info!(
            "frame {} | rtt {:.1} ms | {} rollbacks, {} desyncs | {} unacked inputs | {} remote ships",
            game.frame_index(),
            connection.rtt_ms(),
            game.rollbacks(),
            game.desyncs(),
            game.unacked_inputs().count(),
            game.visible_ships().count(),
        );
        if let Some(state) = &self.latest_state {
            log::debug!(
                "ship at ({:.2}, {:.2}) moving ({:.2}, {:.2})",
                state.position.x,
                state.position.z,
                state.velocity.x,
                state.velocity.z
            );
        }
        if let Some(match_state) = self.session.singletons().get::<MatchState>() {
            log::info!(
                "round {}, {} s left",
                match_state.round,
                match_state.time_remaining_ms / 1000
            );
        }
        log::debug!(
            "sent {} recv {} | sim dropped {}",
            self.stats().packets_sent,
            self.stats().packets_received,
            self.incoming.dropped() + self.outgoing.dropped()
        );
    }
}
