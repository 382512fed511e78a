use std::collections::VecDeque;
use std::time::Instant;

use crate::config::NetConfig;
use crate::net::{
    ClientConnection, ConnectionEvent, ConnectionState, DeliveryOutcome, OutgoingPacket, Packet,
    PacketListener, PacketNotification, Payload,
};
use crate::physics::ShipSimulation;
use crate::prediction::{ClientGameData, ShipInput, ShipState};
use crate::replication::{
    MatchState, ReplicatedEntities, ReplicationReceiver, RpcTable, SingletonStore,
};

/// Everything a client needs to talk to one host: handshake, replication
/// intake and prediction of the local ship.
#[derive(Debug)]
pub struct ClientSession {
    config: NetConfig,
    connection: ClientConnection,
    receiver: ReplicationReceiver,
    game: ClientGameData,
    rpcs: RpcTable<ClientGameData>,
    singletons: SingletonStore,
    entities: ReplicatedEntities,
    events: VecDeque<ConnectionEvent>,
}

impl ClientSession {
    pub fn new(name: impl Into<String>, config: NetConfig, now: Instant) -> Self {
        let mut singletons = SingletonStore::new();
        singletons.register(MatchState::default());

        Self {
            connection: ClientConnection::new(name, &config, now),
            receiver: ReplicationReceiver::new(),
            game: ClientGameData::new(&config),
            rpcs: RpcTable::with_builtins(),
            singletons,
            entities: ReplicatedEntities::new(),
            events: VecDeque::new(),
            config,
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn connection(&self) -> &ClientConnection {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn game(&self) -> &ClientGameData {
        &self.game
    }

    pub fn singletons(&self) -> &SingletonStore {
        &self.singletons
    }

    pub fn entities(&self) -> &ReplicatedEntities {
        &self.entities
    }

    pub fn connect(&mut self, now: Instant) {
        self.connection.connect(now);
    }

    pub fn stop(&mut self) {
        self.connection.stop();
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain(..)
    }

    /// Validates an incoming packet and routes its payloads.
    pub fn receive(&mut self, packet: Packet, now: Instant) {
        if !self
            .connection
            .reliability_mut()
            .validate_packet(&packet.header)
        {
            return;
        }
        self.connection.touch(now);

        let notifications = self
            .connection
            .reliability_mut()
            .process_acks(&packet.header.ack_tags, now);
        self.dispatch(&notifications, now);

        for payload in packet.payloads {
            if self.connection.process(&payload) {
                continue;
            }
            if !self.connection.is_connected() {
                log::trace!("ignoring payload while {:?}", self.connection.state());
                continue;
            }
            match payload {
                Payload::Replication(replication) => self.receiver.process_payload(replication),
                Payload::PlayerState(snapshot) => self.game.process_snapshot(&snapshot),
                other => log::debug!("unexpected payload from host: {:?}", other),
            }
        }
    }

    /// One logic step: timeouts, replication application, prediction.
    pub fn update(
        &mut self,
        input: ShipInput,
        sim: &mut impl ShipSimulation,
        now: Instant,
    ) -> Option<ShipState> {
        let expired = self
            .connection
            .reliability_mut()
            .expire(now, self.config.in_flight_timeout);
        self.dispatch(&expired, now);
        self.connection.check_timeout(now);

        let events: Vec<ConnectionEvent> = self.connection.drain_events().collect();
        for event in events {
            self.on_connection_event(event, sim);
        }

        if !self.connection.is_connected() {
            return None;
        }

        self.receiver.replicate_rpcs(&self.rpcs, &mut self.game);
        self.receiver.replicate_singletons(&mut self.singletons);
        self.receiver.replicate_entities(&mut self.entities);

        self.game.tick(input, sim)
    }

    /// Builds this cycle's packet, or `None` when there is nothing to send.
    pub fn write(&mut self, now: Instant) -> Option<Packet> {
        let mut packet = OutgoingPacket::new();
        self.connection.reliability_mut().write(&mut packet);
        self.connection
            .write(&mut packet, self.game.frame_index(), now);
        if self.connection.is_connected() {
            self.game.write(&mut packet);
        }

        if !self
            .connection
            .reliability_mut()
            .register_packet(&mut packet, now)
        {
            return None;
        }
        Some(packet.into_packet())
    }

    fn dispatch(&mut self, notifications: &[PacketNotification], now: Instant) {
        for notification in notifications {
            match notification.listener {
                PacketListener::Hello => self.connection.on_notification(notification, now),
                PacketListener::Inputs { last_frame } => {
                    if notification.outcome == DeliveryOutcome::Delivered {
                        self.game.on_inputs_delivered(last_frame);
                    }
                }
                PacketListener::LoginSuccess | PacketListener::Replication => {}
            }
        }
    }

    fn on_connection_event(&mut self, event: ConnectionEvent, sim: &mut impl ShipSimulation) {
        match event {
            ConnectionEvent::Connected { ship_id, .. } => {
                let frame = self.game.frame_index();
                self.game
                    .spawn_own_ship(ship_id, &ShipState::spawn(ship_id, frame), sim);
            }
            ConnectionEvent::Disconnected { .. } => {
                if let Some(ship_id) = self.game.ship_id() {
                    sim.remove_ship(ship_id);
                }
                self.game.reset();
                self.receiver.clear();
            }
        }
        self.events.push_back(event);
    }
}
