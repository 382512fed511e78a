use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::Instant;

use crate::config::NetConfig;
use crate::net::{
    ConnectionEvent, ConnectionManager, DeliveryOutcome, DisconnectReason, HostConnection,
    OutgoingPacket, Packet, PacketListener, PacketNotification, Payload,
};
use crate::physics::ShipSimulation;
use crate::prediction::{HostGameData, ShipState};
use crate::replication::{
    ComponentState, EntityHandle, LinkingContext, NetId, ReplicationEvent, ReplicationFlags,
    ReplicationHandle, ReplicationManager, ReplicationPayload, Rpc, Singleton, singleton_payload,
};

use super::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    PlayerJoined {
        player_id: u32,
        ship_id: u32,
        addr: SocketAddr,
    },
    PlayerLeft {
        player_id: u32,
        ship_id: u32,
        reason: DisconnectReason,
    },
    Replicated {
        player_id: u32,
        handle: ReplicationHandle,
    },
    ReplicationAbandoned {
        player_id: u32,
        handle: ReplicationHandle,
    },
}

/// One remote player as seen by the host.
#[derive(Debug)]
pub struct HostPeer {
    pub connection: HostConnection,
    pub replication: ReplicationManager,
    pub game: HostGameData,
    sync_handle: Option<ReplicationHandle>,
    sync_delta: i32,
    first_ping_after_sync: u32,
}

impl HostPeer {
    fn new(connection: HostConnection, config: &NetConfig) -> Self {
        let ship_id = connection.ship_id;
        Self {
            connection,
            replication: ReplicationManager::new(
                config.replication_backoff.clone(),
                config.packet_budget,
            ),
            game: HostGameData::new(ship_id, config.snapshot_interval),
            sync_handle: None,
            sync_delta: 0,
            first_ping_after_sync: 0,
        }
    }

    pub fn sync_pending(&self) -> bool {
        self.sync_handle.is_some()
    }

    fn dispatch(&mut self, notifications: &[PacketNotification], now: Instant) {
        for notification in notifications {
            match notification.listener {
                PacketListener::LoginSuccess => self.connection.on_notification(notification),
                PacketListener::Replication => match notification.outcome {
                    DeliveryOutcome::Delivered => {
                        self.replication.on_replication_success(notification.tag)
                    }
                    DeliveryOutcome::Dropped => {
                        self.replication.on_replication_fail(notification.tag, now)
                    }
                },
                PacketListener::Hello | PacketListener::Inputs { .. } => {}
            }
        }
    }
}

/// Authoritative side of the game: peers, the global frame counter and the
/// per-frame simulation of every connected ship.
#[derive(Debug)]
pub struct HostSession {
    config: NetConfig,
    peers: ConnectionManager<HostPeer>,
    max_clients: usize,
    linking: LinkingContext,
    frame_index: u32,
    events: VecDeque<HostEvent>,
}

impl HostSession {
    pub fn new(config: NetConfig, max_clients: usize) -> Self {
        Self {
            config,
            peers: ConnectionManager::new(max_clients),
            max_clients,
            linking: LinkingContext::new(),
            frame_index: 0,
            events: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn peer(&self, player_id: u32) -> Option<&HostPeer> {
        self.peers.get(player_id)
    }

    pub fn player_ids(&self) -> Vec<u32> {
        self.peers.ids()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|peer| peer.connection.is_connected())
            .count()
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = HostEvent> + '_ {
        self.events.drain(..)
    }

    /// Routes a packet from `addr`. Only a `Hello` may open a new peer.
    pub fn receive(
        &mut self,
        addr: SocketAddr,
        packet: Packet,
        now: Instant,
    ) -> Result<(), SessionError> {
        if !self.peers.contains(&addr) {
            let is_hello = packet
                .payloads
                .iter()
                .any(|p| matches!(p, Payload::Hello { .. }));
            if !is_hello {
                return Err(SessionError::UnknownPeer(addr));
            }
            if self.peers.is_full() {
                return Err(SessionError::ServerFull {
                    max: self.max_clients,
                });
            }
            let config = &self.config;
            self.peers.insert_with(addr, |player_id| {
                let connection = HostConnection::new(addr, player_id, player_id, config, now);
                HostPeer::new(connection, config)
            });
        }

        let frame_index = self.frame_index;
        let peer = self
            .peers
            .get_by_addr_mut(&addr)
            .ok_or(SessionError::UnknownPeer(addr))?;

        if !peer
            .connection
            .reliability_mut()
            .validate_packet(&packet.header)
        {
            return Ok(());
        }
        peer.connection.touch(now);

        let notifications = peer
            .connection
            .reliability_mut()
            .process_acks(&packet.header.ack_tags, now);
        peer.dispatch(&notifications, now);

        for payload in packet.payloads {
            if peer.connection.process(&payload, now) {
                continue;
            }
            match payload {
                Payload::PlayerInputs(inputs) if peer.connection.is_connected() => {
                    peer.game.process_inputs(&inputs, frame_index)
                }
                other => log::debug!(
                    "unexpected payload from player {}: {:?}",
                    peer.connection.player_id,
                    other
                ),
            }
        }
        Ok(())
    }

    /// Advances the world by one frame.
    pub fn tick(&mut self, sim: &mut impl ShipSimulation, now: Instant) {
        for player_id in self.peers.ids() {
            let Some(peer) = self.peers.get_mut(player_id) else {
                continue;
            };
            let expired = peer
                .connection
                .reliability_mut()
                .expire(now, self.config.in_flight_timeout);
            peer.dispatch(&expired, now);
            peer.connection.check_timeout(now);
        }

        self.handle_connection_events(sim);
        self.handle_replication_events();
        self.sync_frames();

        let frame = self.frame_index;
        for peer in self.peers.iter_mut() {
            if peer.connection.is_connected() {
                peer.game.save_state(frame, sim);
                peer.game.apply_input(frame, sim);
            }
        }
        sim.step();
        sim.sync_transforms();
        self.frame_index += 1;
    }

    /// One packet per peer with something to say.
    pub fn write(&mut self, now: Instant) -> Vec<(SocketAddr, Packet)> {
        let mut packets = Vec::new();
        for player_id in self.peers.ids() {
            let Some(peer) = self.peers.get_mut(player_id) else {
                continue;
            };

            let mut packet = OutgoingPacket::new();
            peer.connection.reliability_mut().write(&mut packet);
            peer.connection.write(&mut packet, now);
            if peer.connection.is_connected() {
                peer.replication.write(&mut packet, now);
                peer.game.write(&mut packet);
            }

            if peer
                .connection
                .reliability_mut()
                .register_packet(&mut packet, now)
            {
                packets.push((peer.connection.addr, packet.into_packet()));
            }
        }
        packets
    }

    pub fn kick(&mut self, player_id: u32) -> Result<(), SessionError> {
        let peer = self
            .peers
            .get_mut(player_id)
            .ok_or(SessionError::UnknownPlayer(player_id))?;
        peer.connection.kick();
        Ok(())
    }

    /// Queues `payload` for one connected player.
    pub fn replicate_to(
        &mut self,
        player_id: u32,
        payload: ReplicationPayload,
        flags: ReplicationFlags,
    ) -> Result<ReplicationHandle, SessionError> {
        let peer = self
            .peers
            .get_mut(player_id)
            .filter(|peer| peer.connection.is_connected())
            .ok_or(SessionError::UnknownPlayer(player_id))?;
        Ok(peer.replication.replicate(payload, flags)?)
    }

    /// Queues `payload` for every connected player.
    pub fn broadcast(
        &mut self,
        payload: &ReplicationPayload,
        flags: ReplicationFlags,
    ) -> Result<Vec<(u32, ReplicationHandle)>, SessionError> {
        let mut handles = Vec::new();
        for player_id in self.peers.ids() {
            if let Some(peer) = self
                .peers
                .get_mut(player_id)
                .filter(|peer| peer.connection.is_connected())
            {
                let handle = peer.replication.replicate(payload.clone(), flags)?;
                handles.push((player_id, handle));
            }
        }
        Ok(handles)
    }

    pub fn replicate_singleton<T: Singleton>(
        &mut self,
        value: &T,
        flags: ReplicationFlags,
    ) -> Result<Vec<(u32, ReplicationHandle)>, SessionError> {
        let payload = singleton_payload(value)?;
        self.broadcast(&payload, flags)
    }

    pub fn link_entity(&mut self, handle: EntityHandle) -> NetId {
        self.linking.link(handle)
    }

    pub fn unlink_entity(&mut self, handle: EntityHandle) -> Option<NetId> {
        self.linking.unlink(handle)
    }

    pub fn replicate_entity(
        &mut self,
        handle: EntityHandle,
        components: Vec<ComponentState>,
        flags: ReplicationFlags,
    ) -> Result<Vec<(u32, ReplicationHandle)>, SessionError> {
        let payload = self
            .linking
            .entity_payload(handle, components)
            .ok_or(SessionError::UnlinkedEntity(handle))?;
        self.broadcast(&payload, flags)
    }

    pub fn send_rpc(
        &mut self,
        player_id: u32,
        rpc: Rpc,
        flags: ReplicationFlags,
    ) -> Result<ReplicationHandle, SessionError> {
        self.replicate_to(player_id, rpc.payload(), flags)
    }

    fn handle_connection_events(&mut self, sim: &mut impl ShipSimulation) {
        let mut joined = Vec::new();
        let mut left = Vec::new();

        for player_id in self.peers.ids() {
            let Some(peer) = self.peers.get_mut(player_id) else {
                continue;
            };
            for event in peer.connection.drain_events() {
                match event {
                    ConnectionEvent::Connected { ship_id, .. } => joined.push((player_id, ship_id)),
                    ConnectionEvent::Disconnected { reason } => {
                        left.push((player_id, reason))
                    }
                }
            }
        }

        for (player_id, reason) in left {
            if let Some(peer) = self.peers.remove(player_id) {
                let ship_id = peer.game.ship_id();
                sim.remove_ship(ship_id);
                self.events.push_back(HostEvent::PlayerLeft {
                    player_id,
                    ship_id,
                    reason,
                });
            }
        }

        for (player_id, ship_id) in joined {
            self.spawn_ship(player_id, ship_id, sim);
        }
    }

    fn spawn_ship(&mut self, player_id: u32, ship_id: u32, sim: &mut impl ShipSimulation) {
        let frame = self.frame_index;
        sim.spawn_ship(ship_id, &ShipState::spawn(ship_id, frame));

        let mut existing = Vec::new();
        for other_id in self.peers.ids() {
            if other_id == player_id {
                continue;
            }
            let Some(other) = self
                .peers
                .get_mut(other_id)
                .filter(|peer| peer.connection.is_connected())
            else {
                continue;
            };
            existing.push(other.game.ship_id());
            let spawn = Rpc::Spawn {
                net_id: ship_id,
                valid_from_frame: frame,
            };
            if let Err(e) = other
                .replication
                .replicate(spawn.payload(), ReplicationFlags::RESEND_UNTIL_REPLICATED)
            {
                log::warn!("cannot announce ship {} to player {}: {}", ship_id, other_id, e);
            }
        }

        let Some(peer) = self.peers.get_mut(player_id) else {
            return;
        };
        for net_id in existing {
            let spawn = Rpc::Spawn {
                net_id,
                valid_from_frame: frame,
            };
            if let Err(e) = peer
                .replication
                .replicate(spawn.payload(), ReplicationFlags::RESEND_UNTIL_REPLICATED)
            {
                log::warn!("cannot announce ship {} to player {}: {}", net_id, player_id, e);
            }
        }
        self.events.push_back(HostEvent::PlayerJoined {
            player_id,
            ship_id,
            addr: peer.connection.addr,
        });
    }

    fn handle_replication_events(&mut self) {
        let replay_from = self.frame_index + self.config.target_frame_lead;
        for player_id in self.peers.ids() {
            let Some(peer) = self.peers.get_mut(player_id) else {
                continue;
            };
            let events: Vec<ReplicationEvent> = peer.replication.drain_events().collect();
            for event in events {
                let handle = match event {
                    ReplicationEvent::Confirmed(handle) => {
                        if peer.sync_handle == Some(handle) && peer.sync_delta < 0 {
                            // The client replays these frames with fresh inputs.
                            let stale = peer.game.discard_inputs_from(replay_from);
                            log::debug!(
                                "dropped {} inputs of player {} from before the frame shift",
                                stale,
                                player_id
                            );
                        }
                        self.events
                            .push_back(HostEvent::Replicated { player_id, handle });
                        handle
                    }
                    ReplicationEvent::Abandoned(handle) => {
                        self.events
                            .push_back(HostEvent::ReplicationAbandoned { player_id, handle });
                        handle
                    }
                };
                if peer.sync_handle == Some(handle) {
                    peer.sync_handle = None;
                    // Pings sent before the shift landed report stale frames.
                    peer.first_ping_after_sync = peer.connection.next_ping_id();
                }
            }
        }
    }

    /// Keeps every client `target_frame_lead` frames ahead of the host so
    /// its inputs arrive before they are needed.
    fn sync_frames(&mut self) {
        let target = self.frame_index as i64 + self.config.target_frame_lead as i64;
        let tolerance = self.config.frame_sync_tolerance as i64;

        for peer in self.peers.iter_mut() {
            let Some(report) = peer.connection.take_frame_report() else {
                continue;
            };
            if peer.sync_pending() || report.ping_id < peer.first_ping_after_sync {
                continue;
            }

            let delta = target - report.client_frame as i64;
            if delta.abs() <= tolerance {
                continue;
            }
            let delta = delta.clamp(i32::MIN as i64, i32::MAX as i64) as i32;
            log::debug!(
                "player {} is at frame {} (rtt {:.0} ms), shifting by {}",
                peer.connection.player_id,
                report.client_frame,
                report.rtt_ms,
                delta
            );
            match peer.replication.replicate(
                Rpc::Sync { delta }.payload(),
                ReplicationFlags::RESEND_UNTIL_REPLICATED,
            ) {
                Ok(handle) => {
                    peer.sync_handle = Some(handle);
                    peer.sync_delta = delta;
                }
                Err(e) => log::warn!("cannot queue frame sync: {}", e),
            }
        }
    }
}
