use std::collections::{BTreeMap, VecDeque};

use crate::config::NetConfig;
use crate::net::{OutgoingPacket, PacketListener, Payload};
use crate::physics::ShipSimulation;
use crate::replication::RpcContext;

use super::input::{FrameInput, ShipInput};
use super::state::{PlayerStateSnapshot, ShipState};

/// Upper bound on every per-frame buffer, about four seconds at 60 Hz.
const MAX_BUFFERED_FRAMES: usize = 256;

/// Client-side prediction of the local ship.
///
/// Frame `k` states are taken before input `k` is applied. Inputs are kept
/// twice: `unacked_inputs` feeds the redundant send stream and shrinks on
/// acknowledgment, `input_history` feeds resimulation and shrinks when an
/// authoritative snapshot supersedes it.
#[derive(Debug)]
pub struct ClientGameData {
    ship_id: Option<u32>,
    frame_index: u32,
    unacked_inputs: VecDeque<FrameInput>,
    input_history: VecDeque<FrameInput>,
    previous_states: VecDeque<ShipState>,
    last_server_state: Option<ShipState>,
    synced: bool,
    max_input_sent: usize,
    desync_tolerance: f32,
    remote_ships: BTreeMap<u32, u32>,
    rollbacks: u64,
    desyncs: u64,
}

impl ClientGameData {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            ship_id: None,
            frame_index: 0,
            unacked_inputs: VecDeque::new(),
            input_history: VecDeque::new(),
            previous_states: VecDeque::new(),
            last_server_state: None,
            synced: true,
            max_input_sent: config.max_input_sent.max(1),
            desync_tolerance: config.desync_tolerance,
            remote_ships: BTreeMap::new(),
            rollbacks: 0,
            desyncs: 0,
        }
    }

    pub fn ship_id(&self) -> Option<u32> {
        self.ship_id
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks
    }

    pub fn desyncs(&self) -> u64 {
        self.desyncs
    }

    pub fn last_server_state(&self) -> Option<&ShipState> {
        self.last_server_state.as_ref()
    }

    pub fn previous_states(&self) -> impl Iterator<Item = &ShipState> {
        self.previous_states.iter()
    }

    pub fn unacked_inputs(&self) -> impl Iterator<Item = &FrameInput> {
        self.unacked_inputs.iter()
    }

    pub fn input_history(&self) -> impl Iterator<Item = &FrameInput> {
        self.input_history.iter()
    }

    pub fn latest_state(&self) -> Option<&ShipState> {
        self.previous_states.back()
    }

    /// Takes control of `ship_id`, spawning it in `sim` at `state`.
    pub fn spawn_own_ship(&mut self, ship_id: u32, state: &ShipState, sim: &mut impl ShipSimulation) {
        self.ship_id = Some(ship_id);
        sim.spawn_ship(ship_id, state);
        self.previous_states.clear();
        self.previous_states.push_back(ShipState {
            frame_index: self.frame_index,
            ..*state
        });
    }

    /// Forgets the controlled ship and every buffer.
    pub fn reset(&mut self) {
        self.ship_id = None;
        self.clear_buffers();
        self.remote_ships.clear();
        self.synced = true;
    }

    /// Runs one predicted frame with `input` and returns the resulting state.
    pub fn tick(&mut self, input: ShipInput, sim: &mut impl ShipSimulation) -> Option<ShipState> {
        let ship_id = self.ship_id?;

        let frame_input = FrameInput::new(self.frame_index, input);
        push_bounded(&mut self.unacked_inputs, frame_input);
        push_bounded(&mut self.input_history, frame_input);

        self.rollback_resimulate(sim);

        if self.previous_states.back().map(|s| s.frame_index) != Some(self.frame_index) {
            if let Some(state) = sim.ship_state(ship_id, self.frame_index) {
                push_bounded(&mut self.previous_states, state);
            }
        }

        self.advance(ship_id, input, sim)
    }

    /// Appends the most recent unacknowledged inputs to `packet`.
    pub fn write(&mut self, packet: &mut OutgoingPacket) {
        let start = self
            .unacked_inputs
            .len()
            .saturating_sub(self.max_input_sent);
        let inputs: Vec<FrameInput> = self.unacked_inputs.range(start..).copied().collect();
        let Some(last) = inputs.last() else {
            return;
        };

        let last_frame = last.frame_index;
        packet.push(Payload::PlayerInputs(inputs));
        packet.listen(PacketListener::Inputs { last_frame });
    }

    pub fn on_inputs_delivered(&mut self, last_frame: u32) {
        // An acknowledgment from before a frame shift cannot cover frames
        // that have not been played yet.
        if last_frame >= self.frame_index {
            return;
        }
        while self
            .unacked_inputs
            .front()
            .is_some_and(|input| input.frame_index <= last_frame)
        {
            self.unacked_inputs.pop_front();
        }
    }

    pub fn process_snapshot(&mut self, snapshot: &PlayerStateSnapshot) {
        let frame = snapshot.frame_index;
        if self
            .last_server_state
            .is_some_and(|last| last.frame_index >= frame)
        {
            log::trace!("ignoring outdated snapshot for frame {}", frame);
            return;
        }

        while self
            .previous_states
            .front()
            .is_some_and(|s| s.frame_index < frame)
        {
            self.previous_states.pop_front();
        }
        while self
            .input_history
            .front()
            .is_some_and(|i| i.frame_index < frame)
        {
            self.input_history.pop_front();
        }

        if let Some(predicted) = self
            .previous_states
            .front()
            .filter(|s| s.frame_index == frame)
        {
            if !predicted.matches(snapshot, self.desync_tolerance) {
                let server = ShipState::from_snapshot(snapshot);
                log::warn!(
                    "desync at frame {}: predicted {} but server has {}",
                    frame,
                    predicted.position,
                    server.position
                );
                self.desyncs += 1;
                self.synced = false;
            }
        }

        self.last_server_state = Some(ShipState::from_snapshot(snapshot));
    }

    /// Replays buffered inputs on top of the last authoritative state.
    /// Returns true when a resimulation ran.
    pub fn rollback_resimulate(&mut self, sim: &mut impl ShipSimulation) -> bool {
        if self.synced || self.previous_states.is_empty() {
            return false;
        }
        let (Some(ship_id), Some(server_state)) = (self.ship_id, self.last_server_state) else {
            return false;
        };
        let Some(most_recent) = self.input_history.back().copied() else {
            return false;
        };
        let Some(oldest_index) = self
            .input_history
            .iter()
            .position(|i| i.frame_index == server_state.frame_index)
        else {
            return false;
        };

        let buffered = (self.input_history.len() - oldest_index) as u32;
        if server_state.frame_index + buffered - 1 != most_recent.frame_index {
            log::trace!(
                "input history {}..={} not contiguous, rollback deferred",
                server_state.frame_index,
                most_recent.frame_index
            );
            return false;
        }

        log::debug!(
            "rolling back ship {} from frame {} to {}",
            ship_id,
            self.frame_index,
            server_state.frame_index
        );

        self.frame_index = server_state.frame_index;
        sim.reset_ship(ship_id, &server_state);
        self.previous_states.clear();
        self.previous_states.push_back(server_state);

        let replay: Vec<FrameInput> = self
            .input_history
            .range(oldest_index..self.input_history.len() - 1)
            .copied()
            .collect();
        for input in replay {
            if self.advance(ship_id, input.input(), sim).is_none() {
                break;
            }
        }

        debug_assert_eq!(self.frame_index, most_recent.frame_index);
        self.rollbacks += 1;
        self.synced = true;
        true
    }

    /// Applies a frame offset pushed by the host.
    pub fn shift_frame_index(&mut self, delta: i32) {
        let shifted = (self.frame_index as i64 + delta as i64).max(0) as u32;
        log::info!(
            "frame index shifted by {} ({} -> {})",
            delta,
            self.frame_index,
            shifted
        );
        self.frame_index = shifted;
        self.clear_buffers();
        self.synced = true;
    }

    pub fn spawn_notice(&mut self, net_id: u32, valid_from_frame: u32) {
        log::debug!("ship {} valid from frame {}", net_id, valid_from_frame);
        self.remote_ships.insert(net_id, valid_from_frame);
    }

    /// Remote ships whose spawn frame has been reached.
    pub fn visible_ships(&self) -> impl Iterator<Item = u32> + '_ {
        self.remote_ships
            .iter()
            .filter(|&(_, &frame)| frame <= self.frame_index)
            .map(|(&net_id, _)| net_id)
    }

    fn advance(
        &mut self,
        ship_id: u32,
        input: ShipInput,
        sim: &mut impl ShipSimulation,
    ) -> Option<ShipState> {
        sim.apply_input(ship_id, input);
        sim.step();
        sim.sync_transforms();
        self.frame_index += 1;

        let state = sim.ship_state(ship_id, self.frame_index)?;
        push_bounded(&mut self.previous_states, state);
        Some(state)
    }

    fn clear_buffers(&mut self) {
        self.unacked_inputs.clear();
        self.input_history.clear();
        self.previous_states.clear();
        self.last_server_state = None;
    }
}

impl RpcContext for ClientGameData {
    fn shift_frame_index(&mut self, delta: i32) {
        ClientGameData::shift_frame_index(self, delta);
    }

    fn spawn_notice(&mut self, net_id: u32, valid_from_frame: u32) {
        ClientGameData::spawn_notice(self, net_id, valid_from_frame);
    }
}

fn push_bounded<T>(buffer: &mut VecDeque<T>, value: T) {
    if buffer.len() == MAX_BUFFERED_FRAMES {
        buffer.pop_front();
    }
    buffer.push_back(value);
}
