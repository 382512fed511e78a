use std::collections::BTreeMap;

use crate::net::{OutgoingPacket, Payload};
use crate::physics::ShipSimulation;

use super::input::{FrameInput, ShipInput};
use super::state::PlayerStateSnapshot;

/// Host-side mirror of one player's ship: buffers the inputs the client
/// streams ahead of time and publishes authoritative snapshots.
#[derive(Debug)]
pub struct HostGameData {
    ship_id: u32,
    inputs: BTreeMap<u32, ShipInput>,
    last_input: ShipInput,
    snapshot_interval: u32,
    pending_snapshot: Option<PlayerStateSnapshot>,
    late_inputs: u64,
    missing_inputs: u64,
}

impl HostGameData {
    pub fn new(ship_id: u32, snapshot_interval: u32) -> Self {
        Self {
            ship_id,
            inputs: BTreeMap::new(),
            last_input: ShipInput::empty(),
            snapshot_interval: snapshot_interval.max(1),
            pending_snapshot: None,
            late_inputs: 0,
            missing_inputs: 0,
        }
    }

    pub fn ship_id(&self) -> u32 {
        self.ship_id
    }

    pub fn buffered_frames(&self) -> impl Iterator<Item = u32> + '_ {
        self.inputs.keys().copied()
    }

    pub fn late_inputs(&self) -> u64 {
        self.late_inputs
    }

    pub fn missing_inputs(&self) -> u64 {
        self.missing_inputs
    }

    /// Buffers redundant inputs. Frames the host already simulated are
    /// dropped; repeats of a buffered frame are ignored.
    pub fn process_inputs(&mut self, inputs: &[FrameInput], host_frame: u32) {
        for input in inputs {
            if input.frame_index < host_frame {
                self.late_inputs += 1;
                continue;
            }
            self.inputs
                .entry(input.frame_index)
                .or_insert_with(|| input.input());
        }
    }

    /// Forgets buffered inputs for `frame` and later, returning how many.
    pub fn discard_inputs_from(&mut self, frame: u32) -> usize {
        self.inputs.split_off(&frame).len()
    }

    /// Applies the input for `frame`, repeating the previous one if the
    /// client's input never arrived.
    pub fn apply_input(&mut self, frame: u32, sim: &mut impl ShipSimulation) {
        let input = match self.inputs.remove(&frame) {
            Some(input) => input,
            None => {
                self.missing_inputs += 1;
                log::trace!("no input from ship {} for frame {}", self.ship_id, frame);
                self.last_input
            }
        };
        self.inputs = self.inputs.split_off(&frame);
        self.last_input = input;
        sim.apply_input(self.ship_id, input);
    }

    /// Captures the start-of-frame state every `snapshot_interval` frames.
    pub fn save_state(&mut self, frame: u32, sim: &impl ShipSimulation) {
        if frame % self.snapshot_interval != 0 {
            return;
        }
        if let Some(state) = sim.ship_state(self.ship_id, frame) {
            self.pending_snapshot = Some(state.to_snapshot());
        }
    }

    /// Sends the latest snapshot once; a lost snapshot is superseded by the
    /// next one.
    pub fn write(&mut self, packet: &mut OutgoingPacket) {
        if let Some(snapshot) = self.pending_snapshot.take() {
            packet.push(Payload::PlayerState(snapshot));
        }
    }
}
