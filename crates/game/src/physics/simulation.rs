use std::collections::BTreeMap;

use rapier3d::prelude::RigidBodyHandle;

use crate::prediction::{ShipInput, ShipState};

use super::{PhysicsSync, PhysicsWorld, ShipMovement, ShipTransform};

/// Movement and physics step used by prediction and by the host.
///
/// Resimulation assumes `step` is deterministic: the same starting states
/// and inputs must produce the same results on host and client.
pub trait ShipSimulation {
    fn spawn_ship(&mut self, ship_id: u32, state: &ShipState);

    fn remove_ship(&mut self, ship_id: u32) -> bool;

    /// Removes and re-adds the body, clears its forces and overwrites its
    /// state with `state`.
    fn reset_ship(&mut self, ship_id: u32, state: &ShipState);

    fn apply_input(&mut self, ship_id: u32, input: ShipInput);

    fn step(&mut self);

    fn sync_transforms(&mut self);

    fn ship_state(&self, ship_id: u32, frame_index: u32) -> Option<ShipState>;

    fn has_ship(&self, ship_id: u32) -> bool;
}

struct ShipBody {
    handle: RigidBodyHandle,
    transform: ShipTransform,
}

/// [`ShipSimulation`] over a rapier world of planar ships.
pub struct PhysicsShipSimulation {
    world: PhysicsWorld,
    movement: ShipMovement,
    ships: BTreeMap<u32, ShipBody>,
}

impl PhysicsShipSimulation {
    pub fn new(dt: f32, movement: ShipMovement) -> Self {
        Self {
            world: PhysicsWorld::new(dt),
            movement,
            ships: BTreeMap::new(),
        }
    }

    pub fn movement(&self) -> &ShipMovement {
        &self.movement
    }

    pub fn transform(&self, ship_id: u32) -> Option<&ShipTransform> {
        self.ships.get(&ship_id).map(|ship| &ship.transform)
    }

    pub fn ship_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.ships.keys().copied()
    }

    pub fn body_count(&self) -> usize {
        self.world.body_count()
    }

    fn insert_body(&mut self, ship_id: u32, state: &ShipState) {
        let handle = self
            .world
            .add_ship(state.position, state.orientation, &self.movement);
        let transform = ShipTransform::new(state.position, state.orientation);

        self.world.clear_forces(handle);
        self.world
            .set_body_velocity(handle, state.velocity, state.angular_velocity);
        PhysicsSync::transform_to_physics(&transform, handle, &mut self.world);

        self.ships.insert(ship_id, ShipBody { handle, transform });
    }
}

impl ShipSimulation for PhysicsShipSimulation {
    fn spawn_ship(&mut self, ship_id: u32, state: &ShipState) {
        if self.ships.contains_key(&ship_id) {
            self.reset_ship(ship_id, state);
            return;
        }
        log::debug!("spawning ship {} at {}", ship_id, state.position);
        self.insert_body(ship_id, state);
    }

    fn remove_ship(&mut self, ship_id: u32) -> bool {
        let Some(ship) = self.ships.remove(&ship_id) else {
            return false;
        };
        self.world.remove_body(ship.handle);
        true
    }

    fn reset_ship(&mut self, ship_id: u32, state: &ShipState) {
        self.remove_ship(ship_id);
        self.insert_body(ship_id, state);
    }

    fn apply_input(&mut self, ship_id: u32, input: ShipInput) {
        let Some(ship) = self.ships.get(&ship_id) else {
            return;
        };
        let Some((_, orientation)) = self.world.body_pose(ship.handle) else {
            return;
        };
        let (force, torque) = self.movement.forces(input, orientation);
        self.world.set_forces(ship.handle, force, torque);
    }

    fn step(&mut self) {
        self.world.step();
    }

    fn sync_transforms(&mut self) {
        for ship in self.ships.values_mut() {
            PhysicsSync::physics_to_transform(&mut ship.transform, ship.handle, &self.world);
        }
    }

    fn ship_state(&self, ship_id: u32, frame_index: u32) -> Option<ShipState> {
        let ship = self.ships.get(&ship_id)?;
        let (position, orientation) = self.world.body_pose(ship.handle)?;
        let (velocity, angular_velocity) = self.world.body_velocity(ship.handle)?;
        Some(ShipState {
            frame_index,
            position,
            orientation,
            velocity,
            angular_velocity,
        })
    }

    fn has_ship(&self, ship_id: u32) -> bool {
        self.ships.contains_key(&ship_id)
    }
}
