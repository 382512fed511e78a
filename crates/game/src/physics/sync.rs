use glam::{Quat, Vec3};
use rapier3d::prelude::RigidBodyHandle;

use super::PhysicsWorld;

/// Game-side pose of a ship, mirrored from its rigid body after each step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShipTransform {
    pub position: Vec3,
    pub orientation: Quat,
    pub dirty: bool,
}

impl ShipTransform {
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
            dirty: true,
        }
    }
}

pub struct PhysicsSync;

impl PhysicsSync {
    pub fn transform_to_physics(
        transform: &ShipTransform,
        handle: RigidBodyHandle,
        physics: &mut PhysicsWorld,
    ) {
        physics.set_body_pose(handle, transform.position, transform.orientation);
    }

    pub fn physics_to_transform(
        transform: &mut ShipTransform,
        handle: RigidBodyHandle,
        physics: &PhysicsWorld,
    ) {
        let Some((position, orientation)) = physics.body_pose(handle) else {
            return;
        };

        if transform.position != position || transform.orientation != orientation {
            transform.position = position;
            transform.orientation = orientation;
            transform.dirty = true;
        }
    }
}
