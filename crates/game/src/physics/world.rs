use glam::{Quat, Vec3};
use rapier3d::prelude::*;

use super::ShipMovement;

/// Zero-gravity rapier world holding ship bodies.
pub struct PhysicsWorld {
    pipeline: PhysicsPipeline,
    integration_parameters: IntegrationParameters,
    islands: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    gravity: Vector,
}

impl PhysicsWorld {
    pub fn new(dt: f32) -> Self {
        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = dt;
        integration_parameters.min_ccd_dt = dt / 100.0;

        Self {
            pipeline: PhysicsPipeline::new(),
            integration_parameters,
            islands: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            gravity: Vector::new(0.0, 0.0, 0.0),
        }
    }

    pub fn dt(&self) -> f32 {
        self.integration_parameters.dt
    }

    pub fn step(&mut self) {
        self.pipeline.step(
            self.gravity,
            &self.integration_parameters,
            &mut self.islands,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &(),
        );
    }

    /// Dynamic body that only translates in XZ and only yaws.
    pub fn add_ship(
        &mut self,
        position: Vec3,
        orientation: Quat,
        movement: &ShipMovement,
    ) -> RigidBodyHandle {
        let body = RigidBodyBuilder::dynamic()
            .translation(to_vector(position))
            .enabled_translations(true, false, true)
            .enabled_rotations(false, true, false)
            .linear_damping(movement.linear_damping)
            .angular_damping(movement.angular_damping)
            .can_sleep(false)
            .build();

        let handle = self.bodies.insert(body);

        let collider = ColliderBuilder::ball(movement.radius)
            .mass(movement.mass)
            .friction(0.0)
            .restitution(0.5)
            .build();

        self.colliders
            .insert_with_parent(collider, handle, &mut self.bodies);
        self.set_body_pose(handle, position, orientation);

        handle
    }

    pub fn remove_body(&mut self, handle: RigidBodyHandle) {
        self.bodies.remove(
            handle,
            &mut self.islands,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            true,
        );
    }

    pub fn body_count(&self) -> usize {
        self.bodies.len()
    }

    pub fn set_body_pose(&mut self, handle: RigidBodyHandle, position: Vec3, rotation: Quat) {
        if let Some(body) = self.bodies.get_mut(handle) {
            let pose = Pose::from_parts(to_vector(position), to_rotation(rotation));
            body.set_position(pose, true);
        }
    }

    pub fn set_body_velocity(&mut self, handle: RigidBodyHandle, linear: Vec3, angular: Vec3) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.set_linvel(to_vector(linear), true);
            body.set_angvel(to_vector(angular), true);
        }
    }

    pub fn clear_forces(&mut self, handle: RigidBodyHandle) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.reset_forces(true);
            body.reset_torques(true);
        }
    }

    /// Replaces the persistent user force and torque on a body.
    pub fn set_forces(&mut self, handle: RigidBodyHandle, force: Vec3, torque: Vec3) {
        if let Some(body) = self.bodies.get_mut(handle) {
            body.reset_forces(true);
            body.reset_torques(true);
            body.add_force(to_vector(force), true);
            body.add_torque(to_vector(torque), true);
        }
    }

    pub fn body_pose(&self, handle: RigidBodyHandle) -> Option<(Vec3, Quat)> {
        self.bodies.get(handle).map(|b| {
            let t = b.translation();
            let r = b.rotation();
            (
                Vec3::new(t.x, t.y, t.z),
                Quat::from_xyzw(r.x, r.y, r.z, r.w),
            )
        })
    }

    pub fn body_velocity(&self, handle: RigidBodyHandle) -> Option<(Vec3, Vec3)> {
        self.bodies.get(handle).map(|b| {
            let v = b.linvel();
            let w = b.angvel();
            (Vec3::new(v.x, v.y, v.z), Vec3::new(w.x, w.y, w.z))
        })
    }
}

fn to_vector(v: Vec3) -> Vector {
    Vector::new(v.x, v.y, v.z)
}

fn to_rotation(q: Quat) -> Rotation {
    Rotation::from_xyzw(q.x, q.y, q.z, q.w).normalize()
}
