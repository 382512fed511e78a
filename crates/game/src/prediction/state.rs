use std::f32::consts::{PI, TAU};

use glam::{EulerRot, Quat, Vec3};
use rkyv::{Archive, Deserialize, Serialize};

/// Authoritative ship state on the wire. Only ground-plane channels travel;
/// height, pitch and roll are implied to be zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerStateSnapshot {
    pub frame_index: u32,
    pub position_x: f32,
    pub position_z: f32,
    pub orientation_y: f32,
    pub velocity_x: f32,
    pub velocity_z: f32,
    pub angular_velocity_y: f32,
}

/// Ship state at the start of `frame_index`, before that frame's input.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ShipState {
    pub frame_index: u32,
    pub position: Vec3,
    pub orientation: Quat,
    pub velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Default for ShipState {
    fn default() -> Self {
        Self::at_rest(0, Vec3::ZERO, 0.0)
    }
}

impl ShipState {
    pub fn at_rest(frame_index: u32, position: Vec3, yaw: f32) -> Self {
        Self {
            frame_index,
            position,
            orientation: Quat::from_rotation_y(yaw),
            velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
        }
    }

    /// Starting state of a freshly spawned ship. Host and client derive it
    /// from the ship id alone so they agree without a round trip.
    pub fn spawn(ship_id: u32, frame_index: u32) -> Self {
        const SPAWN_RING_RADIUS: f32 = 12.0;
        const SPAWN_SLOTS: u32 = 16;

        let angle = (ship_id % SPAWN_SLOTS) as f32 / SPAWN_SLOTS as f32 * TAU;
        let position = Vec3::new(angle.cos(), 0.0, angle.sin()) * SPAWN_RING_RADIUS;
        // Face the center of the ring.
        let yaw = (-position.x).atan2(-position.z);
        Self::at_rest(frame_index, position, yaw)
    }

    pub fn yaw(&self) -> f32 {
        self.orientation.to_euler(EulerRot::YXZ).0
    }

    pub fn to_snapshot(&self) -> PlayerStateSnapshot {
        PlayerStateSnapshot {
            frame_index: self.frame_index,
            position_x: self.position.x,
            position_z: self.position.z,
            orientation_y: self.yaw(),
            velocity_x: self.velocity.x,
            velocity_z: self.velocity.z,
            angular_velocity_y: self.angular_velocity.y,
        }
    }

    pub fn from_snapshot(snapshot: &PlayerStateSnapshot) -> Self {
        Self {
            frame_index: snapshot.frame_index,
            position: Vec3::new(snapshot.position_x, 0.0, snapshot.position_z),
            orientation: Quat::from_rotation_y(snapshot.orientation_y),
            velocity: Vec3::new(snapshot.velocity_x, 0.0, snapshot.velocity_z),
            angular_velocity: Vec3::new(0.0, snapshot.angular_velocity_y, 0.0),
        }
    }

    /// Compares the replicated channels; everything else is ignored.
    pub fn matches(&self, snapshot: &PlayerStateSnapshot, tolerance: f32) -> bool {
        let local = self.to_snapshot();
        let close = |a: f32, b: f32| (a - b).abs() <= tolerance;

        close(local.position_x, snapshot.position_x)
            && close(local.position_z, snapshot.position_z)
            && angle_between(local.orientation_y, snapshot.orientation_y) <= tolerance
            && close(local.velocity_x, snapshot.velocity_x)
            && close(local.velocity_z, snapshot.velocity_z)
            && close(local.angular_velocity_y, snapshot.angular_velocity_y)
    }
}

fn angle_between(a: f32, b: f32) -> f32 {
    let diff = (a - b).rem_euclid(TAU);
    if diff > PI { TAU - diff } else { diff }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn moving() -> ShipState {
        ShipState {
            frame_index: 14,
            position: Vec3::new(3.0, 0.0, -2.0),
            orientation: Quat::from_rotation_y(1.2),
            velocity: Vec3::new(0.5, 0.0, 4.0),
            angular_velocity: Vec3::new(0.0, -0.3, 0.0),
        }
    }

    #[test]
    fn snapshot_keeps_planar_channels() {
        let state = moving();
        let restored = ShipState::from_snapshot(&state.to_snapshot());

        assert_eq!(restored.frame_index, 14);
        assert!(restored.position.abs_diff_eq(state.position, 1e-5));
        assert!(restored.velocity.abs_diff_eq(state.velocity, 1e-5));
        assert!((restored.yaw() - 1.2).abs() < 1e-5);
    }

    #[test]
    fn vertical_motion_is_not_compared() {
        let mut state = moving();
        let snapshot = state.to_snapshot();
        state.position.y = 12.0;
        state.velocity.y = -3.0;

        assert!(state.matches(&snapshot, 1e-4));
    }

    #[test]
    fn planar_drift_is_detected() {
        let state = moving();
        let mut snapshot = state.to_snapshot();
        snapshot.position_z += 0.01;

        assert!(!state.matches(&snapshot, 1e-3));
        assert!(state.matches(&snapshot, 0.1));
    }

    #[test]
    fn yaw_wraps_around() {
        let state = ShipState::at_rest(0, Vec3::ZERO, PI - 0.0001);
        let mut snapshot = state.to_snapshot();
        snapshot.orientation_y = -PI + 0.0001;

        assert!(state.matches(&snapshot, 1e-3));
    }

    #[test]
    fn spawn_faces_the_ring_center() {
        let state = ShipState::spawn(4, 30);
        assert_eq!(state.frame_index, 30);
        assert!((state.position.length() - 12.0).abs() < 1e-4);

        let forward = state.orientation * Vec3::Z;
        let to_center = (-state.position).normalize();
        assert!(forward.abs_diff_eq(to_center, 1e-4));
        assert_eq!(ShipState::spawn(4, 30), state);
        assert_ne!(ShipState::spawn(5, 30).position, state.position);
    }
}
