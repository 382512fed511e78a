use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::prediction::ShipInput;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipMovement {
    pub thrust_force: f32,
    pub reverse_force: f32,
    pub boost_multiplier: f32,
    pub turn_torque: f32,
    pub linear_damping: f32,
    pub angular_damping: f32,
    pub mass: f32,
    pub radius: f32,
}

impl Default for ShipMovement {
    fn default() -> Self {
        Self {
            thrust_force: 40.0,
            reverse_force: 20.0,
            boost_multiplier: 1.8,
            turn_torque: 6.0,
            linear_damping: 0.6,
            angular_damping: 4.0,
            mass: 2.0,
            radius: 0.8,
        }
    }
}

impl ShipMovement {
    /// Force and torque one frame of `input` applies to a ship facing
    /// `orientation`. Ships face +Z at zero yaw.
    pub fn forces(&self, input: ShipInput, orientation: Quat) -> (Vec3, Vec3) {
        let throttle = input.throttle();
        let mut magnitude = if throttle >= 0.0 {
            throttle * self.thrust_force
        } else {
            throttle * self.reverse_force
        };
        if input.contains(ShipInput::BOOST) && throttle > 0.0 {
            magnitude *= self.boost_multiplier;
        }

        let mut forward = orientation * Vec3::Z;
        forward.y = 0.0;
        let force = forward.normalize_or_zero() * magnitude;
        let torque = Vec3::Y * (input.steering() * self.turn_torque);

        (force, torque)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_input_applies_nothing() {
        let (force, torque) = ShipMovement::default().forces(ShipInput::empty(), Quat::IDENTITY);
        assert_eq!(force, Vec3::ZERO);
        assert_eq!(torque, Vec3::ZERO);
    }

    #[test]
    fn thrust_follows_heading() {
        let movement = ShipMovement::default();
        let heading = Quat::from_rotation_y(std::f32::consts::FRAC_PI_2);

        let (force, _) = movement.forces(ShipInput::THRUST, heading);

        assert!(force.abs_diff_eq(Vec3::X * movement.thrust_force, 1e-4));
    }

    #[test]
    fn boost_only_scales_forward_thrust() {
        let movement = ShipMovement::default();

        let (boosted, _) = movement.forces(ShipInput::THRUST | ShipInput::BOOST, Quat::IDENTITY);
        let (reverse, _) = movement.forces(ShipInput::REVERSE | ShipInput::BOOST, Quat::IDENTITY);

        assert!((boosted.z - movement.thrust_force * movement.boost_multiplier).abs() < 1e-4);
        assert!((reverse.z + movement.reverse_force).abs() < 1e-4);
    }

    #[test]
    fn turning_left_is_positive_yaw_torque() {
        let (_, torque) = ShipMovement::default().forces(ShipInput::TURN_LEFT, Quat::IDENTITY);
        assert!(torque.y > 0.0);
    }
}
