mod movement;
mod simulation;
mod sync;
mod world;

pub use movement::ShipMovement;
pub use simulation::{PhysicsShipSimulation, ShipSimulation};
pub use sync::{PhysicsSync, ShipTransform};
pub use world::PhysicsWorld;
