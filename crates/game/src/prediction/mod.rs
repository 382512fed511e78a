mod client;
mod host;
mod input;
mod state;

pub use client::ClientGameData;
pub use host::HostGameData;
pub use input::{FrameInput, ShipInput};
pub use state::{PlayerStateSnapshot, ShipState};
