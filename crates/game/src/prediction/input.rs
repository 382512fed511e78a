use bitflags::bitflags;
use rkyv::{Archive, Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ShipInput: u8 {
        const THRUST = 1 << 0;
        const REVERSE = 1 << 1;
        const TURN_LEFT = 1 << 2;
        const TURN_RIGHT = 1 << 3;
        const BOOST = 1 << 4;
    }
}

impl ShipInput {
    /// -1, 0 or 1 along the ship's forward axis.
    pub fn throttle(self) -> f32 {
        axis(self.contains(Self::THRUST), self.contains(Self::REVERSE))
    }

    /// Positive turns left (counter-clockwise seen from above).
    pub fn steering(self) -> f32 {
        axis(self.contains(Self::TURN_LEFT), self.contains(Self::TURN_RIGHT))
    }
}

fn axis(positive: bool, negative: bool) -> f32 {
    match (positive, negative) {
        (true, false) => 1.0,
        (false, true) => -1.0,
        _ => 0.0,
    }
}

/// Input of one simulation frame as sent to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct FrameInput {
    pub frame_index: u32,
    pub buttons: u8,
}

impl FrameInput {
    pub fn new(frame_index: u32, input: ShipInput) -> Self {
        Self {
            frame_index,
            buttons: input.bits(),
        }
    }

    pub fn input(&self) -> ShipInput {
        ShipInput::from_bits_truncate(self.buttons)
    }
}
