use clap::ValueEnum;
use drift::ShipInput;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputState {
    pub thrust: bool,
    pub reverse: bool,
    pub turn_left: bool,
    pub turn_right: bool,
    pub boost: bool,
}

impl InputState {
    pub fn to_ship_input(&self) -> ShipInput {
        let mut input = ShipInput::empty();
        input.set(ShipInput::THRUST, self.thrust);
        input.set(ShipInput::REVERSE, self.reverse);
        input.set(ShipInput::TURN_LEFT, self.turn_left);
        input.set(ShipInput::TURN_RIGHT, self.turn_right);
        input.set(ShipInput::BOOST, self.boost);
        input
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PilotPattern {
    Idle,
    Circle,
    Zigzag,
    Random,
}

/// Headless stand-in for a player: produces one input per frame.
#[derive(Debug, Clone)]
pub struct Pilot {
    pattern: PilotPattern,
    seed: u64,
    held: InputState,
}

impl Pilot {
    /// Frames a random pick is held before the next one.
    const RANDOM_HOLD: u32 = 30;
    const ZIGZAG_PERIOD: u32 = 90;

    pub fn new(pattern: PilotPattern, seed: u64) -> Self {
        Self {
            pattern,
            seed: seed.max(1),
            held: InputState::default(),
        }
    }

    pub fn input(&mut self, frame: u32) -> InputState {
        match self.pattern {
            PilotPattern::Idle => InputState::default(),
            PilotPattern::Circle => InputState {
                thrust: true,
                turn_left: true,
                ..Default::default()
            },
            PilotPattern::Zigzag => {
                let left = (frame / Self::ZIGZAG_PERIOD) % 2 == 0;
                InputState {
                    thrust: true,
                    turn_left: left,
                    turn_right: !left,
                    ..Default::default()
                }
            }
            PilotPattern::Random => {
                if frame % Self::RANDOM_HOLD == 0 {
                    let bits = self.next_random();
                    self.held = InputState {
                        thrust: bits & 1 != 0,
                        reverse: bits & 2 != 0 && bits & 1 == 0,
                        turn_left: bits & 4 != 0,
                        turn_right: bits & 8 != 0 && bits & 4 == 0,
                        boost: bits & 16 != 0,
                    };
                }
                self.held
            }
        }
    }

    // xorshift64
    fn next_random(&mut self) -> u64 {
        let mut x = self.seed;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.seed = x;
        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_state_maps_to_ship_input() {
        let input = InputState {
            thrust: true,
            turn_right: true,
            ..Default::default()
        };

        let ship_input = input.to_ship_input();

        assert!(ship_input.contains(ShipInput::THRUST | ShipInput::TURN_RIGHT));
        assert!(!ship_input.contains(ShipInput::BOOST));
        assert_eq!(InputState::default().to_ship_input(), ShipInput::empty());
    }

    #[test]
    fn zigzag_alternates() {
        let mut pilot = Pilot::new(PilotPattern::Zigzag, 1);

        assert!(pilot.input(0).turn_left);
        assert!(pilot.input(Pilot::ZIGZAG_PERIOD).turn_right);
    }

    #[test]
    fn random_pilot_holds_and_repeats() {
        let mut a = Pilot::new(PilotPattern::Random, 42);
        let mut b = Pilot::new(PilotPattern::Random, 42);

        let first = a.input(0);
        assert_eq!(a.input(1), first);
        assert_eq!(b.input(0), first);

        for frame in 0..300 {
            let input = a.input(frame);
            assert!(!(input.turn_left && input.turn_right));
            assert!(!(input.thrust && input.reverse));
        }
    }
}
