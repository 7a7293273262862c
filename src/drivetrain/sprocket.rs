use serde::{Deserialize, Serialize};

use crate::chain::ChainState;
use crate::error::StageFault;
use crate::stage::{require_finite, sealed, Shaft, Stage, StageContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ShaftState {
    pub torque_in: f64,
    pub torque_out: f64,
    pub speed_in: f64,
    pub speed_out: f64,
}

/// Converts chain tension into shaft torque at the drive sprocket.
#[derive(Debug, Clone, Default)]
pub struct Sprocket {
    state: ShaftState,
}

impl Sprocket {
    pub fn new() -> Self {
        Self::default()
    }
}

impl sealed::Sealed for Sprocket {}

impl Stage for Sprocket {
    type Input = ChainState;
    type Output = Shaft;
    type State = ShaftState;

    fn name(&self) -> &'static str {
        "sprocket"
    }

    fn process(&mut self, chain: ChainState, ctx: &StageContext<'_>) -> Result<Shaft, StageFault> {
        let checked = require_finite(&[chain.tension, chain.angular_velocity]).and_then(|()| {
            if chain.tension < 0.0 || chain.angular_velocity < 0.0 {
                Err(StageFault::OutOfRange)
            } else {
                Ok(())
            }
        });
        if let Err(fault) = checked {
            self.state = ShaftState::default();
            return Err(fault);
        }

        let d = &ctx.params.drivetrain;
        let raw = chain.tension * d.sprocket_radius;
        let out = Shaft {
            torque: raw * d.sprocket_efficiency,
            speed: chain.angular_velocity,
        };
        self.state = ShaftState {
            torque_in: raw,
            torque_out: out.torque,
            speed_in: chain.angular_velocity,
            speed_out: out.speed,
        };
        Ok(out)
    }

    fn get_state(&self) -> ShaftState {
        self.state
    }

    fn reset(&mut self) {
        self.state = ShaftState::default();
    }
}
