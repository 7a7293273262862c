use serde::{Deserialize, Serialize};

use super::sprocket::ShaftState;
use crate::error::StageFault;
use crate::stage::{require_finite, sealed, Shaft, Stage, StageContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GearboxState {
    pub shaft: ShaftState,
    pub gear_index: usize,
    pub ratio: f64,
}

/// Multi-ratio gearbox. `speed_out = speed_in / ratio`.
///
/// The active ratio is read from the run parameters every tick, so a gear
/// change takes effect at the next tick boundary.
#[derive(Debug, Clone, Default)]
pub struct Gearbox {
    state: GearboxState,
}

impl Gearbox {
    pub fn new() -> Self {
        Self::default()
    }
}

impl sealed::Sealed for Gearbox {}

impl Stage for Gearbox {
    type Input = Shaft;
    type Output = Shaft;
    type State = GearboxState;

    fn name(&self) -> &'static str {
        "gearbox"
    }

    fn process(&mut self, input: Shaft, ctx: &StageContext<'_>) -> Result<Shaft, StageFault> {
        let d = &ctx.params.drivetrain;
        let ratio = d.active_ratio();
        let checked = require_finite(&[input.torque, input.speed, ratio]).and_then(|()| {
            if ratio <= 0.0 {
                Err(StageFault::OutOfRange)
            } else {
                Ok(())
            }
        });
        if let Err(fault) = checked {
            self.state = GearboxState::default();
            return Err(fault);
        }

        let out = Shaft {
            torque: input.torque * ratio * d.gearbox_efficiency,
            speed: input.speed / ratio,
        };
        self.state = GearboxState {
            shaft: ShaftState {
                torque_in: input.torque,
                torque_out: out.torque,
                speed_in: input.speed,
                speed_out: out.speed,
            },
            gear_index: d.gear_index,
            ratio,
        };
        Ok(out)
    }

    fn get_state(&self) -> GearboxState {
        self.state
    }

    fn reset(&mut self) {
        self.state = GearboxState::default();
    }
}
