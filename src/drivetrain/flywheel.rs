use serde::{Deserialize, Serialize};

use super::clutch::ClutchOutput;
use crate::error::StageFault;
use crate::stage::{require_finite, sealed, Shaft, Stage, StageContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FlywheelState {
    pub speed: f64,
    pub stored_energy: f64,
    pub torque_in: f64,
    pub load_torque: f64,
    pub net_torque: f64,
    /// Clutch torque filtered over the smoothing time constant.
    pub average_torque: f64,
    /// Shaft power offered to the generator, W.
    pub available_power: f64,
}

/// Energy buffer between the clutch and the generator.
///
/// `I·dω/dt = τ_clutch − τ_load − b·ω`, with the load torque taken from the
/// electrical system's previous tick.
#[derive(Debug, Clone, Default)]
pub struct Flywheel {
    state: FlywheelState,
}

impl Flywheel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn speed(&self) -> f64 {
        self.state.speed
    }
}

impl sealed::Sealed for Flywheel {}

impl Stage for Flywheel {
    type Input = ClutchOutput;
    type Output = Shaft;
    type State = FlywheelState;

    fn name(&self) -> &'static str {
        "flywheel"
    }

    fn process(&mut self, input: ClutchOutput, ctx: &StageContext<'_>) -> Result<Shaft, StageFault> {
        require_finite(&[input.torque, ctx.load_torque])?;
        if ctx.load_torque < 0.0 {
            return Err(StageFault::OutOfRange);
        }

        let d = &ctx.params.drivetrain;
        let speed = self.state.speed;
        let net = input.torque - ctx.load_torque - d.flywheel_friction * speed;
        let next = (speed + net / d.flywheel_inertia * ctx.dt).max(0.0);

        let alpha = ctx.dt / (d.drive_torque_smoothing + ctx.dt);
        let average = self.state.average_torque + (input.torque - self.state.average_torque) * alpha;

        self.state = FlywheelState {
            speed: next,
            stored_energy: 0.5 * d.flywheel_inertia * next * next,
            torque_in: input.torque,
            load_torque: ctx.load_torque,
            net_torque: net,
            average_torque: average,
            available_power: (average * next).max(0.0),
        };

        Ok(Shaft {
            torque: net,
            speed: next,
        })
    }

    fn get_state(&self) -> FlywheelState {
        self.state
    }

    fn reset(&mut self) {
        self.state = FlywheelState::default();
    }
}
