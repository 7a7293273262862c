use serde::{Deserialize, Serialize};

use crate::drivetrain::FlywheelState;
use crate::error::StageFault;
use crate::stage::{require_finite, sealed, Stage, StageContext};

// Bootstrap engagement band below the power threshold
const MIN_BOOTSTRAP_ENGAGEMENT: f64 = 0.1;
const MAX_BOOTSTRAP_ENGAGEMENT: f64 = 0.5;

// Below this shaft speed torque is not derived from power
const MIN_TORQUE_SPEED_RAD_S: f64 = 1e-3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOutput {
    pub power: f64,
    pub load_torque: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorState {
    pub speed: f64,
    pub torque: f64,
    pub electrical_power: f64,
    pub available_power: f64,
    pub engagement: f64,
    pub load_factor: f64,
}

/// Electromagnetic generator driven directly off the flywheel shaft.
#[derive(Debug, Clone, Default)]
pub struct Generator {
    state: GeneratorState,
}

impl Generator {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Fraction of the commanded load the generator takes on.
///
/// Full engagement above the bootstrap threshold; below it the engagement
/// scales with available power inside the bootstrap band.
pub fn engagement(available_power: f64, load_factor: f64, threshold: f64) -> f64 {
    if available_power <= 0.0 || load_factor <= 0.0 {
        0.0
    } else if available_power >= threshold {
        1.0
    } else {
        (available_power / threshold).clamp(MIN_BOOTSTRAP_ENGAGEMENT, MAX_BOOTSTRAP_ENGAGEMENT)
    }
}

impl sealed::Sealed for Generator {}

impl Stage for Generator {
    type Input = FlywheelState;
    type Output = GeneratorOutput;
    type State = GeneratorState;

    fn name(&self) -> &'static str {
        "generator"
    }

    fn process(&mut self, shaft: FlywheelState, ctx: &StageContext<'_>) -> Result<GeneratorOutput, StageFault> {
        require_finite(&[shaft.speed, shaft.available_power])?;
        if shaft.speed < 0.0 {
            self.state = GeneratorState::default();
            return Err(StageFault::OutOfRange);
        }

        let e = &ctx.params.electrical;
        let available = shaft.available_power.max(0.0);
        let engagement = engagement(available, e.load_factor, e.bootstrap_power_threshold);
        let power = (e.load_factor * e.rated_power * engagement).min(available * e.generator_efficiency);

        let braking_floor = if engagement > 0.0 { e.min_braking_torque } else { 0.0 };
        let load_torque = if shaft.speed > MIN_TORQUE_SPEED_RAD_S {
            (power / e.generator_efficiency / shaft.speed).max(braking_floor)
        } else {
            braking_floor
        };

        debug_assert!(power <= e.rated_power, "generator power {power} above rating");

        self.state = GeneratorState {
            speed: shaft.speed,
            torque: load_torque,
            electrical_power: power,
            available_power: available,
            engagement,
            load_factor: e.load_factor,
        };
        Ok(GeneratorOutput {
            power,
            load_torque,
            speed: shaft.speed,
        })
    }

    fn get_state(&self) -> GeneratorState {
        self.state
    }

    fn reset(&mut self) {
        self.state = GeneratorState::default();
    }
}
