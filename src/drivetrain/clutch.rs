use serde::{Deserialize, Serialize};

use crate::error::StageFault;
use crate::stage::{require_finite, sealed, Shaft, Stage, StageContext};

// Rounding slack when comparing shaft speeds that were locked together.
pub(crate) const SPEED_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClutchOutput {
    pub torque: f64,
    pub engaged: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ClutchState {
    pub engaged: bool,
    pub torque_in: f64,
    pub torque_out: f64,
    pub chain_side_speed: f64,
    /// Flywheel speed at the start of the tick, the one compared against.
    pub flywheel_speed: f64,
    pub engagements: u64,
}

/// One-way (sprag) clutch between the gearbox and the flywheel.
///
/// Engages only when the chain side is at or above the flywheel's speed at
/// the start of the tick and within the engagement window. An engaged clutch
/// never drives the flywheel past the chain side.
#[derive(Debug, Clone, Default)]
pub struct OneWayClutch {
    state: ClutchState,
}

impl OneWayClutch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_engaged(&self) -> bool {
        self.state.engaged
    }
}

/// Torque a locked clutch passes so both sides accelerate together.
///
/// Never negative: a sprag cannot pull the chain.
pub fn locked_torque(drive_torque: f64, resisting_torque: f64, flywheel_inertia: f64, reflected_inertia: f64) -> f64 {
    let accel = (drive_torque - resisting_torque) / (flywheel_inertia + reflected_inertia);
    (resisting_torque + flywheel_inertia * accel).max(0.0)
}

/// Sprag engagement rule: the chain side has caught up with the flywheel
/// and is within the engagement window of it.
pub fn engages(chain_side_speed: f64, flywheel_speed: f64, threshold: f64) -> bool {
    chain_side_speed + SPEED_EPSILON >= flywheel_speed
        && (chain_side_speed - flywheel_speed).abs() < threshold
}

impl sealed::Sealed for OneWayClutch {}

impl Stage for OneWayClutch {
    type Input = Shaft;
    type Output = ClutchOutput;
    type State = ClutchState;

    fn name(&self) -> &'static str {
        "clutch"
    }

    fn process(&mut self, input: Shaft, ctx: &StageContext<'_>) -> Result<ClutchOutput, StageFault> {
        let d = &ctx.params.drivetrain;
        let checked = require_finite(&[input.torque, input.speed, ctx.flywheel_speed, ctx.load_torque, ctx.chain_inertia])
            .and_then(|()| {
                if input.speed < 0.0 || input.torque < 0.0 {
                    Err(StageFault::OutOfRange)
                } else {
                    Ok(())
                }
            });
        if let Err(fault) = checked {
            self.state.engaged = false;
            self.state.torque_out = 0.0;
            return Err(fault);
        }

        let engaged = engages(input.speed, ctx.flywheel_speed, d.clutch_engagement_threshold);
        let torque = if engaged {
            let ratio = d.active_ratio();
            let resisting = ctx.load_torque + d.flywheel_friction * ctx.flywheel_speed;
            let candidate = locked_torque(
                input.torque,
                resisting,
                d.flywheel_inertia,
                ctx.chain_inertia * ratio * ratio,
            );
            // Torque that brings the flywheel exactly up to the chain side
            let matching = if ctx.dt > 0.0 {
                resisting + d.flywheel_inertia * (input.speed - ctx.flywheel_speed) / ctx.dt
            } else {
                candidate
            };
            candidate.min(matching).max(0.0)
        } else {
            0.0
        };

        if engaged && !self.state.engaged {
            self.state.engagements += 1;
        }
        self.state.engaged = engaged;
        self.state.torque_in = input.torque;
        self.state.torque_out = torque;
        self.state.chain_side_speed = input.speed;
        self.state.flywheel_speed = ctx.flywheel_speed;

        debug_assert!(!engaged || torque >= 0.0, "engaged clutch transmitting {torque}");
        Ok(ClutchOutput { torque, engaged })
    }

    fn get_state(&self) -> ClutchState {
        self.state
    }

    fn reset(&mut self) {
        self.state = ClutchState::default();
    }
}
