//! Pipeline stage abstraction shared by the drivetrain and electrical chains.
//!
//! The set of stages is closed: the trait is sealed and the engine holds a
//! fixed, ordered pipeline. A stage that rejects its input returns a
//! [`StageFault`]; the owning pipeline logs it and substitutes the stage's
//! zero output for that tick.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RunParameters;
use crate::error::StageFault;

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Read-only inputs every stage may consult during a tick.
#[derive(Debug, Clone, Copy)]
pub struct StageContext<'a> {
    pub params: &'a RunParameters,
    pub dt: f64,
    /// Load torque commanded by the electrical system on the previous tick.
    pub load_torque: f64,
    /// Flywheel speed at the start of the tick.
    pub flywheel_speed: f64,
    /// Chain-side inertia about the sprocket axis.
    pub chain_inertia: f64,
}

pub trait Stage: sealed::Sealed {
    type Input;
    type Output: Default;
    type State: Clone + Serialize;

    fn name(&self) -> &'static str;
    fn process(&mut self, input: Self::Input, ctx: &StageContext<'_>) -> Result<Self::Output, StageFault>;
    fn get_state(&self) -> Self::State;
    fn reset(&mut self);
}

/// Shaft torque and speed passed between mechanical stages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Shaft {
    pub torque: f64,
    pub speed: f64,
}

/// Per-pipeline fault bookkeeping with first-occurrence logging.
#[derive(Debug, Clone, Default)]
pub struct FaultLog {
    pub total: u64,
    last: Option<(&'static str, StageFault)>,
}

impl FaultLog {
    /// Run one stage, substituting its zero output on a fault.
    pub fn run<S: Stage>(&mut self, stage: &mut S, input: S::Input, ctx: &StageContext<'_>) -> S::Output {
        match stage.process(input, ctx) {
            Ok(output) => {
                if matches!(self.last, Some((name, _)) if name == stage.name()) {
                    self.last = None;
                }
                output
            }
            Err(fault) => {
                self.total += 1;
                if self.last == Some((stage.name(), fault)) {
                    debug!(stage = stage.name(), %fault, "stage fault persists, substituting zero");
                } else {
                    warn!(stage = stage.name(), %fault, "stage fault, substituting zero contribution");
                    self.last = Some((stage.name(), fault));
                }
                S::Output::default()
            }
        }
    }
}

pub(crate) fn require_finite(values: &[f64]) -> Result<(), StageFault> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(())
    } else {
        Err(StageFault::NonFiniteInput)
    }
}
