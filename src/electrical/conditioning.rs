use serde::{Deserialize, Serialize};

use super::generator::GeneratorOutput;
use crate::error::StageFault;
use crate::stage::{require_finite, sealed, Stage, StageContext};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionedPower {
    pub power: f64,
    pub voltage_pu: f64,
    pub voltage_ok: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConditionerState {
    pub input_power: f64,
    pub output_power: f64,
    pub voltage_pu: f64,
    pub voltage_ok: bool,
}

/// Rectifier/inverter stage between the generator and the grid.
///
/// Generator voltage is taken as proportional to shaft speed. Outside the
/// input voltage window the conditioner blocks and passes no power.
#[derive(Debug, Clone, Default)]
pub struct PowerConditioner {
    state: ConditionerState,
}

impl PowerConditioner {
    pub fn new() -> Self {
        Self::default()
    }
}

impl sealed::Sealed for PowerConditioner {}

impl Stage for PowerConditioner {
    type Input = GeneratorOutput;
    type Output = ConditionedPower;
    type State = ConditionerState;

    fn name(&self) -> &'static str {
        "conditioner"
    }

    fn process(&mut self, input: GeneratorOutput, ctx: &StageContext<'_>) -> Result<ConditionedPower, StageFault> {
        require_finite(&[input.power, input.speed])?;
        let e = &ctx.params.electrical;

        let voltage_pu = input.speed / e.rated_speed;
        let voltage_ok = (e.min_input_voltage_pu..=e.max_input_voltage_pu).contains(&voltage_pu);
        let power = if voltage_ok {
            input.power.max(0.0) * e.conditioner_efficiency
        } else {
            0.0
        };

        self.state = ConditionerState {
            input_power: input.power,
            output_power: power,
            voltage_pu,
            voltage_ok,
        };
        Ok(ConditionedPower {
            power,
            voltage_pu,
            voltage_ok,
        })
    }

    fn get_state(&self) -> ConditionerState {
        self.state
    }

    fn reset(&mut self) {
        self.state = ConditionerState::default();
    }
}
