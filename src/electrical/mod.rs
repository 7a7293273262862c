//! Electrical system: generator → power conditioning → grid interface.
//!
//! Produces the load torque command the flywheel consumes on the next tick.
//! The command is written once per tick, after the drivetrain has read the
//! previous value.

pub mod conditioning;
pub mod generator;
pub mod grid;

pub use conditioning::{ConditionerState, PowerConditioner};
pub use generator::{Generator, GeneratorState};
pub use grid::{GridInterface, GridState, TripReason};

use serde::{Deserialize, Serialize};

use crate::drivetrain::FlywheelState;
use crate::stage::{FaultLog, Stage, StageContext};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElectricalState {
    pub generator_speed: f64,
    pub generator_torque: f64,
    pub electrical_power: f64,
    pub load_torque_command: f64,
    pub grid_synchronized: bool,
    pub engagement: f64,
    pub conditioned_power: f64,
    pub grid_power: f64,
    pub voltage_pu: f64,
    pub frequency: f64,
    pub thd: f64,
    pub trip_reason: Option<TripReason>,
    pub grid_trips: u64,
    pub stage_faults: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ElectricalSystem {
    generator: Generator,
    conditioner: PowerConditioner,
    grid: GridInterface,
    load_torque_command: f64,
    faults: FaultLog,
}

impl ElectricalSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load torque written on the last tick.
    pub fn load_torque_command(&self) -> f64 {
        self.load_torque_command
    }

    pub fn process(&mut self, flywheel: &FlywheelState, ctx: &StageContext<'_>) -> ElectricalState {
        let generated = self.faults.run(&mut self.generator, *flywheel, ctx);
        let conditioned = self.faults.run(&mut self.conditioner, generated, ctx);
        self.faults.run(&mut self.grid, conditioned, ctx);

        self.load_torque_command = generated.load_torque;
        self.get_state()
    }

    pub fn get_state(&self) -> ElectricalState {
        let generator = self.generator.get_state();
        let conditioner = self.conditioner.get_state();
        let grid = self.grid.get_state();
        ElectricalState {
            generator_speed: generator.speed,
            generator_torque: generator.torque,
            electrical_power: generator.electrical_power,
            load_torque_command: self.load_torque_command,
            grid_synchronized: grid.synchronized,
            engagement: generator.engagement,
            conditioned_power: conditioner.output_power,
            grid_power: grid.power,
            voltage_pu: conditioner.voltage_pu,
            frequency: grid.frequency,
            thd: grid.thd,
            trip_reason: grid.trip_reason,
            grid_trips: grid.trips,
            stage_faults: self.faults.total,
        }
    }

    pub fn reset(&mut self) {
        self.generator.reset();
        self.conditioner.reset();
        self.grid.reset();
        self.load_torque_command = 0.0;
        self.faults = FaultLog::default();
    }
}
