//! Mechanical drivetrain: sprocket → gearbox → one-way clutch → flywheel.
//!
//! Single pass per tick, no iteration to convergence. The flywheel is the
//! only place electrical load reaches the mechanics, and it always sees the
//! load torque commanded on the previous tick.

pub mod clutch;
pub mod flywheel;
pub mod gearbox;
pub mod sprocket;

pub use clutch::{ClutchOutput, ClutchState, OneWayClutch};
pub use flywheel::{Flywheel, FlywheelState};
pub use gearbox::{Gearbox, GearboxState};
pub use sprocket::{ShaftState, Sprocket};

use serde::{Deserialize, Serialize};

use crate::chain::{ChainState, DriveCoupling};
use crate::config::RunParameters;
use crate::stage::{FaultLog, Stage, StageContext};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrivetrainState {
    pub sprocket: ShaftState,
    pub gearbox: GearboxState,
    pub clutch: ClutchState,
    pub flywheel: FlywheelState,
    pub clutch_engaged: bool,
    pub flywheel_speed: f64,
    pub flywheel_stored_energy: f64,
    pub stage_faults: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Drivetrain {
    sprocket: Sprocket,
    gearbox: Gearbox,
    clutch: OneWayClutch,
    flywheel: Flywheel,
    faults: FaultLog,
}

impl Drivetrain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flywheel-side coupling the chain integrates against this tick.
    pub fn coupling(&self, params: &RunParameters, load_torque: f64) -> DriveCoupling {
        let d = &params.drivetrain;
        let speed = self.flywheel.speed();
        let load = if load_torque.is_finite() { load_torque.max(0.0) } else { 0.0 };
        DriveCoupling {
            ratio: d.active_ratio(),
            gearbox_efficiency: d.gearbox_efficiency,
            flywheel_inertia: d.flywheel_inertia,
            flywheel_speed: speed,
            resisting_torque: load + d.flywheel_friction * speed,
            engagement_threshold: d.clutch_engagement_threshold,
        }
    }

    pub fn flywheel_speed(&self) -> f64 {
        self.flywheel.speed()
    }

    /// Run the four stages in order against this tick's chain state.
    pub fn process(
        &mut self,
        chain: &ChainState,
        params: &RunParameters,
        chain_inertia: f64,
        load_torque: f64,
        dt: f64,
    ) -> DrivetrainState {
        let ctx = StageContext {
            params,
            dt,
            load_torque,
            flywheel_speed: self.flywheel.speed(),
            chain_inertia,
        };

        let shaft = self.faults.run(&mut self.sprocket, chain.clone(), &ctx);
        let shaft = self.faults.run(&mut self.gearbox, shaft, &ctx);
        let drive = self.faults.run(&mut self.clutch, shaft, &ctx);
        self.faults.run(&mut self.flywheel, drive, &ctx);

        self.get_state()
    }

    pub fn get_state(&self) -> DrivetrainState {
        let flywheel = self.flywheel.get_state();
        let clutch = self.clutch.get_state();
        DrivetrainState {
            sprocket: self.sprocket.get_state(),
            gearbox: self.gearbox.get_state(),
            clutch,
            flywheel,
            clutch_engaged: clutch.engaged,
            flywheel_speed: flywheel.speed,
            flywheel_stored_energy: flywheel.stored_energy,
            stage_faults: self.faults.total,
        }
    }

    pub fn reset(&mut self) {
        self.sprocket.reset();
        self.gearbox.reset();
        self.clutch.reset();
        self.flywheel.reset();
        self.faults = FaultLog::default();
    }
}
