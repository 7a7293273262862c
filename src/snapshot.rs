//! Immutable per-tick view of the simulation.
//!
//! Snapshots are plain values: once built they share nothing with the
//! engine, so they can cross threads and outlive later ticks.

use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;

use crate::chain::ChainState;
use crate::drivetrain::DrivetrainState;
use crate::electrical::ElectricalState;
use crate::engine::EngineStatus;
use crate::floater::{FillPhase, Floater};
use crate::safety::SafetyLevel;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloaterSummary {
    pub id: usize,
    pub fill_phase: FillPhase,
    pub angle: f64,
    pub position: f64,
    pub velocity: f64,
    pub effective_mass: f64,
    pub water_fill_fraction: f64,
}

impl From<&Floater> for FloaterSummary {
    fn from(floater: &Floater) -> Self {
        Self {
            id: floater.id,
            fill_phase: floater.fill_phase,
            angle: floater.angle,
            position: floater.position,
            velocity: floater.velocity,
            effective_mass: floater.effective_mass,
            water_fill_fraction: floater.water_fill_fraction,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSnapshot {
    pub tick_id: u64,
    pub sim_time: f64,
    pub status: EngineStatus,
    pub chain_tension: f64,
    pub chain_speed: f64,
    pub flywheel_speed: f64,
    pub electrical_power: f64,
    pub load_torque_command: f64,
    pub grid_synchronized: bool,
    pub correction_events_count: u64,
    pub tick_duration_ms: f64,

    /// Timestep the tick was advanced by.
    pub dt: f64,
    pub rollback_count: u64,
    pub clutch_engaged: bool,
    pub flywheel_stored_energy: f64,
    pub grid_power: f64,
    pub tick_duration_mean_ms: f64,
    pub tick_duration_variance_ms2: f64,
    pub degraded_ticks: u64,
    pub missed_pulses: u64,
    pub safety_level: SafetyLevel,
    pub last_error: Option<String>,

    pub chain: ChainState,
    pub drivetrain: DrivetrainState,
    pub electrical: ElectricalState,
    pub floaters: Vec<FloaterSummary>,
}

assert_impl_all!(SimulationSnapshot: Send, Sync, Clone);

impl SimulationSnapshot {
    pub fn csv_header() -> &'static str {
        "tick_id,sim_time,status,chain_tension,chain_speed,flywheel_speed,electrical_power,\
         load_torque_command,grid_synchronized,correction_events_count,dt,rollback_count,tick_duration_ms"
    }

    pub fn to_csv_row(&self) -> String {
        format!(
            "{},{:.4},{:?},{:.3},{:.4},{:.3},{:.2},{:.3},{},{},{:.5},{},{:.3}",
            self.tick_id,
            self.sim_time,
            self.status,
            self.chain_tension,
            self.chain_speed,
            self.flywheel_speed,
            self.electrical_power,
            self.load_torque_command,
            self.grid_synchronized,
            self.correction_events_count,
            self.dt,
            self.rollback_count,
            self.tick_duration_ms,
        )
    }

    /// Copy with the wall-clock derived fields zeroed, for comparing runs.
    pub fn without_timing(&self) -> Self {
        Self {
            tick_duration_ms: 0.0,
            tick_duration_mean_ms: 0.0,
            tick_duration_variance_ms2: 0.0,
            ..self.clone()
        }
    }
}
