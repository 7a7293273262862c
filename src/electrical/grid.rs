use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::conditioning::ConditionedPower;
use crate::error::StageFault;
use crate::stage::{require_finite, sealed, Stage, StageContext};

// Harmonic distortion model: base + light-load term
const BASE_THD: f64 = 0.02;
const LIGHT_LOAD_THD: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TripReason {
    Voltage,
    Frequency,
    Harmonics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GridOutput {
    pub power: f64,
    pub synchronized: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GridState {
    pub synchronized: bool,
    pub power: f64,
    pub frequency: f64,
    pub thd: f64,
    pub trip_reason: Option<TripReason>,
    /// Seconds the connection conditions have held while disconnected.
    pub healthy_time: f64,
    pub trips: u64,
}

/// Grid tie with voltage, frequency and harmonic protection.
///
/// A protection trip drops the handoff only and is not a stage fault; it is
/// counted in [`GridState::trips`] and never touches the mechanical side. Reconnection waits for `reconnect_delay` seconds of
/// healthy conditions.
#[derive(Debug, Clone, Default)]
pub struct GridInterface {
    state: GridState,
}

impl GridInterface {
    pub fn new() -> Self {
        Self::default()
    }
}

pub fn harmonic_distortion(power: f64, rated_power: f64) -> f64 {
    let loading = (power / rated_power).clamp(0.0, 1.0);
    BASE_THD + LIGHT_LOAD_THD * (1.0 - loading)
}

impl sealed::Sealed for GridInterface {}

impl Stage for GridInterface {
    type Input = ConditionedPower;
    type Output = GridOutput;
    type State = GridState;

    fn name(&self) -> &'static str {
        "grid"
    }

    fn process(&mut self, input: ConditionedPower, ctx: &StageContext<'_>) -> Result<GridOutput, StageFault> {
        require_finite(&[input.power, input.voltage_pu])?;
        let e = &ctx.params.electrical;

        let thd = harmonic_distortion(input.power, e.rated_power);
        let fault = if !input.voltage_ok {
            Some(TripReason::Voltage)
        } else if (e.grid_frequency - e.nominal_frequency).abs() > e.frequency_tolerance {
            Some(TripReason::Frequency)
        } else if thd > e.max_thd {
            Some(TripReason::Harmonics)
        } else {
            None
        };

        self.state.frequency = e.grid_frequency;
        self.state.thd = thd;

        if let Some(reason) = fault {
            let was_synchronized = self.state.synchronized;
            self.state.synchronized = false;
            self.state.power = 0.0;
            self.state.healthy_time = 0.0;
            self.state.trip_reason = Some(reason);
            if was_synchronized {
                self.state.trips += 1;
                warn!(?reason, trips = self.state.trips, "grid protection trip");
            }
            return Ok(GridOutput::default());
        }

        if !self.state.synchronized {
            self.state.healthy_time += ctx.dt;
            if self.state.healthy_time >= e.reconnect_delay {
                self.state.synchronized = true;
                self.state.trip_reason = None;
                info!(frequency = e.grid_frequency, "grid synchronized");
            }
        }

        self.state.power = if self.state.synchronized { input.power } else { 0.0 };
        Ok(GridOutput {
            power: self.state.power,
            synchronized: self.state.synchronized,
        })
    }

    fn get_state(&self) -> GridState {
        self.state
    }

    fn reset(&mut self) {
        self.state = GridState::default();
    }
}
