//! Real-time control of the tick itself.
//!
//! Profiles every tick against the wall-clock budget and steers the next
//! timestep: shrink as soon as a tick runs over, grow slowly only after a run
//! of comfortably fast ticks. It also owns the post-tick stability check and
//! the snapshot publication throttle.

use std::time::{Duration, Instant};

use heapless::HistoryBuffer;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chain::ChainState;
use crate::config::{RunParameters, TimestepParams};
use crate::drivetrain::DrivetrainState;
use crate::electrical::ElectricalState;
use crate::error::EngineError;

const PERF_WINDOW: usize = 64;

// Timestep adaptation
const SHRINK_FACTOR: f64 = 0.8;
const GROW_FACTOR: f64 = 1.05;
const GROW_HEADROOM: f64 = 0.5;
const GROW_AFTER_TICKS: u32 = 10;
const ROLLBACK_FACTOR: f64 = 0.5;

// Electrical power above this multiple of rating is implausible
const PLAUSIBLE_POWER_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerStats {
    pub dt: f64,
    pub last_tick_ms: f64,
    pub mean_tick_ms: f64,
    pub variance_tick_ms2: f64,
    pub ticks_profiled: u64,
    pub over_budget_ticks: u64,
    pub dt_shrinks: u32,
    pub dt_grows: u32,
    pub rollbacks: u32,
    pub snapshots_published: u64,
    pub snapshots_suppressed: u64,
}

#[derive(Debug, Clone)]
pub struct RealTimeOptimizer {
    durations_ms: HistoryBuffer<f64, PERF_WINDOW>,
    dt: f64,
    calm_ticks: u32,
    last_publish: Option<Instant>,
    stats: OptimizerStats,
}

impl RealTimeOptimizer {
    pub fn new(timestep: &TimestepParams) -> Self {
        let dt = timestep.dt.clamp(timestep.min_dt, timestep.max_dt);
        Self {
            durations_ms: HistoryBuffer::new(),
            dt,
            calm_ticks: 0,
            last_publish: None,
            stats: OptimizerStats {
                dt,
                ..OptimizerStats::default()
            },
        }
    }

    /// Timestep for the next tick.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Re-clamp after the bounds changed.
    pub fn reconfigure(&mut self, timestep: &TimestepParams) {
        if !timestep.adaptive {
            self.dt = timestep.dt;
        }
        self.set_dt(self.dt, timestep);
    }

    fn set_dt(&mut self, dt: f64, timestep: &TimestepParams) {
        self.dt = dt.clamp(timestep.min_dt, timestep.max_dt);
        self.stats.dt = self.dt;
        debug_assert!(self.dt >= timestep.min_dt && self.dt <= timestep.max_dt);
    }

    /// Record a tick's wall-clock duration and adapt the next timestep.
    pub fn finish_tick(&mut self, elapsed: Duration, timestep: &TimestepParams) -> f64 {
        let ms = elapsed.as_secs_f64() * 1000.0;
        self.durations_ms.write(ms);
        self.stats.ticks_profiled += 1;
        self.stats.last_tick_ms = ms;
        self.update_statistics();

        let budget = timestep.target_tick_budget_ms;
        if ms > budget {
            self.stats.over_budget_ticks += 1;
            self.calm_ticks = 0;
            if timestep.adaptive && self.dt > timestep.min_dt {
                self.set_dt(self.dt * SHRINK_FACTOR, timestep);
                self.stats.dt_shrinks += 1;
                debug!(tick_ms = ms, budget, dt = self.dt, "tick over budget, shrinking dt");
            }
        } else if ms < budget * GROW_HEADROOM {
            self.calm_ticks += 1;
            if timestep.adaptive && self.calm_ticks >= GROW_AFTER_TICKS && self.dt < timestep.max_dt {
                self.set_dt(self.dt * GROW_FACTOR, timestep);
                self.stats.dt_grows += 1;
                self.calm_ticks = 0;
            }
        } else {
            self.calm_ticks = 0;
        }
        ms
    }

    fn update_statistics(&mut self) {
        let n = self.durations_ms.len() as f64;
        if n == 0.0 {
            return;
        }
        let mean = self.durations_ms.as_slice().iter().sum::<f64>() / n;
        let variance = self.durations_ms.as_slice().iter().map(|d| (d - mean) * (d - mean)).sum::<f64>() / n;
        self.stats.mean_tick_ms = mean;
        self.stats.variance_tick_ms2 = variance;
    }

    /// Check the tick's outputs for NaN, overflow and implausible magnitudes.
    pub fn check_stability(
        &self,
        chain: &ChainState,
        drivetrain: &DrivetrainState,
        electrical: Option<&ElectricalState>,
        params: &RunParameters,
    ) -> Result<(), EngineError> {
        let unstable = |signal: &'static str, value: f64| EngineError::PhysicsInstability { signal, value };

        for (signal, value) in [
            ("chain_tension", chain.tension),
            ("chain_speed", chain.angular_velocity),
            ("flywheel_speed", drivetrain.flywheel_speed),
        ] {
            if !value.is_finite() {
                return Err(unstable(signal, value));
            }
        }
        if drivetrain.flywheel_speed > params.safety.max_flywheel_speed {
            return Err(unstable("flywheel_speed", drivetrain.flywheel_speed));
        }
        if let Some(electrical) = electrical {
            let power = electrical.electrical_power;
            if !power.is_finite() || power > params.electrical.rated_power * PLAUSIBLE_POWER_FACTOR {
                return Err(unstable("electrical_power", power));
            }
            if !electrical.load_torque_command.is_finite() {
                return Err(unstable("load_torque_command", electrical.load_torque_command));
            }
        }
        Ok(())
    }

    /// Halve the timestep after a rollback.
    pub fn on_rollback(&mut self, timestep: &TimestepParams) {
        self.stats.rollbacks += 1;
        self.calm_ticks = 0;
        self.set_dt(self.dt * ROLLBACK_FACTOR, timestep);
    }

    /// Whether a snapshot may be published now under `rate_hz`.
    pub fn should_publish(&mut self, now: Instant, rate_hz: f64) -> bool {
        // An interval too long to represent is never due again
        let interval = Duration::try_from_secs_f64(1.0 / rate_hz).ok();
        let due = match (self.last_publish, interval) {
            (None, _) => true,
            (Some(last), Some(interval)) => now.duration_since(last) >= interval,
            (Some(_), None) => false,
        };
        if due {
            self.last_publish = Some(now);
            self.stats.snapshots_published += 1;
        } else {
            self.stats.snapshots_suppressed += 1;
        }
        due
    }

    pub fn get_stats(&self) -> &OptimizerStats {
        &self.stats
    }
}
