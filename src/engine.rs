//! Simulation engine: lifecycle, tick sequencing and rollback.
//!
//! The engine is the single owner of all mutable simulation state. Every
//! tick runs the same fixed sequence:
//!
//! 1. release scheduled commands due at the current simulation time
//! 2. consistency pass over state changed between ticks, then checkpoint
//! 3. floater forces and chain motion
//! 4. drivetrain, against the previous tick's load torque
//! 5. electrical system, writing this tick's load torque
//! 6. state synchronizer
//! 7. stability check, then timestep adaptation
//!
//! A physics instability restores the checkpoint taken in step 2, the last
//! state known to satisfy every invariant, and halves the timestep. An emergency latches the engine into
//! [`EngineStatus::Error`] until [`Engine::reset`].

use core::f64::consts::TAU;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use static_assertions::assert_impl_all;
use tracing::{debug, error, info, warn};

use crate::chain::ChainAggregator;
use crate::command::Command;
use crate::config::RunParameters;
use crate::drivetrain::Drivetrain;
use crate::electrical::{ElectricalState, ElectricalSystem};
use crate::error::{EmergencyCondition, EngineError, ValidationError};
use crate::floater::Floater;
use crate::injection::{Injection, Injector};
use crate::optimizer::RealTimeOptimizer;
use crate::pneumatics::{Compressor, CompressorState};
use crate::safety::{SafetyEvent, SafetyManager};
use crate::scheduler::{CommandScheduler, ScheduleError};
use crate::snapshot::{FloaterSummary, SimulationSnapshot};
use crate::stage::StageContext;
use crate::synchronizer::StateSynchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineStatus {
    Uninitialized,
    Ready,
    Running,
    Paused,
    Stopped,
    Error,
}

/// Physical state restored by a rollback.
#[derive(Debug, Clone)]
struct Plant {
    floaters: Vec<Floater>,
    chain: ChainAggregator,
    compressor: Compressor,
    drivetrain: Drivetrain,
    electrical: Option<ElectricalSystem>,
    sim_time: f64,
}

impl Plant {
    fn new(params: &RunParameters) -> Self {
        let count = params.floaters.count;
        let floaters = (0..count)
            .map(|i| {
                let angle = i as f64 * TAU / count as f64;
                Floater::new(i, &params.floaters, angle, &params.fluid)
            })
            .collect();

        Self {
            floaters,
            chain: ChainAggregator::new(),
            compressor: Compressor::new(),
            drivetrain: Drivetrain::new(),
            electrical: params.electrical.enabled.then(ElectricalSystem::new),
            sim_time: 0.0,
        }
    }

    fn electrical_mut(&mut self) -> Result<&mut ElectricalSystem, EngineError> {
        self.electrical
            .as_mut()
            .ok_or(EngineError::ComponentUnavailable { component: "electrical" })
    }

    /// Load torque written by the electrical system on the previous tick.
    fn load_torque_command(&self) -> f64 {
        self.electrical.as_ref().map_or(0.0, |e| e.load_torque_command())
    }
}

/// Rollback target: the plant and the correction log that goes with it.
#[derive(Debug, Clone)]
struct Checkpoint {
    plant: Plant,
    synchronizer: StateSynchronizer,
}

pub struct Engine {
    status: EngineStatus,
    params: RunParameters,
    plant: Plant,
    last_good: Checkpoint,

    synchronizer: StateSynchronizer,
    optimizer: RealTimeOptimizer,
    safety: SafetyManager,
    scheduler: CommandScheduler,
    injector: Injector,

    tick_id: u64,
    rollback_count: u64,
    degraded_ticks: u64,
    unavailable_logged: bool,
    last_dt: f64,
    last_tick_ms: f64,
    last_error: Option<String>,
    last_snapshot: Option<SimulationSnapshot>,
}

assert_impl_all!(Engine: Send);

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    /// An engine with default parameters that must be configured or started
    /// before it will tick.
    pub fn new() -> Self {
        let params = RunParameters::default();
        let plant = Plant::new(&params);
        Self {
            status: EngineStatus::Uninitialized,
            last_good: Checkpoint {
                plant: plant.clone(),
                synchronizer: StateSynchronizer::new(),
            },
            plant,
            synchronizer: StateSynchronizer::new(),
            optimizer: RealTimeOptimizer::new(&params.timestep),
            safety: SafetyManager::new(),
            scheduler: CommandScheduler::new(),
            injector: Injector::new(&params.injection),
            tick_id: 0,
            rollback_count: 0,
            degraded_ticks: 0,
            unavailable_logged: false,
            last_dt: 0.0,
            last_tick_ms: 0.0,
            last_error: None,
            last_snapshot: None,
            params,
        }
    }

    /// Validate `params` and return an engine in [`EngineStatus::Ready`].
    pub fn with_parameters(params: RunParameters) -> Result<Self, EngineError> {
        let mut engine = Self::new();
        engine.configure(params)?;
        Ok(engine)
    }

    // ---- lifecycle ----

    pub fn configure(&mut self, params: RunParameters) -> Result<EngineStatus, EngineError> {
        self.require(
            "configure",
            &[EngineStatus::Uninitialized, EngineStatus::Ready, EngineStatus::Stopped],
        )?;
        params.validate()?;
        self.initialize(params);
        self.transition(EngineStatus::Ready);
        Ok(self.status)
    }

    /// Validate `params`, build fresh state from them and start running.
    ///
    /// A rejected parameter set leaves the engine untouched.
    pub fn start(&mut self, params: RunParameters) -> Result<EngineStatus, EngineError> {
        self.require(
            "start",
            &[EngineStatus::Uninitialized, EngineStatus::Ready, EngineStatus::Stopped],
        )?;
        params.validate()?;
        self.initialize(params);
        self.transition(EngineStatus::Running);
        Ok(self.status)
    }

    pub fn stop(&mut self) -> Result<EngineStatus, EngineError> {
        self.require(
            "stop",
            &[EngineStatus::Ready, EngineStatus::Running, EngineStatus::Paused],
        )?;
        self.transition(EngineStatus::Stopped);
        Ok(self.status)
    }

    pub fn pause(&mut self) -> Result<EngineStatus, EngineError> {
        self.require("pause", &[EngineStatus::Running])?;
        self.transition(EngineStatus::Paused);
        Ok(self.status)
    }

    pub fn resume(&mut self) -> Result<EngineStatus, EngineError> {
        self.require("resume", &[EngineStatus::Paused])?;
        self.transition(EngineStatus::Running);
        Ok(self.status)
    }

    /// Rebuild all state from the current parameters. Clears a latched error.
    pub fn reset(&mut self) -> Result<EngineStatus, EngineError> {
        if self.status == EngineStatus::Uninitialized {
            return Err(EngineError::InvalidTransition {
                operation: "reset",
                status: self.status,
            });
        }
        let params = self.params.clone();
        self.initialize(params);
        self.transition(EngineStatus::Ready);
        Ok(self.status)
    }

    fn initialize(&mut self, params: RunParameters) {
        self.plant = Plant::new(&params);
        self.synchronizer.reset();
        self.optimizer = RealTimeOptimizer::new(&params.timestep);
        self.safety.reset();
        self.scheduler.clear();
        self.injector = Injector::new(&params.injection);
        self.tick_id = 0;
        self.rollback_count = 0;
        self.degraded_ticks = 0;
        self.unavailable_logged = false;
        self.last_dt = 0.0;
        self.last_tick_ms = 0.0;
        self.last_error = None;
        self.last_snapshot = None;
        self.params = params;
        self.checkpoint();
    }

    fn checkpoint(&mut self) {
        self.last_good = Checkpoint {
            plant: self.plant.clone(),
            synchronizer: self.synchronizer.clone(),
        };
    }

    fn rollback(&mut self) {
        self.plant = self.last_good.plant.clone();
        self.synchronizer = self.last_good.synchronizer.clone();
    }

    fn require(&self, operation: &'static str, allowed: &[EngineStatus]) -> Result<(), EngineError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                operation,
                status: self.status,
            })
        }
    }

    fn transition(&mut self, to: EngineStatus) {
        if self.status != to {
            info!(from = ?self.status, to = ?to, tick_id = self.tick_id, "engine state change");
        }
        self.status = to;
    }

    // ---- commands ----

    /// Apply one command at a tick boundary.
    pub fn apply(&mut self, command: Command) -> Result<EngineStatus, EngineError> {
        match command {
            Command::Start(params) => self.start(*params),
            Command::Stop => self.stop(),
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Reset => self.reset(),
            Command::Step { dt } => self.step(dt).map(|snapshot| snapshot.status),
            Command::SetParameter { key, value } => self.set_parameter(&key, value).map(|_| self.status),
            Command::TriggerPulse => self.trigger_pulse().map(|_| self.status),
            Command::Inject(injection) => self.inject(injection).map(|_| self.status),
        }
    }

    /// Change one runtime-adjustable parameter.
    pub fn set_parameter(&mut self, key: &str, value: f64) -> Result<(), EngineError> {
        if self.status == EngineStatus::Uninitialized {
            return Err(EngineError::InvalidTransition {
                operation: "set_parameter",
                status: self.status,
            });
        }
        let next = self.params.with_parameter(key, value)?;
        let electrical_toggled = next.electrical.enabled != self.params.electrical.enabled;
        self.params = next;
        self.optimizer.reconfigure(&self.params.timestep);

        if electrical_toggled {
            if self.params.electrical.enabled {
                self.plant.electrical = Some(ElectricalSystem::new());
                self.safety.resolve(SafetyEvent::ComponentUnavailable);
            } else {
                self.plant.electrical = None;
            }
            self.unavailable_logged = false;
        }
        info!(key, value, "parameter updated");
        Ok(())
    }

    /// Fire the compressor now. Returns the id of the floater filled, if any.
    pub fn trigger_pulse(&mut self) -> Result<Option<usize>, EngineError> {
        self.require(
            "trigger_pulse",
            &[EngineStatus::Ready, EngineStatus::Running, EngineStatus::Paused],
        )?;
        let filled = self.plant.compressor.trigger_pulse(
            &mut self.plant.floaters,
            &self.params.fluid,
            &self.params.pneumatics,
            self.plant.sim_time,
        );
        match filled {
            Some(id) => info!(floater = id, "manual compressor pulse"),
            None => debug!("manual compressor pulse found no eligible floater"),
        }
        Ok(filled)
    }

    pub fn inject(&mut self, injection: Injection) -> Result<(), EngineError> {
        self.require(
            "inject",
            &[EngineStatus::Ready, EngineStatus::Running, EngineStatus::Paused],
        )?;
        if self.injector.inject(injection, &mut self.plant.floaters) {
            Ok(())
        } else {
            Err(EngineError::Validation(ValidationError::OutOfRange {
                name: "injection".to_string(),
                value: self.plant.floaters.len() as f64,
                reason: "unknown floater or injection queue full".to_string(),
            }))
        }
    }

    /// Hold `command` until simulation time reaches `execution_time`.
    pub fn schedule(&mut self, id: u32, command: Command, execution_time: f64) -> Result<(), ScheduleError> {
        self.scheduler
            .schedule(id, command, execution_time, self.plant.sim_time)?;
        debug!(id, execution_time, "command scheduled");
        Ok(())
    }

    fn drain_scheduled(&mut self) {
        for entry in self.scheduler.take_ready(self.plant.sim_time) {
            let name = entry.command.name();
            match self.apply(entry.command) {
                Ok(status) => info!(id = entry.id, command = name, ?status, "scheduled command executed"),
                Err(e) => warn!(id = entry.id, command = name, error = %e, "scheduled command failed"),
            }
        }
    }

    // ---- ticking ----

    /// Advance one tick by `dt`, clamped into the configured bounds.
    ///
    /// From `Ready` this starts the run; while `Paused` it single-steps
    /// without resuming.
    pub fn step(&mut self, dt: f64) -> Result<SimulationSnapshot, EngineError> {
        self.require(
            "step",
            &[EngineStatus::Ready, EngineStatus::Running, EngineStatus::Paused],
        )?;
        if !dt.is_finite() {
            return Err(ValidationError::NotFinite { name: "dt".to_string() }.into());
        }
        if self.status == EngineStatus::Ready {
            self.transition(EngineStatus::Running);
        }

        let bounds = &self.params.timestep;
        let clamped = dt.clamp(bounds.min_dt, bounds.max_dt);
        if clamped != dt {
            warn!(requested = dt, clamped, "step dt outside bounds, clamped");
        }
        self.tick(clamped)
    }

    /// Advance one tick by the optimizer's current timestep.
    pub fn run_tick(&mut self) -> Result<SimulationSnapshot, EngineError> {
        self.require("run_tick", &[EngineStatus::Running])?;
        let dt = self.optimizer.dt();
        self.tick(dt)
    }

    fn tick(&mut self, dt: f64) -> Result<SimulationSnapshot, EngineError> {
        let started = Instant::now();

        self.drain_scheduled();
        if !matches!(self.status, EngineStatus::Running | EngineStatus::Paused) {
            return Ok(self.publishable_snapshot());
        }

        self.tick_id += 1;
        let outcome = self.restore_consistency().and_then(|()| {
            self.checkpoint();
            self.advance(dt)
        });

        match outcome {
            Ok(()) => self.last_dt = dt,
            Err(EngineError::PhysicsInstability { signal, value }) => {
                self.rollback();
                self.rollback_count += 1;
                self.optimizer.on_rollback(&self.params.timestep);
                self.last_error = Some(format!("physics instability in {signal}: {value}"));
                warn!(
                    tick_id = self.tick_id,
                    signal,
                    value,
                    next_dt = self.optimizer.dt(),
                    "rolled back to last known-good state"
                );
                if let Err(condition) =
                    self.safety
                        .record_instability(&self.params.safety, self.tick_id, self.plant.sim_time)
                {
                    return Err(self.enter_error(condition, started));
                }
            }
            Err(EngineError::Emergency(condition)) => return Err(self.enter_error(condition, started)),
            Err(other) => return Err(other),
        }

        self.last_tick_ms = self.optimizer.finish_tick(started.elapsed(), &self.params.timestep);
        Ok(self.publishable_snapshot())
    }

    /// Repair state changed between ticks before any force is summed.
    fn restore_consistency(&mut self) -> Result<(), EngineError> {
        let corrections = self.synchronizer.synchronize(
            &mut self.plant.floaters,
            self.plant.chain.get_state().linear_speed,
            self.params.fluid.water_density,
            self.tick_id,
        )?;
        if corrections > 0 {
            debug!(tick_id = self.tick_id, corrections, "floater state repaired before the tick");
        }
        Ok(())
    }

    fn advance(&mut self, dt: f64) -> Result<(), EngineError> {
        let tick_id = self.tick_id;
        let now = self.plant.sim_time;

        let perturbed = self.injector.perturb(&mut self.plant.floaters);
        if perturbed > 0 {
            debug!(tick_id, perturbed, "random mass perturbation");
        }
        let external_force = self.injector.take_chain_force();

        // Mechanical side sees only last tick's load command
        let load_torque = self.plant.load_torque_command();
        let coupling = self.plant.drivetrain.coupling(&self.params, load_torque);
        let chain_inertia = ChainAggregator::chain_inertia(&self.plant.floaters, &self.params);

        let activity = match self.plant.chain.advance(
            &mut self.plant.floaters,
            &mut self.plant.compressor,
            &self.params,
            &coupling,
            external_force,
            now,
            dt,
        ) {
            Ok(activity) => activity,
            Err(EngineError::Emergency(condition)) => {
                self.safety.record_emergency(&condition, tick_id, now);
                return Err(EngineError::Emergency(condition));
            }
            Err(e) => return Err(e),
        };
        if activity.skipped_venting > 0 {
            debug!(tick_id, skipped = activity.skipped_venting, "floaters reached bottom still venting");
        }

        let chain = self.plant.chain.get_state();
        self.safety
            .check_chain(&chain, &self.params.safety, tick_id, now)
            .map_err(EngineError::Emergency)?;

        let drivetrain = self
            .plant
            .drivetrain
            .process(&chain, &self.params, chain_inertia, load_torque, dt);

        let electrical = match self.plant.electrical_mut() {
            Ok(system) => {
                let trips_before = system.get_state().grid_trips;
                let ctx = StageContext {
                    params: &self.params,
                    dt,
                    load_torque,
                    flywheel_speed: drivetrain.flywheel_speed,
                    chain_inertia,
                };
                let state = system.process(&drivetrain.flywheel, &ctx);
                if state.grid_trips > trips_before {
                    self.safety.record_grid_trip(tick_id, now);
                } else if state.grid_synchronized {
                    self.safety.resolve(SafetyEvent::GridTrip);
                }
                Some(state)
            }
            Err(EngineError::ComponentUnavailable { component }) => {
                self.degraded_ticks += 1;
                if !self.unavailable_logged {
                    warn!(tick_id, component, "component unavailable, continuing without its contribution");
                    self.safety.record_component_unavailable(tick_id, now);
                    self.unavailable_logged = true;
                }
                None
            }
            Err(e) => return Err(e),
        };

        let corrections = self.synchronizer.synchronize(
            &mut self.plant.floaters,
            chain.linear_speed,
            self.params.fluid.water_density,
            tick_id,
        )?;
        if corrections > 0 {
            debug!(tick_id, corrections, "synchronizer corrected floater state");
        }

        self.optimizer
            .check_stability(&chain, &drivetrain, electrical.as_ref(), &self.params)?;

        self.plant.sim_time += dt;
        Ok(())
    }

    fn enter_error(&mut self, condition: EmergencyCondition, started: Instant) -> EngineError {
        self.last_error = Some(condition.to_string());
        self.last_tick_ms = started.elapsed().as_secs_f64() * 1000.0;
        error!(tick_id = self.tick_id, %condition, "engine halted");
        self.transition(EngineStatus::Error);
        self.last_snapshot = Some(self.snapshot());
        EngineError::Emergency(condition)
    }

    fn publishable_snapshot(&mut self) -> SimulationSnapshot {
        let snapshot = self.snapshot();
        self.last_snapshot = Some(snapshot.clone());
        snapshot
    }

    /// Value copy of the current state.
    pub fn snapshot(&self) -> SimulationSnapshot {
        let chain = self.plant.chain.get_state();
        let drivetrain = self.plant.drivetrain.get_state();
        let electrical = self
            .plant
            .electrical
            .as_ref()
            .map(ElectricalSystem::get_state)
            .unwrap_or_else(ElectricalState::default);
        let perf = self.optimizer.get_stats();

        SimulationSnapshot {
            tick_id: self.tick_id,
            sim_time: self.plant.sim_time,
            status: self.status,
            chain_tension: chain.tension,
            chain_speed: chain.linear_speed,
            flywheel_speed: drivetrain.flywheel_speed,
            electrical_power: electrical.electrical_power,
            load_torque_command: electrical.load_torque_command,
            grid_synchronized: electrical.grid_synchronized,
            correction_events_count: self.synchronizer.total_corrections(),
            tick_duration_ms: self.last_tick_ms,
            dt: self.last_dt,
            rollback_count: self.rollback_count,
            clutch_engaged: drivetrain.clutch_engaged,
            flywheel_stored_energy: drivetrain.flywheel_stored_energy,
            grid_power: electrical.grid_power,
            tick_duration_mean_ms: perf.mean_tick_ms,
            tick_duration_variance_ms2: perf.variance_tick_ms2,
            degraded_ticks: self.degraded_ticks,
            missed_pulses: self.plant.compressor.get_state().missed_pulses,
            safety_level: self.safety.get_state().safety_level,
            last_error: self.last_error.clone(),
            floaters: self.plant.floaters.iter().map(FloaterSummary::from).collect(),
            chain,
            drivetrain,
            electrical,
        }
    }

    /// Whether the continuous run loop may publish a snapshot now.
    pub fn should_publish(&mut self, now: Instant) -> bool {
        self.optimizer.should_publish(now, self.params.timestep.publish_rate_hz)
    }

    // ---- accessors ----

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn parameters(&self) -> &RunParameters {
        &self.params
    }

    pub fn sim_time(&self) -> f64 {
        self.plant.sim_time
    }

    pub fn tick_id(&self) -> u64 {
        self.tick_id
    }

    pub fn floaters(&self) -> &[Floater] {
        &self.plant.floaters
    }

    pub fn last_snapshot(&self) -> Option<&SimulationSnapshot> {
        self.last_snapshot.as_ref()
    }

    pub fn compressor_state(&self) -> CompressorState {
        self.plant.compressor.get_state()
    }

    pub fn safety(&self) -> &SafetyManager {
        &self.safety
    }

    pub fn synchronizer(&self) -> &StateSynchronizer {
        &self.synchronizer
    }

    pub fn optimizer(&self) -> &RealTimeOptimizer {
        &self.optimizer
    }

    pub fn scheduler(&self) -> &CommandScheduler {
        &self.scheduler
    }

    pub fn injector(&self) -> &Injector {
        &self.injector
    }
}
