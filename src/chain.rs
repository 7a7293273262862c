//! Chain aggregator: floater forces in, chain motion out.
//!
//! Each tick the aggregator sums the floaters' vertical forces into a single
//! drive force, checks it against the tension ceiling, integrates the chain
//! speed and moves every floater along the loop. Station crossings and fill
//! progress are applied in the same pass, so a floater that lands on a
//! station transitions on that tick.

use core::f64::consts::TAU;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RunParameters;
use crate::drivetrain::clutch::SPEED_EPSILON;
use crate::error::{EmergencyCondition, EngineError};
use crate::floater::{FillEvent, Floater, Station};
use crate::pneumatics::Compressor;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    /// Chain tension, N. Never negative and never above the ceiling.
    pub tension: f64,
    /// Sprocket angular velocity, rad/s. Never negative.
    pub angular_velocity: f64,
    /// Sprocket angle, `[0, 2π)`.
    pub angle: f64,
    pub linear_speed: f64,
    /// Signed drive force along the direction of travel, N.
    pub total_vertical_force: f64,
    /// Chain moved together with the flywheel through the clutch this tick.
    pub locked_to_flywheel: bool,
}

// Share of the clutch engagement window a locked chain may gain per tick.
const LOCK_WINDOW_FRACTION: f64 = 0.5;

/// Flywheel-side view of the drivetrain at the start of a tick.
///
/// Produced by the drivetrain so the chain can tell whether the one-way
/// clutch locks it to the flywheel this tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DriveCoupling {
    pub ratio: f64,
    pub gearbox_efficiency: f64,
    pub flywheel_inertia: f64,
    /// Flywheel speed at the start of the tick.
    pub flywheel_speed: f64,
    /// Load and bearing torque resisting the flywheel, N·m.
    pub resisting_torque: f64,
    pub engagement_threshold: f64,
}

impl DriveCoupling {
    /// Flywheel speed after `dt` driven through a locked clutch.
    ///
    /// `drive_torque` is the gearbox output torque and `chain_inertia` the
    /// chain-side inertia before reflection.
    pub fn locked_speed(&self, drive_torque: f64, chain_inertia: f64, dt: f64) -> f64 {
        let reflected = chain_inertia * self.ratio * self.ratio;
        let accel = (drive_torque - self.resisting_torque) / (self.flywheel_inertia + reflected);
        (self.flywheel_speed + accel * dt).max(0.0)
    }

    /// Chain-side speed after `dt`, given the speed the chain would reach on
    /// its own. Returns the speed and whether the sprag engaged.
    ///
    /// The sprag engages once the chain side catches the flywheel's speed at
    /// the start of the tick. Locked, the chain side never falls below that
    /// speed and never leaves the engagement window above it, so the clutch
    /// stage reaches the same decision from the resulting speed.
    pub fn chain_side_speed(&self, free_side: f64, drive_torque: f64, chain_inertia: f64, dt: f64) -> (f64, bool) {
        let flywheel = self.flywheel_speed;
        if free_side + SPEED_EPSILON < flywheel {
            return (free_side, false);
        }
        let window = flywheel + self.engagement_threshold * LOCK_WINDOW_FRACTION;
        let side = self
            .locked_speed(drive_torque, chain_inertia, dt)
            .min(free_side)
            .min(window)
            .max(flywheel);
        (side, true)
    }
}

/// Per-tick fill activity, folded into the snapshot counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FillActivity {
    pub fills_started: u32,
    pub fills_completed: u32,
    pub vents_started: u32,
    pub vents_completed: u32,
    pub skipped_venting: u32,
}

impl FillActivity {
    fn record(&mut self, event: FillEvent) {
        match event {
            FillEvent::FillStarted => self.fills_started += 1,
            FillEvent::FillCompleted => self.fills_completed += 1,
            FillEvent::VentStarted => self.vents_started += 1,
            FillEvent::VentCompleted => self.vents_completed += 1,
            FillEvent::VentingInProgress => self.skipped_venting += 1,
            FillEvent::None | FillEvent::AwaitingAir => {}
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChainAggregator {
    state: ChainState,
}

impl ChainAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_state(&self) -> ChainState {
        self.state.clone()
    }

    /// Sum of floater net forces projected onto the direction of travel.
    pub fn total_vertical_force(floaters: &[Floater], params: &RunParameters) -> f64 {
        floaters
            .iter()
            .map(|f| f.compute_forces(&params.fluid, &params.pneumatics).net * f.side().sign())
            .sum()
    }

    /// Chain-side rotational inertia about the sprocket axis.
    pub fn chain_inertia(floaters: &[Floater], params: &RunParameters) -> f64 {
        let d = &params.drivetrain;
        let mass: f64 = floaters.iter().map(|f| f.effective_mass).sum::<f64>() + d.chain_mass;
        mass * d.sprocket_radius * d.sprocket_radius + d.sprocket_inertia
    }

    /// Advance the chain and every floater by `dt`.
    ///
    /// `external_force` is added to the drive force before the ceiling check.
    /// A non-finite drive force is a physics instability; a force above the
    /// tension ceiling is an emergency and leaves the chain clamped at it.
    #[allow(clippy::too_many_arguments)]
    pub fn advance(
        &mut self,
        floaters: &mut [Floater],
        compressor: &mut Compressor,
        params: &RunParameters,
        coupling: &DriveCoupling,
        external_force: f64,
        sim_time: f64,
        dt: f64,
    ) -> Result<FillActivity, EngineError> {
        let d = &params.drivetrain;
        let force = Self::total_vertical_force(floaters, params) + external_force;
        if !force.is_finite() {
            return Err(EngineError::PhysicsInstability {
                signal: "chain_force",
                value: force,
            });
        }

        let ceiling = params.safety.max_chain_tension;
        if force > ceiling {
            self.state.tension = ceiling;
            self.state.total_vertical_force = force;
            warn!(force, ceiling, "chain tension ceiling exceeded");
            return Err(EngineError::Emergency(EmergencyCondition::TensionExceeded {
                tension: force,
                limit: ceiling,
            }));
        }

        let inertia = Self::chain_inertia(floaters, params);
        let sprocket_torque = force * d.sprocket_radius * d.sprocket_efficiency;
        let free = (self.state.angular_velocity + sprocket_torque / inertia * dt).max(0.0);

        let drive_torque = sprocket_torque * coupling.ratio * coupling.gearbox_efficiency;
        let (side, lock) = coupling.chain_side_speed(free / coupling.ratio, drive_torque, inertia, dt);
        let omega = side * coupling.ratio;

        self.state.tension = force.max(0.0);
        self.state.total_vertical_force = force;
        self.state.angular_velocity = omega;
        self.state.linear_speed = omega * d.sprocket_radius;
        self.state.angle = (self.state.angle + omega * dt).rem_euclid(TAU);
        self.state.locked_to_flywheel = lock;

        debug_assert!(self.state.tension >= 0.0 && self.state.tension <= ceiling);
        debug_assert!(self.state.angular_velocity >= 0.0);

        Ok(self.move_floaters(floaters, compressor, params, sim_time, dt))
    }

    fn move_floaters(
        &self,
        floaters: &mut [Floater],
        compressor: &mut Compressor,
        params: &RunParameters,
        sim_time: f64,
        dt: f64,
    ) -> FillActivity {
        let loop_length = 2.0 * params.fluid.tank_depth;
        let advance = self.state.linear_speed * dt * TAU / loop_length;
        let mut activity = FillActivity::default();

        for floater in floaters.iter_mut() {
            floater.place(
                floater.angle + advance,
                self.state.linear_speed,
                params.fluid.tank_depth,
            );
            if let Some(station) = floater.check_station() {
                let event = floater.on_station(station);
                if event == FillEvent::VentingInProgress && station == Station::Bottom {
                    debug!(floater = floater.id, "bottom station reached while venting, fill skipped");
                }
                activity.record(event);
            }
        }

        let started = compressor.service(floaters, &params.fluid, &params.pneumatics, sim_time);
        activity.fills_started += started.len() as u32;

        for floater in floaters.iter_mut() {
            let event = floater.advance_fill(dt, &params.fluid, &params.pneumatics);
            activity.record(event);
        }
        activity
    }

    pub fn reset(&mut self) {
        self.state = ChainState::default();
    }
}
