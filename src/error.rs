//! Error taxonomy for the simulation core.
//!
//! Four kinds of failure cross the engine boundary and each has a fixed
//! policy:
//!
//! | Kind | Policy |
//! |---|---|
//! | [`ValidationError`] | surfaced to the caller, state unchanged |
//! | [`EngineError::ComponentUnavailable`] | absorbed, counted, logged once |
//! | [`EngineError::PhysicsInstability`] | absorbed by rollback, escalates when repeated |
//! | [`EngineError::Emergency`] | surfaced, engine latches into `Error` |

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineStatus;
use crate::scheduler::ScheduleError;

/// Malformed or out-of-range run parameters.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("floater count {count} must be even and within {min}..={max}")]
    FloaterCount { count: usize, min: usize, max: usize },

    #[error("parameter `{name}` = {value} is out of range ({reason})")]
    OutOfRange {
        name: String,
        value: f64,
        reason: String,
    },

    #[error("parameter `{name}` is not finite")]
    NotFinite { name: String },

    #[error("air pressure {air_pressure} Pa cannot overcome hydrostatic pressure {required} Pa at the bottom station")]
    InsufficientAirPressure { air_pressure: f64, required: f64 },

    #[error("timestep bounds invalid: min_dt {min_dt} must be positive and not exceed max_dt {max_dt}")]
    TimestepBounds { min_dt: f64, max_dt: f64 },

    #[error("gear index {index} out of range for {available} configured ratios")]
    GearIndex { index: usize, available: usize },

    #[error("unknown parameter key `{0}`")]
    UnknownParameter(String),
}

/// Conditions that latch the engine into the `Error` state.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum EmergencyCondition {
    #[error("chain tension {tension:.1} N exceeds safety ceiling {limit:.1} N")]
    TensionExceeded { tension: f64, limit: f64 },

    #[error("chain speed {speed:.3} m/s exceeds safety limit {limit:.3} m/s")]
    ChainOverspeed { speed: f64, limit: f64 },

    #[error("{count} instabilities within {window} ticks")]
    RepeatedInstability { count: u32, window: u64 },
}

/// Errors returned by [`Engine`](crate::engine::Engine) operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("component unavailable: {component}")]
    ComponentUnavailable { component: &'static str },

    #[error("physics instability in {signal}: {value}")]
    PhysicsInstability { signal: &'static str, value: f64 },

    #[error("emergency condition: {0}")]
    Emergency(EmergencyCondition),

    #[error("cannot {operation} while {status:?}")]
    InvalidTransition {
        operation: &'static str,
        status: EngineStatus,
    },
}

/// Reason a pipeline stage substituted a zero contribution for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Error, Serialize, Deserialize)]
pub enum StageFault {
    #[error("non-finite input")]
    NonFiniteInput,

    #[error("input out of range")]
    OutOfRange,
}

/// Why a command delivered to the simulation thread was not carried out.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("schedule rejected: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Errors submitting commands to a [`SimulationRunner`](crate::runner::SimulationRunner).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("command channel full")]
    ChannelFull,

    #[error("simulation thread has shut down")]
    Shutdown,
}
