//! # Buoyancy Generator Simulator
//!
//! A real-time simulation of a chain-driven buoyancy power generator: a loop
//! of floaters, alternately air- and water-filled, drives a chain through a
//! sprocket, gearbox, one-way clutch and flywheel into a generator whose
//! load feeds back as braking torque on the next tick.
//!
//! ## Features
//!
//! - **Per-tick pipeline**: floater forces, chain aggregation, drivetrain and
//!   electrical stages in a fixed order with one-tick load feedback
//! - **State consistency**: a synchronizer re-derives floater mass and
//!   velocity after every tick and counts corrections
//! - **Adaptive timestep**: tick profiling, stability checks and rollback
//! - **Safety management**: tension and speed limits, escalation of repeated
//!   instabilities, bounded event history
//! - **Command scheduling**: commands tagged with a simulation time
//! - **Threaded runner**: bounded command channel in, snapshot broadcast out
//!
//! ## Quick Start
//!
//! ```rust
//! use buoysim::{Engine, EngineStatus, RunParameters};
//!
//! let mut engine = Engine::with_parameters(RunParameters::default()).unwrap();
//! let snapshot = engine.step(0.1).unwrap();
//! assert_eq!(snapshot.status, EngineStatus::Running);
//! assert!(snapshot.chain_tension >= 0.0);
//! ```
//!
//! ## Architecture
//!
//! - [`floater`] and [`chain`] - force model and chain aggregation
//! - [`drivetrain`] - sprocket, gearbox, clutch and flywheel stages
//! - [`electrical`] - generator, power conditioning and grid interface
//! - [`synchronizer`] - post-tick consistency pass
//! - [`optimizer`] - timestep adaptation and stability checks
//! - [`engine`] - lifecycle and tick sequencing
//! - [`runner`] - dedicated simulation thread
//! - [`protocol`] - JSON wire protocol for the TCP server

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

pub mod chain;
pub mod command;
pub mod config;
pub mod drivetrain;
pub mod electrical;
pub mod engine;
pub mod error;
pub mod floater;
pub mod injection;
pub mod optimizer;
pub mod pneumatics;
pub mod protocol;
pub mod runner;
pub mod safety;
pub mod scheduler;
pub mod snapshot;
pub mod stage;
pub mod synchronizer;

// Re-export main public types for convenience
pub use command::Command;
pub use config::RunParameters;
pub use engine::{Engine, EngineStatus};
pub use error::{CommandError, EmergencyCondition, EngineError, StageFault, SubmitError, ValidationError};
pub use injection::Injection;
pub use runner::{CommandOutcome, RunnerOptions, SimulationRunner};
pub use snapshot::SimulationSnapshot;
