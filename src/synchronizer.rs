//! Post-tick consistency pass over floater state.
//!
//! After the mechanical and electrical stages have run, every floater's mass
//! is re-derived from its fill phase and its velocity from the chain speed.
//! Mismatches beyond tolerance are overwritten and recorded; they are
//! corrections, not errors. A non-finite expected value means the derivation
//! itself is broken and is reported as a physics instability.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::EngineError;
use crate::floater::Floater;

const MAX_CORRECTION_HISTORY: usize = 64;

pub const MASS_TOLERANCE_KG: f64 = 1e-6;
pub const VELOCITY_TOLERANCE_M_S: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectedField {
    Mass,
    Velocity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectionRecord {
    pub id: u32,
    pub tick_id: u64,
    pub floater: usize,
    pub field: CorrectedField,
    pub expected: f64,
    pub actual: f64,
}

#[derive(Debug, Clone)]
pub struct StateSynchronizer {
    history: Vec<CorrectionRecord, MAX_CORRECTION_HISTORY>,
    next_id: u32,
    total: u64,
}

impl Default for StateSynchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSynchronizer {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            next_id: 1,
            total: 0,
        }
    }

    /// Re-establish mass and velocity invariants. Returns corrections made.
    pub fn synchronize(
        &mut self,
        floaters: &mut [Floater],
        chain_linear_speed: f64,
        water_density: f64,
        tick_id: u64,
    ) -> Result<u32, EngineError> {
        let mut corrections = 0;

        for floater in floaters.iter_mut() {
            let expected_mass = floater.expected_mass(water_density);
            if !expected_mass.is_finite() {
                return Err(EngineError::PhysicsInstability {
                    signal: "floater_mass",
                    value: expected_mass,
                });
            }
            if !within(floater.effective_mass, expected_mass, MASS_TOLERANCE_KG) {
                self.record(tick_id, floater.id, CorrectedField::Mass, expected_mass, floater.effective_mass);
                floater.effective_mass = expected_mass;
                corrections += 1;
            }

            let expected_velocity = floater.side().sign() * chain_linear_speed;
            if !expected_velocity.is_finite() {
                return Err(EngineError::PhysicsInstability {
                    signal: "floater_velocity",
                    value: expected_velocity,
                });
            }
            if !within(floater.velocity, expected_velocity, VELOCITY_TOLERANCE_M_S) {
                self.record(tick_id, floater.id, CorrectedField::Velocity, expected_velocity, floater.velocity);
                floater.velocity = expected_velocity;
                corrections += 1;
            }
        }

        self.total += u64::from(corrections);
        Ok(corrections)
    }

    fn record(&mut self, tick_id: u64, floater: usize, field: CorrectedField, expected: f64, actual: f64) {
        debug!(tick_id, floater, ?field, expected, actual, "floater state corrected");

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.history.is_full() {
            self.history.remove(0);
        }
        let _ = self.history.push(CorrectionRecord {
            id,
            tick_id,
            floater,
            field,
            expected,
            actual,
        });
    }

    pub fn total_corrections(&self) -> u64 {
        self.total
    }

    pub fn get_history(&self) -> &[CorrectionRecord] {
        &self.history
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

// NaN never compares within tolerance, so corrupt values are always replaced.
fn within(actual: f64, expected: f64, tolerance: f64) -> bool {
    (actual - expected).abs() <= tolerance
}
