//! Bottom-station air compressor.
//!
//! The compressor delivers one injection per pulse and needs `pulse_interval`
//! seconds to recharge. Floaters that reach the bottom station while it is
//! recharging wait inside the injection window; a floater that leaves the
//! window unfilled misses its lap.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{FluidParams, PneumaticParams, MAX_FLOATERS};
use crate::floater::{ChainSide, FillPhase, Floater};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressorState {
    pub last_pulse_time: Option<f64>,
    pub pulses: u64,
    pub missed_pulses: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Compressor {
    state: CompressorState,
}

impl Compressor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self, now: f64, pneumatics: &PneumaticParams) -> bool {
        match self.state.last_pulse_time {
            Some(last) => now - last >= pneumatics.pulse_interval,
            None => true,
        }
    }

    /// Fill or drop floaters waiting at the bottom station.
    ///
    /// Waiting floaters are served nearest-to-station first. Returns the ids
    /// of floaters that started filling.
    pub fn service(
        &mut self,
        floaters: &mut [Floater],
        fluid: &FluidParams,
        pneumatics: &PneumaticParams,
        now: f64,
    ) -> heapless::Vec<usize, MAX_FLOATERS> {
        let mut started = heapless::Vec::new();

        // Drop floaters that have left the window first so they are not filled late.
        for floater in floaters.iter_mut().filter(|f| f.is_awaiting_air()) {
            if floater.side() == ChainSide::Descending || floater.angle > pneumatics.injection_window {
                floater.abandon_fill();
                self.state.missed_pulses += 1;
                debug!(floater = floater.id, "floater left injection window unfilled");
            }
        }

        while self.is_ready(now, pneumatics) {
            let Some(index) = nearest(floaters, |f| f.is_awaiting_air()) else {
                break;
            };
            if floaters[index].start_filling(fluid) {
                self.fire(now);
                let _ = started.push(floaters[index].id);
            } else {
                floaters[index].abandon_fill();
            }
        }
        started
    }

    /// Fire immediately, ignoring recharge, into the nearest eligible floater.
    ///
    /// Eligible floaters are those waiting for air or still water-filled
    /// inside the injection window. Returns the id of the floater filled.
    pub fn trigger_pulse(
        &mut self,
        floaters: &mut [Floater],
        fluid: &FluidParams,
        pneumatics: &PneumaticParams,
        now: f64,
    ) -> Option<usize> {
        let index = nearest(floaters, |f| f.is_awaiting_air()).or_else(|| {
            nearest(floaters, |f| {
                f.fill_phase == FillPhase::Heavy
                    && f.side() == ChainSide::Ascending
                    && f.angle <= pneumatics.injection_window
            })
        })?;

        if floaters[index].start_filling(fluid) {
            self.fire(now);
            Some(floaters[index].id)
        } else {
            None
        }
    }

    fn fire(&mut self, now: f64) {
        self.state.last_pulse_time = Some(now);
        self.state.pulses += 1;
    }

    pub fn get_state(&self) -> CompressorState {
        self.state.clone()
    }
}

/// Index of the matching floater with the smallest loop angle.
fn nearest(floaters: &[Floater], mut predicate: impl FnMut(&Floater) -> bool) -> Option<usize> {
    floaters
        .iter()
        .enumerate()
        .filter(|(_, f)| predicate(f))
        .min_by(|(_, a), (_, b)| a.angle.total_cmp(&b.angle))
        .map(|(i, _)| i)
}
