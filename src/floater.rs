//! Floater force model and fill-phase state machine.
//!
//! Floaters ride a closed chain loop inside the tank. The loop is described
//! by a single angle `θ ∈ [0, 2π)`: the ascending run covers `[0, π)` from the
//! bottom station (`θ = 0`) to the top station (`θ = π`), the descending run
//! covers `[π, 2π)` back down. Height above the tank floor is linear in `θ` on
//! each run.
//!
//! The fill cycle is air-up / water-down:
//!
//! ```text
//!   bottom station            injection complete
//! Heavy ──────────────▶ Filling ───────────────▶ Light
//!   ▲                                              │
//!   │ flooded                         top station   │
//!   └──────────────── Venting ◀────────────────────┘
//! ```
//!
//! Phase transitions are edge-triggered: each floater remembers which station
//! it expects next, so lingering at a boundary cannot re-trigger it, and a
//! floater sitting exactly on a station transitions on the tick it gets there.

use core::f64::consts::{PI, TAU};

use serde::{Deserialize, Serialize};

use crate::config::{FloaterParams, FluidParams, PneumaticParams};

/// Mass tolerance below which a floater is considered fully drained/flooded.
const FILL_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillPhase {
    /// Hull full of air, buoyant.
    Light,
    /// Air being injected, water being expelled.
    Filling,
    /// Hull full of water, sinking.
    Heavy,
    /// Air vented, water flooding in.
    Venting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Station {
    Bottom,
    Top,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainSide {
    Ascending,
    Descending,
}

impl ChainSide {
    pub fn of(angle: f64) -> Self {
        if angle < PI {
            ChainSide::Ascending
        } else {
            ChainSide::Descending
        }
    }

    /// Sign of vertical travel for a positive chain speed.
    pub fn sign(self) -> f64 {
        match self {
            ChainSide::Ascending => 1.0,
            ChainSide::Descending => -1.0,
        }
    }
}

/// Vertical force breakdown for one floater, upward positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FloaterForces {
    pub buoyant: f64,
    pub weight: f64,
    /// Signed: opposes the direction of travel.
    pub drag: f64,
    pub jet: f64,
    pub net: f64,
}

/// What happened to a floater's fill state during a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillEvent {
    None,
    /// Reached the bottom station and is waiting for air.
    AwaitingAir,
    /// Reached the bottom station while still venting.
    VentingInProgress,
    FillStarted,
    FillCompleted,
    VentStarted,
    VentCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Floater {
    pub id: usize,
    pub volume: f64,
    pub empty_mass: f64,
    pub area: f64,
    pub drag_coefficient: f64,
    pub fill_phase: FillPhase,
    /// Fraction of the hull volume occupied by water, `[0, 1]`.
    pub water_fill_fraction: f64,
    /// Loop angle, `[0, 2π)`.
    pub angle: f64,
    /// Height above the tank floor, m.
    pub position: f64,
    /// Vertical velocity, m/s, upward positive.
    pub velocity: f64,
    pub effective_mass: f64,
    /// Current air injection flow while filling, m³/s.
    pub injection_flow: f64,
    next_station: Station,
    awaiting_air: bool,
    /// Absolute pressure the air pocket was last equalised at.
    air_reference_pressure: f64,
}

impl Floater {
    /// Place a floater at `angle` on the loop, filled for the run it is on.
    pub fn new(
        id: usize,
        params: &FloaterParams,
        angle: f64,
        fluid: &FluidParams,
    ) -> Self {
        let angle = angle.rem_euclid(TAU);
        // A floater exactly on the bottom station has just arrived there.
        let ascending = angle > 0.0 && angle < PI;
        let (fill_phase, water_fill_fraction, next_station) = if ascending {
            (FillPhase::Light, 0.0, Station::Top)
        } else {
            (FillPhase::Heavy, 1.0, Station::Bottom)
        };

        let mut floater = Self {
            id,
            volume: params.volume,
            empty_mass: params.empty_mass,
            area: params.area,
            drag_coefficient: params.drag_coefficient,
            fill_phase,
            water_fill_fraction,
            angle,
            position: 0.0,
            velocity: 0.0,
            effective_mass: 0.0,
            injection_flow: 0.0,
            next_station,
            awaiting_air: false,
            air_reference_pressure: fluid.atmospheric_pressure,
        };
        floater.position = floater.height(fluid.tank_depth);
        floater.air_reference_pressure = fluid.pressure_at_depth(floater.depth(fluid.tank_depth));
        floater.effective_mass = floater.expected_mass(fluid.water_density);
        floater
    }

    pub fn side(&self) -> ChainSide {
        ChainSide::of(self.angle)
    }

    pub fn next_station(&self) -> Station {
        self.next_station
    }

    pub fn is_awaiting_air(&self) -> bool {
        self.awaiting_air
    }

    /// Height above the tank floor for the current loop angle.
    pub fn height(&self, tank_depth: f64) -> f64 {
        let t = self.angle / PI;
        match self.side() {
            ChainSide::Ascending => tank_depth * t,
            ChainSide::Descending => tank_depth * (2.0 - t),
        }
    }

    pub fn depth(&self, tank_depth: f64) -> f64 {
        (tank_depth - self.height(tank_depth)).max(0.0)
    }

    /// Mass implied by the fill phase and water fraction.
    pub fn expected_mass(&self, water_density: f64) -> f64 {
        match self.fill_phase {
            FillPhase::Light => self.empty_mass,
            FillPhase::Filling | FillPhase::Heavy | FillPhase::Venting => {
                self.empty_mass + self.volume * water_density * self.water_fill_fraction
            }
        }
    }

    /// Water volume the hull displaces.
    ///
    /// The rigid hull always displaces its full volume. Contained water is
    /// carried in `effective_mass`, so the fill phase and the gas expansion
    /// state reach the net force through the weight term.
    pub fn displaced_volume(&self) -> f64 {
        self.volume
    }

    /// Upward jet thrust from injection, zero outside `Filling`.
    pub fn jet_force(&self, pneumatics: &PneumaticParams) -> f64 {
        match self.fill_phase {
            FillPhase::Filling => pneumatics.jet_coefficient * self.injection_flow,
            _ => 0.0,
        }
    }

    pub fn compute_forces(&self, fluid: &FluidParams, pneumatics: &PneumaticParams) -> FloaterForces {
        let buoyant = fluid.water_density * self.displaced_volume() * fluid.gravity;
        let weight = self.effective_mass * fluid.gravity;
        let drag_magnitude = 0.5
            * self.drag_coefficient
            * fluid.water_density
            * self.area
            * self.velocity
            * self.velocity;
        // Magnitude is already zero at rest.
        let drag = drag_magnitude * self.velocity.signum();
        let jet = self.jet_force(pneumatics);

        FloaterForces {
            buoyant,
            weight,
            drag,
            jet,
            net: buoyant - weight - drag + jet,
        }
    }

    /// Move the floater to a new loop angle and update its kinematics.
    pub fn place(&mut self, angle: f64, chain_linear_speed: f64, tank_depth: f64) {
        self.angle = angle.rem_euclid(TAU);
        self.position = self.height(tank_depth);
        self.velocity = self.side().sign() * chain_linear_speed;
    }

    /// Check whether the floater reached the station it expects.
    ///
    /// Returns the station at most once per crossing.
    pub fn check_station(&mut self) -> Option<Station> {
        let reached = match (self.next_station, self.side()) {
            (Station::Top, ChainSide::Descending) => Some(Station::Top),
            (Station::Bottom, ChainSide::Ascending) => Some(Station::Bottom),
            _ => None,
        };
        if let Some(station) = reached {
            self.next_station = match station {
                Station::Top => Station::Bottom,
                Station::Bottom => Station::Top,
            };
        }
        reached
    }

    /// Apply the phase change that a station crossing triggers.
    pub fn on_station(&mut self, station: Station) -> FillEvent {
        match (station, self.fill_phase) {
            (Station::Bottom, FillPhase::Venting) => FillEvent::VentingInProgress,
            (Station::Bottom, FillPhase::Heavy) => {
                self.awaiting_air = true;
                FillEvent::AwaitingAir
            }
            (Station::Top, FillPhase::Light | FillPhase::Filling) => {
                self.awaiting_air = false;
                self.injection_flow = 0.0;
                self.fill_phase = FillPhase::Venting;
                FillEvent::VentStarted
            }
            _ => FillEvent::None,
        }
    }

    /// Begin air injection. Only a water-bearing floater can be filled.
    pub fn start_filling(&mut self, fluid: &FluidParams) -> bool {
        if !matches!(self.fill_phase, FillPhase::Heavy) {
            return false;
        }
        self.awaiting_air = false;
        self.fill_phase = FillPhase::Filling;
        self.air_reference_pressure = fluid.pressure_at_depth(self.depth(fluid.tank_depth));
        true
    }

    /// Give up waiting for air this lap.
    pub fn abandon_fill(&mut self) {
        self.awaiting_air = false;
    }

    /// Advance injection, venting and gas expansion by `dt`.
    ///
    /// Mass is adjusted by the change in contained water only; it is not
    /// recomputed from the phase, so external drift survives until the
    /// synchronizer pass re-establishes it.
    pub fn advance_fill(
        &mut self,
        dt: f64,
        fluid: &FluidParams,
        pneumatics: &PneumaticParams,
    ) -> FillEvent {
        let before = self.water_fill_fraction;
        let local_pressure = fluid.pressure_at_depth(self.depth(fluid.tank_depth));
        let mut event = FillEvent::None;

        match self.fill_phase {
            FillPhase::Filling => {
                if pneumatics.gas_expansion && self.air_reference_pressure > 0.0 {
                    // Boyle: the pocket grows as the floater rises.
                    let air = 1.0 - self.water_fill_fraction;
                    let expanded = (air * self.air_reference_pressure / local_pressure).min(1.0);
                    self.water_fill_fraction = 1.0 - expanded.max(air);
                }
                self.air_reference_pressure = local_pressure;

                let margin = ((pneumatics.air_pressure - local_pressure) / pneumatics.air_pressure).max(0.0);
                self.injection_flow = pneumatics.flow_coefficient * margin;
                self.water_fill_fraction -= self.injection_flow * dt / self.volume;

                if self.water_fill_fraction <= FILL_EPSILON {
                    self.water_fill_fraction = 0.0;
                    self.injection_flow = 0.0;
                    self.fill_phase = FillPhase::Light;
                    event = FillEvent::FillCompleted;
                }
            }
            FillPhase::Venting => {
                self.water_fill_fraction += pneumatics.vent_rate * dt;
                if self.water_fill_fraction >= 1.0 - FILL_EPSILON {
                    self.water_fill_fraction = 1.0;
                    self.fill_phase = FillPhase::Heavy;
                    event = FillEvent::VentCompleted;
                }
            }
            FillPhase::Light | FillPhase::Heavy => {}
        }

        self.effective_mass += self.volume * fluid.water_density * (self.water_fill_fraction - before);
        event
    }
}
