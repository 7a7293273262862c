//! Run parameters, defaults and validation.
//!
//! [`RunParameters`] is the input to `start()`. It is validated as a whole
//! before the engine leaves `Ready`; a rejected parameter set leaves the engine
//! untouched. A subset of fields can be changed while running through
//! [`RunParameters::with_parameter`], which validates the edited copy before it
//! is committed.

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

pub const MIN_FLOATERS: usize = 4;
pub const MAX_FLOATERS: usize = 64;

// Floater geometry (per unit)
const DEFAULT_FLOATER_COUNT: usize = 8;
const DEFAULT_FLOATER_VOLUME_M3: f64 = 0.3;
const DEFAULT_FLOATER_MASS_KG: f64 = 18.0;
const DEFAULT_FLOATER_AREA_M2: f64 = 0.1;
const DEFAULT_DRAG_COEFFICIENT: f64 = 0.8;

// Tank and fluid
const WATER_DENSITY_KG_M3: f64 = 1000.0;
const GRAVITY_M_S2: f64 = 9.81;
const DEFAULT_TANK_DEPTH_M: f64 = 10.0;
const ATMOSPHERIC_PRESSURE_PA: f64 = 101_325.0;

// Pneumatics
const DEFAULT_AIR_PRESSURE_PA: f64 = 400_000.0;
const DEFAULT_AIR_FLOW_COEFFICIENT_M3_S: f64 = 0.6;
const DEFAULT_VENT_RATE_PER_S: f64 = 1.0;
const DEFAULT_JET_COEFFICIENT_N_S_M3: f64 = 500.0;
const DEFAULT_PULSE_INTERVAL_S: f64 = 0.5;
const DEFAULT_INJECTION_WINDOW_RAD: f64 = core::f64::consts::FRAC_PI_4;

// Drivetrain
const DEFAULT_SPROCKET_RADIUS_M: f64 = 0.5;
const DEFAULT_SPROCKET_EFFICIENCY: f64 = 0.98;
const DEFAULT_SPROCKET_INERTIA_KG_M2: f64 = 2.0;
const DEFAULT_CHAIN_MASS_KG: f64 = 100.0;
const DEFAULT_GEARBOX_EFFICIENCY: f64 = 0.95;
const DEFAULT_GEAR_INDEX: usize = 2;
const DEFAULT_CLUTCH_THRESHOLD_RAD_S: f64 = 1.0;
const DEFAULT_FLYWHEEL_INERTIA_KG_M2: f64 = 50.0;
const DEFAULT_FLYWHEEL_FRICTION_NMS: f64 = 0.02;
const DEFAULT_DRIVE_TORQUE_SMOOTHING_S: f64 = 1.0;

// Electrical
const DEFAULT_RATED_POWER_W: f64 = 20_000.0;
const DEFAULT_GENERATOR_EFFICIENCY: f64 = 0.92;
const DEFAULT_LOAD_FACTOR: f64 = 0.5;
const DEFAULT_BOOTSTRAP_THRESHOLD_W: f64 = 2_000.0;
const DEFAULT_MIN_BRAKING_TORQUE_NM: f64 = 5.0;
const DEFAULT_RATED_SPEED_RAD_S: f64 = 150.0;
const DEFAULT_CONDITIONER_EFFICIENCY: f64 = 0.96;
const DEFAULT_MIN_INPUT_VOLTAGE_PU: f64 = 0.1;
const DEFAULT_MAX_INPUT_VOLTAGE_PU: f64 = 1.5;
const DEFAULT_GRID_FREQUENCY_HZ: f64 = 50.0;
const DEFAULT_FREQUENCY_TOLERANCE_HZ: f64 = 0.5;
const DEFAULT_MAX_THD: f64 = 0.08;
const DEFAULT_RECONNECT_DELAY_S: f64 = 2.0;

// Safety
const DEFAULT_MAX_CHAIN_TENSION_N: f64 = 50_000.0;
const DEFAULT_MAX_CHAIN_SPEED_M_S: f64 = 10.0;
const DEFAULT_MAX_FLYWHEEL_SPEED_RAD_S: f64 = 600.0;
const DEFAULT_INSTABILITY_WINDOW_TICKS: u64 = 50;
const DEFAULT_MAX_INSTABILITIES: u32 = 3;

// Timestep
const DEFAULT_DT_S: f64 = 0.05;
const DEFAULT_MIN_DT_S: f64 = 0.001;
const DEFAULT_MAX_DT_S: f64 = 0.1;
const DEFAULT_TICK_BUDGET_MS: f64 = 5.0;
const DEFAULT_PUBLISH_RATE_HZ: f64 = 30.0;
const MIN_PUBLISH_RATE_HZ: f64 = 0.01;
const MAX_PUBLISH_RATE_HZ: f64 = 1000.0;

// Fault injection
const DEFAULT_INJECTION_SEED: u64 = 0x1234_5678_9ABC_DEF0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FloaterParams {
    pub count: usize,
    pub volume: f64,
    pub empty_mass: f64,
    pub area: f64,
    pub drag_coefficient: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FluidParams {
    pub water_density: f64,
    pub gravity: f64,
    pub tank_depth: f64,
    pub atmospheric_pressure: f64,
}

impl FluidParams {
    /// Absolute hydrostatic pressure at `depth` metres below the surface.
    pub fn pressure_at_depth(&self, depth: f64) -> f64 {
        self.atmospheric_pressure + self.water_density * self.gravity * depth.max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PneumaticParams {
    /// Absolute supply pressure of the air compressor.
    pub air_pressure: f64,
    /// Injection flow (m³/s) at an unbounded pressure margin.
    pub flow_coefficient: f64,
    /// Fraction of the hull flooded per second while venting.
    pub vent_rate: f64,
    /// Upward jet thrust per unit injection flow (N per m³/s).
    pub jet_coefficient: f64,
    pub gas_expansion: bool,
    /// Minimum time between compressor pulses.
    pub pulse_interval: f64,
    /// Angle past the bottom station within which a waiting floater may still be filled.
    pub injection_window: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrivetrainParams {
    pub sprocket_radius: f64,
    pub sprocket_efficiency: f64,
    pub sprocket_inertia: f64,
    pub chain_mass: f64,
    /// Selectable gear ratios; `speed_out = speed_in / ratio`.
    pub gear_ratios: Vec<f64>,
    pub gear_index: usize,
    pub gearbox_efficiency: f64,
    pub clutch_engagement_threshold: f64,
    pub flywheel_inertia: f64,
    pub flywheel_friction: f64,
    /// Time constant of the delivered-torque filter seen by the generator.
    pub drive_torque_smoothing: f64,
}

impl DrivetrainParams {
    pub fn active_ratio(&self) -> f64 {
        self.gear_ratios.get(self.gear_index).copied().unwrap_or(f64::NAN)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectricalParams {
    /// `false` runs the machine mechanical-only.
    pub enabled: bool,
    pub rated_power: f64,
    pub generator_efficiency: f64,
    pub load_factor: f64,
    pub bootstrap_power_threshold: f64,
    pub min_braking_torque: f64,
    pub rated_speed: f64,
    pub conditioner_efficiency: f64,
    pub min_input_voltage_pu: f64,
    pub max_input_voltage_pu: f64,
    pub nominal_frequency: f64,
    /// Measured grid frequency; deviating from nominal trips grid protection.
    pub grid_frequency: f64,
    pub frequency_tolerance: f64,
    pub max_thd: f64,
    pub reconnect_delay: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyParams {
    pub max_chain_tension: f64,
    /// Linear chain speed limit, m/s.
    pub max_chain_speed: f64,
    /// Plausibility bound used by the stability check.
    pub max_flywheel_speed: f64,
    pub instability_window: u64,
    pub max_instabilities: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimestepParams {
    pub dt: f64,
    pub min_dt: f64,
    pub max_dt: f64,
    pub adaptive: bool,
    pub target_tick_budget_ms: f64,
    pub publish_rate_hz: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InjectionParams {
    pub enabled: bool,
    pub seed: u64,
    /// Chance per floater per tick of a random mass perturbation.
    pub perturbation_rate_percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub floaters: FloaterParams,
    pub fluid: FluidParams,
    pub pneumatics: PneumaticParams,
    pub drivetrain: DrivetrainParams,
    pub electrical: ElectricalParams,
    pub safety: SafetyParams,
    pub timestep: TimestepParams,
    pub injection: InjectionParams,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            floaters: FloaterParams {
                count: DEFAULT_FLOATER_COUNT,
                volume: DEFAULT_FLOATER_VOLUME_M3,
                empty_mass: DEFAULT_FLOATER_MASS_KG,
                area: DEFAULT_FLOATER_AREA_M2,
                drag_coefficient: DEFAULT_DRAG_COEFFICIENT,
            },
            fluid: FluidParams {
                water_density: WATER_DENSITY_KG_M3,
                gravity: GRAVITY_M_S2,
                tank_depth: DEFAULT_TANK_DEPTH_M,
                atmospheric_pressure: ATMOSPHERIC_PRESSURE_PA,
            },
            pneumatics: PneumaticParams {
                air_pressure: DEFAULT_AIR_PRESSURE_PA,
                flow_coefficient: DEFAULT_AIR_FLOW_COEFFICIENT_M3_S,
                vent_rate: DEFAULT_VENT_RATE_PER_S,
                jet_coefficient: DEFAULT_JET_COEFFICIENT_N_S_M3,
                gas_expansion: true,
                pulse_interval: DEFAULT_PULSE_INTERVAL_S,
                injection_window: DEFAULT_INJECTION_WINDOW_RAD,
            },
            drivetrain: DrivetrainParams {
                sprocket_radius: DEFAULT_SPROCKET_RADIUS_M,
                sprocket_efficiency: DEFAULT_SPROCKET_EFFICIENCY,
                sprocket_inertia: DEFAULT_SPROCKET_INERTIA_KG_M2,
                chain_mass: DEFAULT_CHAIN_MASS_KG,
                gear_ratios: vec![0.25, 0.125, 0.0625],
                gear_index: DEFAULT_GEAR_INDEX,
                gearbox_efficiency: DEFAULT_GEARBOX_EFFICIENCY,
                clutch_engagement_threshold: DEFAULT_CLUTCH_THRESHOLD_RAD_S,
                flywheel_inertia: DEFAULT_FLYWHEEL_INERTIA_KG_M2,
                flywheel_friction: DEFAULT_FLYWHEEL_FRICTION_NMS,
                drive_torque_smoothing: DEFAULT_DRIVE_TORQUE_SMOOTHING_S,
            },
            electrical: ElectricalParams {
                enabled: true,
                rated_power: DEFAULT_RATED_POWER_W,
                generator_efficiency: DEFAULT_GENERATOR_EFFICIENCY,
                load_factor: DEFAULT_LOAD_FACTOR,
                bootstrap_power_threshold: DEFAULT_BOOTSTRAP_THRESHOLD_W,
                min_braking_torque: DEFAULT_MIN_BRAKING_TORQUE_NM,
                rated_speed: DEFAULT_RATED_SPEED_RAD_S,
                conditioner_efficiency: DEFAULT_CONDITIONER_EFFICIENCY,
                min_input_voltage_pu: DEFAULT_MIN_INPUT_VOLTAGE_PU,
                max_input_voltage_pu: DEFAULT_MAX_INPUT_VOLTAGE_PU,
                nominal_frequency: DEFAULT_GRID_FREQUENCY_HZ,
                grid_frequency: DEFAULT_GRID_FREQUENCY_HZ,
                frequency_tolerance: DEFAULT_FREQUENCY_TOLERANCE_HZ,
                max_thd: DEFAULT_MAX_THD,
                reconnect_delay: DEFAULT_RECONNECT_DELAY_S,
            },
            safety: SafetyParams {
                max_chain_tension: DEFAULT_MAX_CHAIN_TENSION_N,
                max_chain_speed: DEFAULT_MAX_CHAIN_SPEED_M_S,
                max_flywheel_speed: DEFAULT_MAX_FLYWHEEL_SPEED_RAD_S,
                instability_window: DEFAULT_INSTABILITY_WINDOW_TICKS,
                max_instabilities: DEFAULT_MAX_INSTABILITIES,
            },
            timestep: TimestepParams {
                dt: DEFAULT_DT_S,
                min_dt: DEFAULT_MIN_DT_S,
                max_dt: DEFAULT_MAX_DT_S,
                adaptive: true,
                target_tick_budget_ms: DEFAULT_TICK_BUDGET_MS,
                publish_rate_hz: DEFAULT_PUBLISH_RATE_HZ,
            },
            injection: InjectionParams {
                enabled: false,
                seed: DEFAULT_INJECTION_SEED,
                perturbation_rate_percent: 0.0,
            },
        }
    }
}

fn finite(name: &str, value: f64) -> Result<f64, ValidationError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ValidationError::NotFinite {
            name: name.to_string(),
        })
    }
}

fn positive(name: &str, value: f64) -> Result<(), ValidationError> {
    if finite(name, value)? > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            name: name.to_string(),
            value,
            reason: "must be positive".to_string(),
        })
    }
}

fn non_negative(name: &str, value: f64) -> Result<(), ValidationError> {
    if finite(name, value)? >= 0.0 {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            name: name.to_string(),
            value,
            reason: "must not be negative".to_string(),
        })
    }
}

fn within(name: &str, value: f64, min: f64, max: f64) -> Result<(), ValidationError> {
    if (min..=max).contains(&finite(name, value)?) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            name: name.to_string(),
            value,
            reason: format!("must be within [{min}, {max}]"),
        })
    }
}

fn flag(name: &str, value: f64) -> Result<bool, ValidationError> {
    if value == 0.0 || value == 1.0 {
        Ok(value == 1.0)
    } else {
        Err(ValidationError::OutOfRange {
            name: name.to_string(),
            value,
            reason: "must be 0 or 1".to_string(),
        })
    }
}

impl RunParameters {
    /// Check every field; returns the first violation found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let f = &self.floaters;
        if f.count % 2 != 0 || !(MIN_FLOATERS..=MAX_FLOATERS).contains(&f.count) {
            return Err(ValidationError::FloaterCount {
                count: f.count,
                min: MIN_FLOATERS,
                max: MAX_FLOATERS,
            });
        }
        positive("floaters.volume", f.volume)?;
        positive("floaters.empty_mass", f.empty_mass)?;
        positive("floaters.area", f.area)?;
        non_negative("floaters.drag_coefficient", f.drag_coefficient)?;

        let fl = &self.fluid;
        positive("fluid.water_density", fl.water_density)?;
        positive("fluid.gravity", fl.gravity)?;
        positive("fluid.tank_depth", fl.tank_depth)?;
        positive("fluid.atmospheric_pressure", fl.atmospheric_pressure)?;

        let p = &self.pneumatics;
        positive("pneumatics.air_pressure", p.air_pressure)?;
        let required = fl.pressure_at_depth(fl.tank_depth);
        if p.air_pressure <= required {
            return Err(ValidationError::InsufficientAirPressure {
                air_pressure: p.air_pressure,
                required,
            });
        }
        positive("pneumatics.flow_coefficient", p.flow_coefficient)?;
        positive("pneumatics.vent_rate", p.vent_rate)?;
        non_negative("pneumatics.jet_coefficient", p.jet_coefficient)?;
        non_negative("pneumatics.pulse_interval", p.pulse_interval)?;
        within(
            "pneumatics.injection_window",
            p.injection_window,
            0.0,
            core::f64::consts::PI,
        )?;

        let d = &self.drivetrain;
        positive("drivetrain.sprocket_radius", d.sprocket_radius)?;
        within("drivetrain.sprocket_efficiency", d.sprocket_efficiency, 0.01, 1.0)?;
        non_negative("drivetrain.sprocket_inertia", d.sprocket_inertia)?;
        non_negative("drivetrain.chain_mass", d.chain_mass)?;
        if d.gear_index >= d.gear_ratios.len() {
            return Err(ValidationError::GearIndex {
                index: d.gear_index,
                available: d.gear_ratios.len(),
            });
        }
        for ratio in &d.gear_ratios {
            positive("drivetrain.gear_ratios", *ratio)?;
        }
        within("drivetrain.gearbox_efficiency", d.gearbox_efficiency, 0.01, 1.0)?;
        positive(
            "drivetrain.clutch_engagement_threshold",
            d.clutch_engagement_threshold,
        )?;
        positive("drivetrain.flywheel_inertia", d.flywheel_inertia)?;
        non_negative("drivetrain.flywheel_friction", d.flywheel_friction)?;
        positive("drivetrain.drive_torque_smoothing", d.drive_torque_smoothing)?;

        let e = &self.electrical;
        positive("electrical.rated_power", e.rated_power)?;
        within("electrical.generator_efficiency", e.generator_efficiency, 0.01, 1.0)?;
        within("electrical.load_factor", e.load_factor, 0.0, 1.0)?;
        positive(
            "electrical.bootstrap_power_threshold",
            e.bootstrap_power_threshold,
        )?;
        non_negative("electrical.min_braking_torque", e.min_braking_torque)?;
        positive("electrical.rated_speed", e.rated_speed)?;
        within(
            "electrical.conditioner_efficiency",
            e.conditioner_efficiency,
            0.01,
            1.0,
        )?;
        non_negative("electrical.min_input_voltage_pu", e.min_input_voltage_pu)?;
        if finite("electrical.max_input_voltage_pu", e.max_input_voltage_pu)?
            <= e.min_input_voltage_pu
        {
            return Err(ValidationError::OutOfRange {
                name: "electrical.max_input_voltage_pu".to_string(),
                value: e.max_input_voltage_pu,
                reason: "must exceed min_input_voltage_pu".to_string(),
            });
        }
        positive("electrical.nominal_frequency", e.nominal_frequency)?;
        positive("electrical.grid_frequency", e.grid_frequency)?;
        positive("electrical.frequency_tolerance", e.frequency_tolerance)?;
        within("electrical.max_thd", e.max_thd, 0.0, 1.0)?;
        non_negative("electrical.reconnect_delay", e.reconnect_delay)?;

        let s = &self.safety;
        positive("safety.max_chain_tension", s.max_chain_tension)?;
        positive("safety.max_chain_speed", s.max_chain_speed)?;
        positive("safety.max_flywheel_speed", s.max_flywheel_speed)?;
        if s.instability_window == 0 || s.max_instabilities == 0 {
            return Err(ValidationError::OutOfRange {
                name: "safety.instability_window".to_string(),
                value: s.instability_window as f64,
                reason: "window and max_instabilities must be at least 1".to_string(),
            });
        }

        let t = &self.timestep;
        finite("timestep.min_dt", t.min_dt)?;
        finite("timestep.max_dt", t.max_dt)?;
        if t.min_dt <= 0.0 || t.min_dt > t.max_dt {
            return Err(ValidationError::TimestepBounds {
                min_dt: t.min_dt,
                max_dt: t.max_dt,
            });
        }
        within("timestep.dt", t.dt, t.min_dt, t.max_dt)?;
        positive("timestep.target_tick_budget_ms", t.target_tick_budget_ms)?;
        within(
            "timestep.publish_rate_hz",
            t.publish_rate_hz,
            MIN_PUBLISH_RATE_HZ,
            MAX_PUBLISH_RATE_HZ,
        )?;

        within(
            "injection.perturbation_rate_percent",
            self.injection.perturbation_rate_percent,
            0.0,
            100.0,
        )?;

        Ok(())
    }

    /// Copy of these parameters with one runtime-adjustable field changed.
    ///
    /// The copy is validated as a whole, so a change that would break a
    /// cross-field rule (for example `min_dt > max_dt`) is rejected.
    pub fn with_parameter(&self, key: &str, value: f64) -> Result<Self, ValidationError> {
        let mut next = self.clone();
        finite(key, value)?;
        match key {
            "load_factor" => next.electrical.load_factor = value,
            "air_pressure" => next.pneumatics.air_pressure = value,
            "pulse_interval" => next.pneumatics.pulse_interval = value,
            "vent_rate" => next.pneumatics.vent_rate = value,
            "gas_expansion" => next.pneumatics.gas_expansion = flag(key, value)?,
            "max_chain_tension" => next.safety.max_chain_tension = value,
            "max_chain_speed" => next.safety.max_chain_speed = value,
            "min_dt" => {
                next.timestep.min_dt = value;
                next.timestep.dt = next.timestep.dt.max(value);
            }
            "max_dt" => {
                next.timestep.max_dt = value;
                next.timestep.dt = next.timestep.dt.min(value);
            }
            "adaptive_timestep" => next.timestep.adaptive = flag(key, value)?,
            "target_tick_budget_ms" => next.timestep.target_tick_budget_ms = value,
            "publish_rate_hz" => next.timestep.publish_rate_hz = value,
            "gear_index" => {
                if value < 0.0 || value.fract() != 0.0 {
                    return Err(ValidationError::OutOfRange {
                        name: key.to_string(),
                        value,
                        reason: "must be a non-negative integer".to_string(),
                    });
                }
                next.drivetrain.gear_index = value as usize;
            }
            "clutch_engagement_threshold" => {
                next.drivetrain.clutch_engagement_threshold = value;
            }
            "grid_frequency" => next.electrical.grid_frequency = value,
            "max_thd" => next.electrical.max_thd = value,
            "electrical_enabled" => next.electrical.enabled = flag(key, value)?,
            _ => return Err(ValidationError::UnknownParameter(key.to_string())),
        }
        next.validate()?;
        Ok(next)
    }
}
