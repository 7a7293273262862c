use heapless::{Deque, Vec};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::chain::ChainState;
use crate::config::SafetyParams;
use crate::error::EmergencyCondition;

const MAX_SAFETY_EVENTS: usize = 32;
const MAX_TRACKED_INSTABILITIES: usize = 64;

// Fraction of a limit at which a warning is raised
const WARNING_FRACTION: f64 = 0.8;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SafetyLevel {
    #[default]
    Normal,
    Caution,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyEvent {
    TensionHigh,
    TensionExceeded,
    ChainSpeedHigh,
    ChainOverspeed,
    PhysicsInstability,
    RepeatedInstability,
    ComponentUnavailable,
    GridTrip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetySource {
    Chain,
    Drivetrain,
    Electrical,
    Optimizer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyEventRecord {
    pub event: SafetyEvent,
    pub tick_id: u64,
    pub sim_time: f64,
    pub level: SafetyLevel,
    pub source: SafetySource,
    pub resolved: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafetyState {
    pub safety_level: SafetyLevel,
    pub active_events: u8,
    pub emergency_latched: bool,
    pub emergency_count: u32,
    pub instabilities_in_window: u32,
}

/// Threshold monitoring and escalation for the running machine.
///
/// Keeps a bounded event history. Tension and speed breaches and repeated
/// instabilities escalate to an [`EmergencyCondition`], which latches until
/// [`SafetyManager::reset`].
#[derive(Debug, Clone)]
pub struct SafetyManager {
    state: SafetyState,
    event_history: Vec<SafetyEventRecord, MAX_SAFETY_EVENTS>,
    instability_ticks: Deque<u64, MAX_TRACKED_INSTABILITIES>,
}

impl Default for SafetyManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyManager {
    pub fn new() -> Self {
        Self {
            state: SafetyState::default(),
            event_history: Vec::new(),
            instability_ticks: Deque::new(),
        }
    }

    /// Check chain speed and tension against the configured limits.
    pub fn check_chain(
        &mut self,
        chain: &ChainState,
        limits: &SafetyParams,
        tick_id: u64,
        sim_time: f64,
    ) -> Result<(), EmergencyCondition> {
        if chain.linear_speed > limits.max_chain_speed {
            let condition = EmergencyCondition::ChainOverspeed {
                speed: chain.linear_speed,
                limit: limits.max_chain_speed,
            };
            self.record_emergency(&condition, tick_id, sim_time);
            return Err(condition);
        }

        self.update_band(
            SafetyEvent::ChainSpeedHigh,
            chain.linear_speed > limits.max_chain_speed * WARNING_FRACTION,
            tick_id,
            sim_time,
        );
        self.update_band(
            SafetyEvent::TensionHigh,
            chain.tension > limits.max_chain_tension * WARNING_FRACTION,
            tick_id,
            sim_time,
        );
        self.update_safety_level();
        Ok(())
    }

    /// Latch an emergency raised elsewhere in the tick.
    pub fn record_emergency(&mut self, condition: &EmergencyCondition, tick_id: u64, sim_time: f64) {
        let (event, source) = match condition {
            EmergencyCondition::TensionExceeded { .. } => (SafetyEvent::TensionExceeded, SafetySource::Chain),
            EmergencyCondition::ChainOverspeed { .. } => (SafetyEvent::ChainOverspeed, SafetySource::Chain),
            EmergencyCondition::RepeatedInstability { .. } => {
                (SafetyEvent::RepeatedInstability, SafetySource::Optimizer)
            }
        };
        error!(tick_id, %condition, "emergency condition");
        self.record_event(event, tick_id, sim_time, SafetyLevel::Emergency, source);
        self.state.emergency_latched = true;
        self.state.emergency_count = self.state.emergency_count.saturating_add(1);
        self.update_safety_level();
    }

    /// Count an instability; escalates once more than `max_instabilities`
    /// fall within the last `instability_window` ticks.
    pub fn record_instability(
        &mut self,
        limits: &SafetyParams,
        tick_id: u64,
        sim_time: f64,
    ) -> Result<(), EmergencyCondition> {
        while let Some(&oldest) = self.instability_ticks.front() {
            if tick_id.saturating_sub(oldest) >= limits.instability_window {
                self.instability_ticks.pop_front();
            } else {
                break;
            }
        }
        if self.instability_ticks.is_full() {
            self.instability_ticks.pop_front();
        }
        let _ = self.instability_ticks.push_back(tick_id);

        let count = self.instability_ticks.len() as u32;
        self.state.instabilities_in_window = count;
        warn!(tick_id, count, "physics instability, rolling back");
        self.record_event(
            SafetyEvent::PhysicsInstability,
            tick_id,
            sim_time,
            SafetyLevel::Warning,
            SafetySource::Optimizer,
        );

        if count > limits.max_instabilities {
            let condition = EmergencyCondition::RepeatedInstability {
                count,
                window: limits.instability_window,
            };
            self.record_emergency(&condition, tick_id, sim_time);
            return Err(condition);
        }
        self.update_safety_level();
        Ok(())
    }

    pub fn record_component_unavailable(&mut self, tick_id: u64, sim_time: f64) {
        self.record_event(
            SafetyEvent::ComponentUnavailable,
            tick_id,
            sim_time,
            SafetyLevel::Caution,
            SafetySource::Electrical,
        );
        self.update_safety_level();
    }

    pub fn record_grid_trip(&mut self, tick_id: u64, sim_time: f64) {
        self.record_event(SafetyEvent::GridTrip, tick_id, sim_time, SafetyLevel::Warning, SafetySource::Electrical);
        self.update_safety_level();
    }

    /// Resolve a condition that is no longer present.
    pub fn resolve(&mut self, event: SafetyEvent) {
        for record in self.event_history.iter_mut().filter(|r| r.event == event && !r.resolved) {
            record.resolved = true;
        }
        self.update_safety_level();
    }

    fn update_band(&mut self, event: SafetyEvent, active: bool, tick_id: u64, sim_time: f64) {
        if active {
            self.record_event(event, tick_id, sim_time, SafetyLevel::Warning, SafetySource::Chain);
        } else {
            for record in self.event_history.iter_mut().filter(|r| r.event == event && !r.resolved) {
                record.resolved = true;
            }
        }
    }

    fn update_safety_level(&mut self) {
        let active = self.event_history.iter().filter(|e| !e.resolved);
        self.state.active_events = active.clone().count().min(u8::MAX as usize) as u8;
        self.state.safety_level = active.map(|e| e.level).max().unwrap_or(SafetyLevel::Normal);
    }

    fn record_event(
        &mut self,
        event: SafetyEvent,
        tick_id: u64,
        sim_time: f64,
        level: SafetyLevel,
        source: SafetySource,
    ) {
        // Refresh an active event instead of duplicating it
        if let Some(existing) = self
            .event_history
            .iter_mut()
            .find(|e| e.event == event && e.source == source && !e.resolved)
        {
            existing.tick_id = tick_id;
            existing.sim_time = sim_time;
            existing.level = existing.level.max(level);
            return;
        }

        if self.event_history.is_full() {
            self.event_history.remove(0);
        }
        let _ = self.event_history.push(SafetyEventRecord {
            event,
            tick_id,
            sim_time,
            level,
            source,
            resolved: false,
        });
    }

    pub fn is_emergency(&self) -> bool {
        self.state.emergency_latched
    }

    pub fn get_state(&self) -> &SafetyState {
        &self.state
    }

    pub fn get_event_history(&self) -> &[SafetyEventRecord] {
        &self.event_history
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}
