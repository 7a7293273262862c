use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::Command;

const MAX_SCHEDULED_COMMANDS: usize = 32;
const MAX_READY_PER_TICK: usize = 8;
const DEFAULT_HORIZON_S: f64 = 3600.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub id: u32,
    pub command: Command,
    /// Simulation time, s.
    pub execution_time: f64,
    pub scheduled_at: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerStats {
    pub total_scheduled: u32,
    pub total_released: u32,
    pub total_cleared: u32,
    pub currently_scheduled: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("execution time is not finite")]
    NotFinite,
    #[error("execution time is in the past")]
    InPast,
    #[error("execution time too far in the future")]
    TooFarAhead,
    #[error("scheduler queue full")]
    QueueFull,
    #[error("command cannot be scheduled")]
    NotSchedulable,
}

/// Holds commands tagged with a simulation time until a tick reaches it.
#[derive(Debug, Clone)]
pub struct CommandScheduler {
    scheduled_commands: Vec<ScheduledCommand, MAX_SCHEDULED_COMMANDS>,
    stats: SchedulerStats,
    horizon_s: f64,
}

impl CommandScheduler {
    pub fn new() -> Self {
        Self {
            scheduled_commands: Vec::new(),
            stats: SchedulerStats::default(),
            horizon_s: DEFAULT_HORIZON_S,
        }
    }

    pub fn schedule(
        &mut self,
        id: u32,
        command: Command,
        execution_time: f64,
        sim_time: f64,
    ) -> Result<(), ScheduleError> {
        // A step inside a tick boundary would recurse into the tick
        if matches!(command, Command::Step { .. }) {
            return Err(ScheduleError::NotSchedulable);
        }
        if !execution_time.is_finite() {
            return Err(ScheduleError::NotFinite);
        }
        if execution_time < sim_time {
            return Err(ScheduleError::InPast);
        }
        if execution_time > sim_time + self.horizon_s {
            return Err(ScheduleError::TooFarAhead);
        }
        if self.scheduled_commands.is_full() {
            return Err(ScheduleError::QueueFull);
        }

        // Equal times keep submission order
        let position = self
            .scheduled_commands
            .iter()
            .position(|cmd| cmd.execution_time > execution_time)
            .unwrap_or(self.scheduled_commands.len());
        let entry = ScheduledCommand {
            id,
            command,
            execution_time,
            scheduled_at: sim_time,
        };
        if self.scheduled_commands.insert(position, entry).is_err() {
            return Err(ScheduleError::QueueFull);
        }

        debug_assert!(self
            .scheduled_commands
            .windows(2)
            .all(|w| w[0].execution_time <= w[1].execution_time));

        self.stats.total_scheduled += 1;
        self.stats.currently_scheduled = self.scheduled_commands.len() as u8;
        Ok(())
    }

    /// Remove and return commands due at `sim_time`, oldest first.
    pub fn take_ready(&mut self, sim_time: f64) -> Vec<ScheduledCommand, MAX_READY_PER_TICK> {
        let mut ready = Vec::new();
        while let Some(first) = self.scheduled_commands.first() {
            if first.execution_time > sim_time || ready.is_full() {
                break;
            }
            let command = self.scheduled_commands.remove(0);
            let _ = ready.push(command);
            self.stats.total_released += 1;
        }
        self.stats.currently_scheduled = self.scheduled_commands.len() as u8;
        ready
    }

    pub fn get_stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn get_scheduled_commands(&self) -> &[ScheduledCommand] {
        &self.scheduled_commands
    }

    pub fn clear(&mut self) {
        self.stats.total_cleared += self.scheduled_commands.len() as u32;
        self.scheduled_commands.clear();
        self.stats.currently_scheduled = 0;
    }

    pub fn set_horizon(&mut self, horizon_s: f64) {
        self.horizon_s = horizon_s;
    }
}

impl Default for CommandScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_immediate_command_released() {
        let mut scheduler = CommandScheduler::new();
        scheduler.schedule(1, Command::Pause, 2.0, 2.0).unwrap();

        let ready = scheduler.take_ready(2.0);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, 1);
    }

    #[test]
    fn test_chronological_release() {
        let mut scheduler = CommandScheduler::new();
        scheduler.schedule(3, Command::Stop, 3.0, 0.0).unwrap();
        scheduler.schedule(1, Command::Pause, 1.0, 0.0).unwrap();
        scheduler.schedule(2, Command::Resume, 2.0, 0.0).unwrap();

        assert!(scheduler.take_ready(0.5).is_empty());
        let ready = scheduler.take_ready(2.5);
        assert_eq!(ready.iter().map(|c| c.id).collect::<std::vec::Vec<_>>(), vec![1, 2]);
        let ready = scheduler.take_ready(3.0);
        assert_eq!(ready[0].id, 3);
        assert_eq!(scheduler.get_stats().total_released, 3);
    }

    #[test]
    fn test_past_and_horizon_rejected() {
        let mut scheduler = CommandScheduler::new();
        scheduler.set_horizon(10.0);
        assert_eq!(scheduler.schedule(1, Command::Stop, 4.0, 5.0), Err(ScheduleError::InPast));
        assert_eq!(scheduler.schedule(1, Command::Stop, 16.0, 5.0), Err(ScheduleError::TooFarAhead));
        assert_eq!(scheduler.schedule(1, Command::Stop, f64::NAN, 5.0), Err(ScheduleError::NotFinite));
    }

    #[test]
    fn test_queue_full() {
        let mut scheduler = CommandScheduler::new();
        for id in 0..MAX_SCHEDULED_COMMANDS as u32 {
            scheduler.schedule(id, Command::TriggerPulse, 1.0, 0.0).unwrap();
        }
        assert_eq!(
            scheduler.schedule(99, Command::TriggerPulse, 1.0, 0.0),
            Err(ScheduleError::QueueFull)
        );
    }
}
