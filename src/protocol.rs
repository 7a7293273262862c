//! Newline-delimited JSON wire protocol with ACK/NACK semantics.
//!
//! Clients send a [`CommandEnvelope`] per line. Each envelope is answered
//! with an `Acknowledged` or `NegativeAck` [`CommandResponse`] on receipt and
//! a final `Success`, `Scheduled` or `ExecutionFailed` once the simulation
//! thread has handled it. Snapshots share the stream as [`ServerMessage`]s.

use heapless::Vec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::command::Command;
use crate::error::{CommandError, EngineError};
use crate::runner::{CommandOutcome, Reply};
use crate::snapshot::SimulationSnapshot;

pub const MAX_COMMAND_SIZE: usize = 4096;
pub const MAX_RESPONSE_SIZE: usize = 1024;

const MAX_TRACKED_COMMANDS: usize = 16;
const DEFAULT_TRACKING_TIMEOUT_S: f64 = 30.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub id: u32,
    pub command: Command,
    /// Simulation time to run at; `None` runs at the next tick boundary.
    #[serde(default)]
    pub execution_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: u32,
    pub status: ResponseStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Received and accepted for execution
    Acknowledged,
    /// Rejected before execution
    NegativeAck,
    /// Held for a future simulation time
    Scheduled,
    Success,
    ExecutionFailed,
}

/// Everything the server writes to a client connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Response(CommandResponse),
    Snapshot(Box<SimulationSnapshot>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid JSON format")]
    InvalidJson,
    #[error("message exceeds size limit")]
    MessageTooLarge,
    #[error("serialization failed")]
    SerializationError,
    #[error("invalid command")]
    InvalidCommand,
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("command id already tracked")]
    DuplicateCommand,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandTracker {
    pub command_id: u32,
    /// Wall-clock seconds since the handler started.
    pub received_at: f64,
    pub status: ResponseStatus,
    pub timeout_s: f64,
    pub last_update: f64,
}

impl CommandTracker {
    pub fn new(command_id: u32, now: f64, timeout_s: f64) -> Self {
        Self {
            command_id,
            received_at: now,
            status: ResponseStatus::Acknowledged,
            timeout_s,
            last_update: now,
        }
    }

    pub fn is_expired(&self, now: f64) -> bool {
        now > self.received_at + self.timeout_s
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self.status,
            ResponseStatus::Success | ResponseStatus::ExecutionFailed | ResponseStatus::NegativeAck
        )
    }

    pub fn update_status(&mut self, status: ResponseStatus, now: f64) {
        self.status = status;
        self.last_update = now;
    }
}

#[derive(Debug, Default)]
pub struct ProtocolHandler {
    tracked_commands: Vec<CommandTracker, MAX_TRACKED_COMMANDS>,
    commands_parsed: u64,
    commands_rejected: u64,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse_command(&mut self, json_str: &str) -> Result<CommandEnvelope, ProtocolError> {
        if json_str.len() > MAX_COMMAND_SIZE {
            self.commands_rejected += 1;
            return Err(ProtocolError::MessageTooLarge);
        }
        match serde_json::from_str::<CommandEnvelope>(json_str.trim()) {
            Ok(envelope) => {
                self.commands_parsed += 1;
                Ok(envelope)
            }
            Err(_) => {
                self.commands_rejected += 1;
                Err(ProtocolError::InvalidJson)
            }
        }
    }

    /// Structural checks that do not need the engine.
    pub fn validate_command(&self, envelope: &CommandEnvelope) -> Result<(), ProtocolError> {
        if envelope.id == 0 {
            return Err(ProtocolError::InvalidCommand);
        }
        if let Some(at) = envelope.execution_time {
            if !at.is_finite() || at < 0.0 {
                return Err(ProtocolError::InvalidParameter);
            }
        }

        match &envelope.command {
            Command::Step { dt } => {
                if !dt.is_finite() || *dt <= 0.0 {
                    return Err(ProtocolError::InvalidParameter);
                }
            }
            Command::SetParameter { key, value } => {
                if key.is_empty() || !value.is_finite() {
                    return Err(ProtocolError::InvalidParameter);
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn serialize_response(&self, response: &CommandResponse) -> Result<String, ProtocolError> {
        let json = serde_json::to_string(&ServerMessage::Response(response.clone()))
            .map_err(|_| ProtocolError::SerializationError)?;
        if json.len() > MAX_RESPONSE_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        Ok(json)
    }

    pub fn serialize_snapshot(&self, snapshot: &SimulationSnapshot) -> Result<String, ProtocolError> {
        serde_json::to_string(&ServerMessage::Snapshot(Box::new(snapshot.clone())))
            .map_err(|_| ProtocolError::SerializationError)
    }

    pub fn create_response(&self, command_id: u32, status: ResponseStatus, message: Option<&str>) -> CommandResponse {
        CommandResponse {
            id: command_id,
            status,
            message: message.map(str::to_string),
        }
    }

    pub fn create_ack_response(&self, command_id: u32) -> CommandResponse {
        self.create_response(command_id, ResponseStatus::Acknowledged, None)
    }

    pub fn create_nack_response(&self, command_id: u32, reason: &str) -> CommandResponse {
        self.create_response(command_id, ResponseStatus::NegativeAck, Some(reason))
    }

    pub fn create_execution_failed_response(&self, command_id: u32, reason: &str) -> CommandResponse {
        self.create_response(command_id, ResponseStatus::ExecutionFailed, Some(reason))
    }

    /// Final response for a command the simulation thread has handled.
    ///
    /// Bad parameters and rejected schedules are NACKs; anything the engine
    /// refused for its current state is an execution failure.
    pub fn create_outcome_response(&self, command_id: u32, reply: &Reply) -> CommandResponse {
        match reply {
            Ok(CommandOutcome::Applied(status)) => {
                let message = format!("{status:?}");
                self.create_response(command_id, ResponseStatus::Success, Some(&message))
            }
            Ok(CommandOutcome::Scheduled) => self.create_response(command_id, ResponseStatus::Scheduled, None),
            Err(CommandError::Engine(EngineError::Validation(e))) => {
                self.create_nack_response(command_id, &e.to_string())
            }
            Err(CommandError::Schedule(e)) => self.create_nack_response(command_id, &e.to_string()),
            Err(CommandError::Engine(e)) => self.create_execution_failed_response(command_id, &e.to_string()),
        }
    }

    // ---- ACK/NACK tracking ----

    pub fn track_command(&mut self, command_id: u32, now: f64) -> Result<(), ProtocolError> {
        self.cleanup_expired_commands(now);

        if self
            .tracked_commands
            .iter()
            .any(|t| t.command_id == command_id && !t.is_final())
        {
            return Err(ProtocolError::DuplicateCommand);
        }
        self.tracked_commands.retain(|t| t.command_id != command_id);

        if self.tracked_commands.is_full() {
            self.tracked_commands.remove(0);
        }
        let _ = self
            .tracked_commands
            .push(CommandTracker::new(command_id, now, DEFAULT_TRACKING_TIMEOUT_S));
        Ok(())
    }

    pub fn update_command_status(
        &mut self,
        command_id: u32,
        status: ResponseStatus,
        now: f64,
    ) -> Result<(), ProtocolError> {
        let tracker = self
            .tracked_commands
            .iter_mut()
            .find(|t| t.command_id == command_id)
            .ok_or(ProtocolError::InvalidCommand)?;
        tracker.update_status(status, now);
        Ok(())
    }

    pub fn get_command_status(&self, command_id: u32) -> Option<&CommandTracker> {
        self.tracked_commands.iter().find(|t| t.command_id == command_id)
    }

    pub fn cleanup_expired_commands(&mut self, now: f64) {
        self.tracked_commands.retain(|tracker| !tracker.is_expired(now));
    }

    pub fn get_tracked_commands(&self) -> &[CommandTracker] {
        &self.tracked_commands
    }

    pub fn commands_parsed(&self) -> u64 {
        self.commands_parsed
    }

    pub fn commands_rejected(&self) -> u64 {
        self.commands_rejected
    }
}
