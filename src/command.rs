//! Commands accepted at the engine boundary.

use serde::{Deserialize, Serialize};

use crate::config::RunParameters;
use crate::injection::Injection;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Command {
    Start(Box<RunParameters>),
    Stop,
    Pause,
    Resume,
    Reset,
    Step { dt: f64 },
    SetParameter { key: String, value: f64 },
    TriggerPulse,
    Inject(Injection),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Start(_) => "start",
            Command::Stop => "stop",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Reset => "reset",
            Command::Step { .. } => "step",
            Command::SetParameter { .. } => "set_parameter",
            Command::TriggerPulse => "trigger_pulse",
            Command::Inject(_) => "inject",
        }
    }
}
