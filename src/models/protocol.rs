use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::{HostStats, ProcessRuntimeState, ProcessSpec};

/// Sheriff → Deputy request, tagged by `action` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Command {
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    UpdateSpec { spec: ProcessSpec },
    Remove { name: String },
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Start { name }
            | Command::Stop { name }
            | Command::Restart { name }
            | Command::Remove { name } => name,
            Command::UpdateSpec { spec } => &spec.name,
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            Command::Start { .. } => "start",
            Command::Stop { .. } => "stop",
            Command::Restart { .. } => "restart",
            Command::UpdateSpec { .. } => "update_spec",
            Command::Remove { .. } => "remove",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.action(), self.name())
    }
}

/// Actions an operator may dispatch; spec changes go through configuration reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlAction {
    Start,
    Stop,
    Restart,
}

impl ControlAction {
    pub fn command(self, name: &str) -> Command {
        let name = name.to_string();
        match self {
            ControlAction::Start => Command::Start { name },
            ControlAction::Stop => Command::Stop { name },
            ControlAction::Restart => Command::Restart { name },
        }
    }
}

impl std::str::FromStr for ControlAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ControlAction::Start),
            "stop" => Ok(ControlAction::Stop),
            "restart" => Ok(ControlAction::Restart),
            other => Err(format!("unknown action '{}'", other)),
        }
    }
}

/// Successful command result; `state` is `None` once a process was removed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub name: String,
    pub state: Option<ProcessRuntimeState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportEntry {
    pub name: String,
    #[serde(flatten)]
    pub state: ProcessRuntimeState,
}

/// Periodic Deputy → Sheriff summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Advertised Deputy address
    pub host: String,
    pub hostname: String,
    /// Deputy start time (Unix ms); orders reports across Deputy restarts
    pub boot_id: u64,
    /// Strictly increasing within one boot
    pub sequence: u64,
    pub generated_at: u64,
    /// Ordered by name
    pub processes: Vec<ReportEntry>,
    #[serde(default)]
    pub host_stats: HostStats,
}
