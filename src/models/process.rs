use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Declaration of one managed process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Fleet-wide unique name, the only identifier used in commands and reports
    pub name: String,
    /// Command line, tokenised shell-style and executed without a shell
    pub command: String,
    /// Working directory of the spawned process
    pub working_dir: String,
    /// Address of the Deputy that owns this process
    pub host: String,
    /// Start when the spec is first loaded by its Deputy
    #[serde(default)]
    pub autostart: bool,
    /// Respawn after an unexpected exit
    #[serde(default)]
    pub auto_restart: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Restarting,
    Crashed,
}

impl ProcessStatus {
    /// States in which an OS process exists and `pid` is set
    pub fn has_pid(self) -> bool {
        matches!(self, ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Stopping)
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Stopped => "STOPPED",
            ProcessStatus::Starting => "STARTING",
            ProcessStatus::Running => "RUNNING",
            ProcessStatus::Stopping => "STOPPING",
            ProcessStatus::Restarting => "RESTARTING",
            ProcessStatus::Crashed => "CRASHED",
        };
        f.write_str(s)
    }
}

/// Why the current OS process was started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartReason {
    /// start/restart command
    Command,
    /// autostart policy when the spec was first loaded
    Autostart,
    /// auto_restart policy after an unexpected exit
    AutoRestart,
}

/// Live state of one managed process, owned by its Deputy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRuntimeState {
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    /// Unix epoch milliseconds of the last successful spawn
    pub start_time: Option<u64>,
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_bytes: u64,
    /// Number of automatic restarts since the spec was loaded
    #[serde(default)]
    pub restart_count: u32,
    #[serde(default)]
    pub start_reason: Option<StartReason>,
    /// Reason of the last spawn failure
    #[serde(default)]
    pub failure: Option<String>,
}

impl Default for ProcessRuntimeState {
    fn default() -> Self {
        Self {
            status: ProcessStatus::Stopped,
            pid: None,
            start_time: None,
            last_exit_code: None,
            cpu_percent: 0.0,
            memory_bytes: 0,
            restart_count: 0,
            start_reason: None,
            failure: None,
        }
    }
}

impl ProcessRuntimeState {
    /// Clear everything tied to the OS process that just went away
    pub fn clear_process(&mut self) {
        self.pid = None;
        self.cpu_percent = 0.0;
        self.memory_bytes = 0;
    }
}

/// Unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
