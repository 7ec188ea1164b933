pub mod config;
pub mod process;
pub mod protocol;
pub mod stats;

pub use config::FleetConfig;
pub use process::{now_millis, ProcessRuntimeState, ProcessSpec, ProcessStatus, StartReason};
pub use protocol::{Ack, Command, ControlAction, ReportEntry, StatusReport};
pub use stats::{HostStats, ProcessStats};
