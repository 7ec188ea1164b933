use serde::{Deserialize, Serialize};

/// Resource usage of one OS process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProcessStats {
    /// CPU usage (percent of one core)
    pub cpu_percent: f32,

    /// Resident memory (bytes)
    pub memory_bytes: u64,

    /// Resident memory as percent of host memory (0-100)
    pub memory_percent: f32,

    /// Virtual memory (bytes)
    pub virtual_memory_bytes: u64,
}

/// Host-level usage attached to every status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct HostStats {
    pub cpu_percent: f32,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub load_average_one: f64,
}
