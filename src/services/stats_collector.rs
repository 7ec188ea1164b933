use crate::models::{HostStats, ProcessStats};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use sysinfo::{Pid, ProcessesToUpdate, System};

/// Samples resource usage of supervised pids.
///
/// Sampling is a separate concern from exit detection: a vanished pid simply
/// drops out of the sample set, the supervisor learns about exits on its own.
pub struct StatsCollector {
    system: Mutex<System>,
    samples: RwLock<HashMap<u32, ProcessStats>>,
    host: RwLock<HostStats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            samples: RwLock::new(HashMap::new()),
            host: RwLock::new(HostStats::default()),
        }
    }

    /// Refresh usage of `pids` and of the host
    pub fn refresh(&self, pids: &[u32]) {
        let Ok(mut sys) = self.system.lock() else {
            return;
        };

        let sysinfo_pids: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        sys.refresh_processes(ProcessesToUpdate::Some(&sysinfo_pids), true);
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        let total_memory = sys.total_memory();
        let mut fresh = HashMap::with_capacity(pids.len());
        for pid in pids {
            let Some(process) = sys.process(Pid::from_u32(*pid)) else {
                continue;
            };
            fresh.insert(
                *pid,
                ProcessStats {
                    cpu_percent: process.cpu_usage(),
                    memory_bytes: process.memory(),
                    memory_percent: if total_memory > 0 {
                        (process.memory() as f32 / total_memory as f32) * 100.0
                    } else {
                        0.0
                    },
                    virtual_memory_bytes: process.virtual_memory(),
                },
            );
        }

        let host = HostStats {
            cpu_percent: sys.global_cpu_usage(),
            memory_used_bytes: sys.used_memory(),
            memory_total_bytes: total_memory,
            load_average_one: System::load_average().one,
        };
        drop(sys);

        if let Ok(mut samples) = self.samples.write() {
            *samples = fresh;
        }
        if let Ok(mut current) = self.host.write() {
            *current = host;
        }
    }

    pub fn process_stats(&self, pid: u32) -> Option<ProcessStats> {
        self.samples.read().ok()?.get(&pid).cloned()
    }

    pub fn host_stats(&self) -> HostStats {
        self.host.read().map(|h| h.clone()).unwrap_or_default()
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
