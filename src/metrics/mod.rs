use prometheus::{register_gauge_vec_with_registry, Encoder, GaugeVec, Opts, Registry, TextEncoder};
use lazy_static::lazy_static;
use std::sync::Arc;

use crate::models::{ProcessStatus, ReportEntry};

pub struct MetricsRegistry {
    registry: Registry,

    pub process_up: GaugeVec,
    pub process_cpu_usage: GaugeVec,
    pub process_memory_bytes: GaugeVec,
    pub process_restarts: GaugeVec,
    pub process_start_timestamp: GaugeVec,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let registry = Registry::new();

        let common_labels = &["name", "hostname"];

        let process_up = register_gauge_vec_with_registry!(
            Opts::new("process_up", "Process is running (1) or not (0)"),
            common_labels,
            registry
        ).expect("process_up registers");

        let process_cpu_usage = register_gauge_vec_with_registry!(
            Opts::new("process_cpu_usage_percent", "Process CPU usage percentage"),
            common_labels,
            registry
        ).expect("process_cpu_usage_percent registers");

        let process_memory_bytes = register_gauge_vec_with_registry!(
            Opts::new("process_memory_bytes", "Process resident memory in bytes"),
            common_labels,
            registry
        ).expect("process_memory_bytes registers");

        let process_restarts = register_gauge_vec_with_registry!(
            Opts::new("process_restarts", "Automatic restarts since the spec was assigned"),
            common_labels,
            registry
        ).expect("process_restarts registers");

        let process_start_timestamp = register_gauge_vec_with_registry!(
            Opts::new("process_start_timestamp_seconds", "Unix timestamp of the last successful spawn"),
            common_labels,
            registry
        ).expect("process_start_timestamp_seconds registers");

        Self {
            registry,
            process_up,
            process_cpu_usage,
            process_memory_bytes,
            process_restarts,
            process_start_timestamp,
        }
    }

    /// Publish the current state of every supervised process
    pub fn record(&self, hostname: &str, entries: &[ReportEntry]) {
        for entry in entries {
            let labels = &[entry.name.as_str(), hostname];
            let state = &entry.state;
            let running = state.status == ProcessStatus::Running;

            self.process_up
                .with_label_values(labels)
                .set(if running { 1.0 } else { 0.0 });
            self.process_restarts
                .with_label_values(labels)
                .set(state.restart_count as f64);

            // resource gauges only make sense while a pid exists
            if running {
                self.process_cpu_usage
                    .with_label_values(labels)
                    .set(state.cpu_percent as f64);
                self.process_memory_bytes
                    .with_label_values(labels)
                    .set(state.memory_bytes as f64);
            } else {
                let _ = self.process_cpu_usage.remove_label_values(labels);
                let _ = self.process_memory_bytes.remove_label_values(labels);
            }

            match state.start_time {
                Some(millis) => self
                    .process_start_timestamp
                    .with_label_values(labels)
                    .set(millis as f64 / 1000.0),
                None => {
                    let _ = self.process_start_timestamp.remove_label_values(labels);
                }
            }
        }
    }

    /// Drop every series of a removed process
    pub fn forget_process(&self, name: &str, hostname: &str) {
        let labels = &[name, hostname];
        let _ = self.process_up.remove_label_values(labels);
        let _ = self.process_cpu_usage.remove_label_values(labels);
        let _ = self.process_memory_bytes.remove_label_values(labels);
        let _ = self.process_restarts.remove_label_values(labels);
        let _ = self.process_start_timestamp.remove_label_values(labels);
    }

    pub fn render(&self) -> Result<String, Box<dyn std::error::Error>> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    pub static ref METRICS: Arc<MetricsRegistry> = Arc::new(MetricsRegistry::new());
}
