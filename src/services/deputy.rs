use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{ProcmanError, Result};
use crate::metrics::METRICS;
use crate::models::config::validate_spec;
use crate::models::{
    now_millis, Ack, Command, ProcessRuntimeState, ProcessSpec, ReportEntry, StartReason,
    StatusReport,
};
use crate::services::deputy_client::base_url;
use crate::services::supervisor::{SupervisorHandle, SupervisorSettings};
use crate::services::StatsCollector;

#[derive(Debug, Clone)]
pub struct DeputySettings {
    /// Bind address of the HTTP endpoint
    pub address: String,
    pub port: u16,
    /// Address under which the Sheriff knows this Deputy
    pub advertise: String,
    /// Sheriff base URL to push reports to
    pub sheriff: Option<String>,
    /// Fleet document to load local specs from at boot
    pub config: Option<PathBuf>,
    pub report_interval: Duration,
    pub supervisor: SupervisorSettings,
}

impl Default for DeputySettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 8000,
            advertise: "localhost:8000".to_string(),
            sheriff: None,
            config: None,
            report_interval: Duration::from_secs(1),
            supervisor: SupervisorSettings::default(),
        }
    }
}

/// One process as listed by the Deputy
#[derive(Debug, Clone, Serialize)]
pub struct ProcessView {
    pub spec: ProcessSpec,
    pub state: ProcessRuntimeState,
}

/// Per-host agent owning one supervisor per assigned spec
pub struct Deputy {
    settings: DeputySettings,
    hostname: String,
    boot_id: u64,
    /// Last issued report sequence; held while a report is assembled
    sequence: Mutex<u64>,
    supervisors: RwLock<BTreeMap<String, SupervisorHandle>>,
    stats: StatsCollector,
    /// Runtime that owns supervisor actors; it outlives the HTTP workers
    runtime: Option<Handle>,
}

impl Deputy {
    pub fn new(settings: DeputySettings) -> Self {
        Self {
            settings,
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            boot_id: now_millis(),
            sequence: Mutex::new(0),
            supervisors: RwLock::new(BTreeMap::new()),
            stats: StatsCollector::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    pub fn settings(&self) -> &DeputySettings {
        &self.settings
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn boot_id(&self) -> u64 {
        self.boot_id
    }

    /// Execute one command; every kind is handled here
    pub async fn handle(&self, command: Command) -> Result<Ack> {
        log::debug!("Handling {}", command);
        match command {
            Command::Start { name } => {
                let state = self.supervisor(&name).await?.start(StartReason::Command).await?;
                Ok(self.ack(name, state))
            }
            Command::Stop { name } => {
                let state = self.supervisor(&name).await?.stop().await?;
                Ok(self.ack(name, state))
            }
            Command::Restart { name } => {
                let state = self.supervisor(&name).await?.restart().await?;
                Ok(self.ack(name, state))
            }
            Command::UpdateSpec { spec } => {
                let name = spec.name.clone();
                let state = self.update_spec(spec).await?;
                Ok(self.ack(name, state))
            }
            Command::Remove { name } => {
                self.remove(&name).await?;
                Ok(Ack { name, state: None })
            }
        }
    }

    /// Assign or replace a spec. A new spec is evaluated for autostart exactly
    /// once; a known one is replaced without touching its running process.
    pub async fn update_spec(&self, spec: ProcessSpec) -> Result<ProcessRuntimeState> {
        validate_spec(&spec).map_err(ProcmanError::Validation)?;

        let (handle, created) = {
            let mut supervisors = self.supervisors.write().await;
            match supervisors.get(&spec.name) {
                Some(handle) => (handle.clone(), false),
                None => {
                    let runtime = self.runtime.clone().unwrap_or_else(Handle::current);
                    let handle = SupervisorHandle::spawn_on(
                        spec.clone(),
                        self.settings.supervisor.clone(),
                        &runtime,
                    );
                    supervisors.insert(spec.name.clone(), handle.clone());
                    (handle, true)
                }
            }
        };

        if created {
            log::info!("Assigned process '{}' ({})", spec.name, spec.command);
            if spec.autostart {
                if let Err(e) = handle.start(StartReason::Autostart).await {
                    log::warn!("Autostart of '{}' failed: {}", spec.name, e);
                }
            }
        } else {
            handle.update_spec(spec).await?;
        }

        Ok(handle.snapshot())
    }

    /// Stop the process and forget it
    pub async fn remove(&self, name: &str) -> Result<()> {
        let handle = self.supervisor(name).await?;
        handle.stop().await?;

        if let Some(handle) = self.supervisors.write().await.remove(name) {
            handle.close();
        }
        METRICS.forget_process(name, &self.hostname);
        log::info!("Removed process '{}'", name);
        Ok(())
    }

    /// Boot-time assignment of locally configured specs
    pub async fn load_specs(&self, specs: Vec<ProcessSpec>) {
        for spec in specs {
            let name = spec.name.clone();
            if let Err(e) = self.update_spec(spec).await {
                log::error!("Failed to load process '{}': {}", name, e);
            }
        }
    }

    pub async fn process(&self, name: &str) -> Result<ProcessView> {
        let handle = self.supervisor(name).await?;
        Ok(ProcessView {
            spec: handle.spec(),
            state: self.with_stats(handle.snapshot()),
        })
    }

    pub async fn list(&self) -> Vec<ProcessView> {
        let supervisors = self.supervisors.read().await;
        supervisors
            .values()
            .map(|handle| ProcessView {
                spec: handle.spec(),
                state: self.with_stats(handle.snapshot()),
            })
            .collect()
    }

    /// Snapshot of every supervised process, ordered by name
    pub async fn entries(&self) -> Vec<ReportEntry> {
        let supervisors = self.supervisors.read().await;
        supervisors
            .iter()
            .map(|(name, handle)| ReportEntry {
                name: name.clone(),
                state: self.with_stats(handle.snapshot()),
            })
            .collect()
    }

    /// Assemble the next status report
    pub async fn status_report(&self) -> StatusReport {
        let mut sequence = self.sequence.lock().await;
        let processes = self.entries().await;
        *sequence += 1;

        StatusReport {
            host: self.settings.advertise.clone(),
            hostname: self.hostname.clone(),
            boot_id: self.boot_id,
            sequence: *sequence,
            generated_at: now_millis(),
            processes,
            host_stats: self.stats.host_stats(),
        }
    }

    /// Stop every supervised process concurrently
    pub async fn shutdown(&self) {
        let handles: Vec<SupervisorHandle> =
            self.supervisors.read().await.values().cloned().collect();
        log::info!("Stopping {} supervised processes", handles.len());

        let results = join_all(handles.iter().map(|handle| handle.stop())).await;
        for (handle, result) in handles.iter().zip(results) {
            if let Err(e) = result {
                log::warn!("Failed to stop '{}' on shutdown: {}", handle.name(), e);
            }
            handle.close();
        }
    }

    /// Spawn the stats sampler and, if a Sheriff is attached, the report pusher
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::new();

        let deputy = self.clone();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(deputy.settings.report_interval);
            loop {
                ticker.tick().await;
                deputy.refresh_stats().await;
            }
        }));

        if let Some(sheriff) = self.settings.sheriff.clone() {
            let deputy = self.clone();
            tasks.push(tokio::spawn(async move {
                deputy.push_reports(sheriff).await;
            }));
        }

        tasks
    }

    async fn refresh_stats(self: &Arc<Self>) {
        let pids: Vec<u32> = self
            .entries()
            .await
            .iter()
            .filter_map(|entry| entry.state.pid)
            .collect();

        let deputy = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || deputy.stats.refresh(&pids)).await {
            log::warn!("Stats sampling failed: {}", e);
        }
    }

    async fn push_reports(&self, sheriff: String) {
        let client = reqwest::Client::new();
        let url = format!("{}/api/report", base_url(&sheriff));
        let mut ticker = tokio::time::interval(self.settings.report_interval);
        let mut attached = false;

        loop {
            ticker.tick().await;
            let report = self.status_report().await;
            let result = client
                .post(&url)
                .timeout(self.settings.report_interval)
                .json(&report)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match result {
                Ok(_) if !attached => {
                    log::info!("✓ Pushing reports to sheriff at {}", url);
                    attached = true;
                }
                Ok(_) => {}
                Err(e) => {
                    if attached {
                        log::warn!("Lost sheriff at {}: {}", url, e);
                    } else {
                        log::debug!("Sheriff at {} not reachable yet: {}", url, e);
                    }
                    attached = false;
                }
            }
        }
    }

    async fn supervisor(&self, name: &str) -> Result<SupervisorHandle> {
        self.supervisors
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ProcmanError::NotFound(name.to_string()))
    }

    fn ack(&self, name: String, state: ProcessRuntimeState) -> Ack {
        Ack {
            name,
            state: Some(self.with_stats(state)),
        }
    }

    fn with_stats(&self, mut state: ProcessRuntimeState) -> ProcessRuntimeState {
        if let Some(stats) = state.pid.and_then(|pid| self.stats.process_stats(pid)) {
            state.cpu_percent = stats.cpu_percent;
            state.memory_bytes = stats.memory_bytes;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProcessStatus;
    use crate::services::fleet::plan_commands;

    fn deputy() -> Deputy {
        let _ = env_logger::builder().is_test(true).try_init();
        Deputy::new(DeputySettings {
            supervisor: SupervisorSettings {
                grace_period: Duration::from_secs(2),
                restart_delay: Duration::from_millis(50),
            },
            ..DeputySettings::default()
        })
    }

    fn spec(name: &str, autostart: bool) -> ProcessSpec {
        ProcessSpec {
            name: name.into(),
            command: "sleep 30".into(),
            working_dir: "/tmp".into(),
            host: "localhost:8000".into(),
            autostart,
            auto_restart: false,
        }
    }

    #[tokio::test]
    async fn test_unknown_name_is_not_found() {
        let deputy = deputy();
        for command in [
            Command::Start { name: "ghost".into() },
            Command::Stop { name: "ghost".into() },
            Command::Restart { name: "ghost".into() },
            Command::Remove { name: "ghost".into() },
        ] {
            let err = deputy.handle(command).await.unwrap_err();
            assert_eq!(err, ProcmanError::NotFound("ghost".into()));
        }
    }

    #[tokio::test]
    async fn test_autostart_on_first_assignment_only() {
        let deputy = deputy();
        let ack = deputy
            .handle(Command::UpdateSpec { spec: spec("echoloop", true) })
            .await
            .unwrap();
        let running = ack.state.unwrap();
        assert_eq!(running.status, ProcessStatus::Running);
        assert_eq!(running.start_reason, Some(StartReason::Autostart));

        // resending the same spec must not interrupt the process
        let ack = deputy
            .handle(Command::UpdateSpec { spec: spec("echoloop", true) })
            .await
            .unwrap();
        assert_eq!(ack.state.unwrap().pid, running.pid);

        deputy.shutdown().await;
    }

    async fn apply_assignment(deputy: &Deputy, spec: ProcessSpec) -> ProcessRuntimeState {
        let desired = BTreeMap::from([(spec.name.clone(), spec.clone())]);
        let plan = plan_commands(&BTreeMap::new(), &desired);
        assert_eq!(plan, vec![Command::UpdateSpec { spec: spec.clone() }]);
        for command in plan {
            deputy.handle(command).await.unwrap();
        }
        deputy.process(&spec.name).await.unwrap().state
    }

    #[tokio::test]
    async fn test_failed_autostart_is_not_retried() {
        let deputy = deputy();
        let mut broken = spec("broken", true);
        broken.working_dir = "/definitely/not/here".into();

        let state = apply_assignment(&deputy, broken).await;
        assert_eq!(state.status, ProcessStatus::Crashed);
        assert!(state.failure.unwrap().contains("does not exist"));
        assert_eq!(state.start_time, None);
    }

    #[tokio::test]
    async fn test_planned_autostart_runs_once() {
        let deputy = deputy();
        let dir = tempfile::tempdir().unwrap();
        let mut once = spec("once", true);
        once.command = "sh -c 'echo run >> runs'".into();
        once.working_dir = dir.path().to_str().unwrap().into();

        apply_assignment(&deputy, once).await;
        let handle = deputy.supervisor("once").await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            handle.subscribe().wait_for(|s| s.status == ProcessStatus::Crashed),
        )
        .await
        .unwrap()
        .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let runs = std::fs::read_to_string(dir.path().join("runs")).unwrap();
        assert_eq!(runs.lines().count(), 1);
        assert_eq!(handle.snapshot().last_exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_changed_spec_keeps_running_process() {
        let deputy = deputy();
        let running = deputy.update_spec(spec("echoloop", true)).await.unwrap();

        let mut changed = spec("echoloop", true);
        changed.command = "sleep 60".into();
        let state = deputy.update_spec(changed).await.unwrap();
        assert_eq!(state.pid, running.pid);
        assert_eq!(deputy.process("echoloop").await.unwrap().spec.command, "sleep 60");

        deputy.shutdown().await;
    }

    #[tokio::test]
    async fn test_remove_stops_and_forgets() {
        let deputy = deputy();
        deputy.update_spec(spec("dateprinter", true)).await.unwrap();

        let ack = deputy
            .handle(Command::Remove { name: "dateprinter".into() })
            .await
            .unwrap();
        assert_eq!(ack.state, None);
        assert!(deputy.entries().await.is_empty());
        assert!(deputy.process("dateprinter").await.is_err());
    }

    #[tokio::test]
    async fn test_report_is_ordered_and_sequenced() {
        let deputy = deputy();
        deputy.update_spec(spec("logrotator", false)).await.unwrap();
        deputy.update_spec(spec("echoloop", false)).await.unwrap();

        let first = deputy.status_report().await;
        let second = deputy.status_report().await;
        let names: Vec<&str> = first.processes.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["echoloop", "logrotator"]);
        assert!(second.sequence > first.sequence);
        assert_eq!(first.boot_id, second.boot_id);
        assert_eq!(first.host, "localhost:8000");
        assert!(first
            .processes
            .iter()
            .all(|e| e.state.status == ProcessStatus::Stopped));
    }

    #[tokio::test]
    async fn test_invalid_spec_rejected() {
        let deputy = deputy();
        let mut bad = spec("bad/name", false);
        bad.command = "sleep 1".into();
        let err = deputy.update_spec(bad).await.unwrap_err();
        assert!(matches!(err, ProcmanError::Validation(_)));
        assert!(deputy.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_load_specs_applies_autostart() {
        let deputy = deputy();
        deputy
            .load_specs(vec![spec("echoloop", true), spec("idle", false)])
            .await;

        let listed = deputy.list().await;
        assert_eq!(listed.len(), 2);
        assert_eq!(deputy.process("echoloop").await.unwrap().state.status, ProcessStatus::Running);
        assert_eq!(deputy.process("idle").await.unwrap().state.status, ProcessStatus::Stopped);

        deputy.shutdown().await;
        assert_eq!(deputy.process("echoloop").await.unwrap().state.status, ProcessStatus::Stopped);
    }
}
