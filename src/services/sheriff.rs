use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::error::{ErrorKind, ProcmanError, Result};
use crate::models::{Ack, Command, ControlAction, FleetConfig, StatusReport};
use crate::services::deputy_client::DeputyClient;
use crate::services::fleet::{DeputyPlan, DeputyView, Fleet, IngestOutcome, ProcessView};

#[derive(Debug, Clone)]
pub struct SheriffSettings {
    pub address: String,
    pub port: u16,
    /// Fleet document reloaded on SIGHUP and `POST /api/config/reload`
    pub config: Option<PathBuf>,
    /// Expected Deputy report interval, also the poll interval
    pub report_interval: Duration,
    /// A Deputy silent for this many intervals is DISCONNECTED
    pub liveness_multiplier: u32,
    pub command_timeout: Duration,
    /// Pull reports from every Deputy instead of only accepting pushes
    pub poll: bool,
}

impl Default for SheriffSettings {
    fn default() -> Self {
        Self {
            address: "0.0.0.0".to_string(),
            port: 9000,
            config: None,
            report_interval: Duration::from_secs(1),
            liveness_multiplier: 3,
            command_timeout: Duration::from_secs(15),
            poll: true,
        }
    }
}

/// Outcome of reconciling one Deputy
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub address: String,
    /// False when the Deputy was DISCONNECTED and reconciliation was deferred
    pub connected: bool,
    pub sent: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReloadReport {
    pub deputies: Vec<SyncReport>,
    /// Deputies dropped from the fleet and told to stop everything
    pub retired: Vec<SyncReport>,
}

/// Central coordinator: declared fleet, observed state, reconciliation
pub struct Sheriff {
    settings: SheriffSettings,
    fleet: RwLock<Fleet>,
    client: Arc<dyn DeputyClient>,
    reload_lock: Mutex<()>,
    pollers: std::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Sheriff {
    pub fn new(settings: SheriffSettings, client: Arc<dyn DeputyClient>) -> Self {
        Self {
            settings,
            fleet: RwLock::new(Fleet::new()),
            client,
            reload_lock: Mutex::new(()),
            pollers: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &SheriffSettings {
        &self.settings
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.settings.report_interval * self.settings.liveness_multiplier
    }

    /// Replace the declared configuration and reconcile every Deputy.
    ///
    /// An invalid document is rejected before anything changes. Reloads are
    /// serialized; Deputies are contacted in parallel.
    pub async fn reload(self: &Arc<Self>, config: FleetConfig) -> Result<ReloadReport> {
        config.validate()?;
        let _reload = self.reload_lock.lock().await;

        let (retirements, addresses) = {
            let mut fleet = self.fleet.write().await;
            let retirements = fleet.apply_config(config);
            log::info!(
                "Applied configuration: {} deputies, {} processes",
                fleet.config().deputies.len(),
                fleet.config().processes.len()
            );
            (retirements, fleet.addresses())
        };

        self.refresh_pollers(&addresses);

        let retire = join_all(retirements.into_iter().map(|plan| self.deliver(plan)));
        let sync = join_all(addresses.iter().map(|address| self.sync_deputy(address)));
        let (retired, deputies) = futures::join!(retire, sync);

        for report in deputies.iter().filter(|report| !report.connected) {
            log::info!("Deputy {} is disconnected; reconciliation deferred", report.address);
        }

        Ok(ReloadReport { deputies, retired })
    }

    pub async fn reload_from_file(self: &Arc<Self>) -> Result<ReloadReport> {
        let path = self
            .settings
            .config
            .as_ref()
            .ok_or_else(|| ProcmanError::Validation("no configuration file was given".to_string()))?;
        log::info!("Reloading configuration from {}", path.display());
        let config = FleetConfig::load(path)?;
        self.reload(config).await
    }

    /// Forward an operator action to the Deputy owning `name`
    pub async fn dispatch(&self, name: &str, action: ControlAction) -> Result<Ack> {
        let address = {
            let fleet = self.fleet.read().await;
            let record = fleet.locate(name)?;
            if !record.is_connected() {
                return Err(ProcmanError::unreachable(
                    &record.address,
                    "no status report within the liveness window",
                ));
            }
            record.address.clone()
        };

        let command = action.command(name);
        log::info!("Dispatching {} to {}", command, address);
        let ack = self.send(&address, &command).await?;
        self.fleet.write().await.record_ack(&address, &ack);
        Ok(ack)
    }

    /// Merge a report from `address`; schedules reconciliation when due
    pub async fn ingest_report(self: &Arc<Self>, address: &str, report: StatusReport) -> IngestOutcome {
        let outcome = self.fleet.write().await.ingest(address, report, Instant::now());
        match outcome {
            IngestOutcome::Accepted { needs_sync: true } => self.schedule_sync(address.to_string()),
            IngestOutcome::UnknownDeputy => {
                log::warn!("Ignoring report from undeclared deputy {}", address)
            }
            _ => {}
        }
        outcome
    }

    /// Mark silent Deputies DISCONNECTED
    pub async fn check_liveness(&self) -> Vec<String> {
        let timeout = self.liveness_timeout();
        let flipped = self.fleet.write().await.expire(Instant::now(), timeout);
        for address in &flipped {
            log::warn!("✗ Deputy {} silent for more than {:?}; marked DISCONNECTED", address, timeout);
        }
        flipped
    }

    /// Reconcile one Deputy, waiting for any pass already running against it
    pub async fn sync_deputy(&self, address: &str) -> SyncReport {
        let lane = self.fleet.read().await.lane(address);
        let Some(lane) = lane else {
            return SyncReport {
                address: address.to_string(),
                ..SyncReport::default()
            };
        };
        let _turn = lane.lock().await;
        self.sync_locked(address).await
    }

    pub async fn deputies(&self) -> Vec<DeputyView> {
        self.fleet.read().await.deputy_views(Instant::now())
    }

    pub async fn processes(&self) -> Vec<ProcessView> {
        self.fleet.read().await.process_views()
    }

    pub async fn config(&self) -> FleetConfig {
        self.fleet.read().await.config().clone()
    }

    /// Start the liveness monitor
    pub fn spawn_background(self: &Arc<Self>) -> JoinHandle<()> {
        let sheriff = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sheriff.settings.report_interval);
            loop {
                ticker.tick().await;
                sheriff.check_liveness().await;
            }
        })
    }

    /// Abort every report poller
    pub fn shutdown(&self) {
        if let Ok(mut pollers) = self.pollers.lock() {
            for (_, task) in pollers.drain() {
                task.abort();
            }
        }
    }

    async fn sync_locked(&self, address: &str) -> SyncReport {
        let plan = self.fleet.write().await.take_plan(address);
        match plan {
            Some(plan) => self.deliver(plan).await,
            None => {
                let connected = self
                    .fleet
                    .read()
                    .await
                    .record(address)
                    .map_or(false, |record| record.is_connected());
                SyncReport {
                    address: address.to_string(),
                    connected,
                    ..SyncReport::default()
                }
            }
        }
    }

    /// Send a plan's commands in order, confirming each acknowledged one
    async fn deliver(&self, plan: DeputyPlan) -> SyncReport {
        let mut report = SyncReport {
            address: plan.address.clone(),
            connected: true,
            ..SyncReport::default()
        };

        for command in &plan.commands {
            match self.send(&plan.address, command).await {
                Ok(ack) => {
                    self.fleet.write().await.confirm(&plan.address, &ack, command);
                    report.sent.push(command.to_string());
                }
                Err(e) if e.kind() == ErrorKind::NotFound && matches!(command, Command::Stop { .. } | Command::Remove { .. }) => {
                    // already gone on the Deputy
                    let ack = Ack {
                        name: command.name().to_string(),
                        state: None,
                    };
                    self.fleet.write().await.confirm(&plan.address, &ack, command);
                }
                Err(e) if e.kind() == ErrorKind::DeputyUnreachable => {
                    log::warn!("Reconciliation of {} interrupted at {}: {}", plan.address, command, e);
                    self.fleet.write().await.mark_unsynced(&plan.address);
                    report.errors.push(e.to_string());
                    break;
                }
                Err(e) => {
                    log::warn!("{} on {} failed: {}", command, plan.address, e);
                    report.errors.push(e.to_string());
                }
            }
        }

        if !report.sent.is_empty() {
            log::info!("Reconciled {}: {}", plan.address, report.sent.join(", "));
        }
        report
    }

    async fn send(&self, address: &str, command: &Command) -> Result<Ack> {
        let timeout = self.settings.command_timeout;
        match tokio::time::timeout(timeout, self.client.send_command(address, command)).await {
            Ok(result) => result,
            Err(_) => Err(ProcmanError::unreachable(
                address,
                format!("no answer to {} within {:?}", command, timeout),
            )),
        }
    }

    fn schedule_sync(self: &Arc<Self>, address: String) {
        let sheriff = self.clone();
        tokio::spawn(async move {
            let lane = sheriff.fleet.read().await.lane(&address);
            let Some(lane) = lane else {
                return;
            };
            // a pass already in flight picks up the flag or leaves it for the next report
            let Ok(_turn) = lane.try_lock() else {
                return;
            };
            sheriff.sync_locked(&address).await;
        });
    }

    fn refresh_pollers(self: &Arc<Self>, addresses: &[String]) {
        if !self.settings.poll {
            return;
        }
        let Ok(mut pollers) = self.pollers.lock() else {
            return;
        };

        pollers.retain(|address, task| {
            let keep = addresses.contains(address);
            if !keep {
                task.abort();
            }
            keep
        });
        for address in addresses {
            if !pollers.contains_key(address) {
                pollers.insert(address.clone(), self.spawn_poller(address.clone()));
            }
        }
    }

    fn spawn_poller(self: &Arc<Self>, address: String) -> JoinHandle<()> {
        let sheriff = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sheriff.settings.report_interval);
            let mut reachable = false;
            loop {
                ticker.tick().await;
                let fetched = tokio::time::timeout(
                    sheriff.settings.command_timeout,
                    sheriff.client.fetch_status(&address),
                )
                .await
                .unwrap_or_else(|_| Err(ProcmanError::unreachable(&address, "status poll timed out")));

                match fetched {
                    Ok(report) => {
                        reachable = true;
                        sheriff.ingest_report(&address, report).await;
                    }
                    Err(e) => {
                        if reachable {
                            log::warn!("Polling {} failed: {}", address, e);
                        } else {
                            log::debug!("Polling {} failed: {}", address, e);
                        }
                        reachable = false;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HostStats, ProcessRuntimeState, ProcessSpec, ProcessStatus, ReportEntry};
    use crate::services::fleet::{ConnectionStatus, ObservedState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    const HOST: &str = "host-a:8000";

    #[derive(Default)]
    struct RecordingClient {
        sent: std::sync::Mutex<Vec<Command>>,
        unreachable: AtomicBool,
    }

    impl RecordingClient {
        fn take(&self) -> Vec<Command> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl DeputyClient for RecordingClient {
        async fn send_command(&self, address: &str, command: &Command) -> Result<Ack> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(ProcmanError::unreachable(address, "connection refused"));
            }
            self.sent.lock().unwrap().push(command.clone());
            let state = match command {
                Command::Remove { .. } => None,
                Command::Stop { .. } | Command::UpdateSpec { .. } => Some(ProcessRuntimeState::default()),
                _ => Some(running(100)),
            };
            Ok(Ack {
                name: command.name().to_string(),
                state,
            })
        }

        async fn fetch_status(&self, address: &str) -> Result<StatusReport> {
            Err(ProcmanError::unreachable(address, "not polled in tests"))
        }
    }

    fn running(pid: u32) -> ProcessRuntimeState {
        ProcessRuntimeState {
            status: ProcessStatus::Running,
            pid: Some(pid),
            ..ProcessRuntimeState::default()
        }
    }

    fn spec(name: &str) -> ProcessSpec {
        ProcessSpec {
            name: name.into(),
            command: "sleep 30".into(),
            working_dir: "/tmp".into(),
            host: HOST.into(),
            autostart: true,
            auto_restart: false,
        }
    }

    fn config(names: &[&str]) -> FleetConfig {
        FleetConfig {
            deputies: vec![HOST.into()],
            processes: names.iter().map(|name| spec(name)).collect(),
        }
    }

    fn report(sequence: u64, names: &[&str]) -> StatusReport {
        StatusReport {
            host: HOST.into(),
            hostname: "host-a".into(),
            boot_id: 1_700_000_000_000,
            sequence,
            generated_at: 0,
            processes: names
                .iter()
                .map(|name| ReportEntry {
                    name: name.to_string(),
                    state: running(200),
                })
                .collect(),
            host_stats: HostStats::default(),
        }
    }

    fn sheriff(settings: SheriffSettings) -> (Arc<Sheriff>, Arc<RecordingClient>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let client = Arc::new(RecordingClient::default());
        let sheriff = Arc::new(Sheriff::new(
            SheriffSettings { poll: false, ..settings },
            client.clone(),
        ));
        (sheriff, client)
    }

    #[tokio::test]
    async fn test_reload_reconciles_only_the_difference() {
        let (sheriff, client) = sheriff(SheriffSettings::default());

        let first = sheriff.reload(config(&["echoloop", "dateprinter"])).await.unwrap();
        assert!(!first.deputies[0].connected);
        assert!(client.take().is_empty());

        // first contact: both processes already run, their specs are handed over
        sheriff.ingest_report(HOST, report(1, &["dateprinter", "echoloop"])).await;
        sheriff.sync_deputy(HOST).await;
        let handed_over = client.take();
        assert_eq!(handed_over.len(), 2);
        assert!(handed_over
            .iter()
            .all(|command| matches!(command, Command::UpdateSpec { .. })));

        let second = sheriff.reload(config(&["echoloop", "logrotator"])).await.unwrap();
        assert!(second.deputies[0].connected);
        assert_eq!(
            client.take(),
            vec![
                Command::Stop { name: "dateprinter".into() },
                Command::Remove { name: "dateprinter".into() },
                Command::UpdateSpec { spec: spec("logrotator") },
            ]
        );

        // same document again is a no-op
        sheriff.reload(config(&["echoloop", "logrotator"])).await.unwrap();
        assert!(client.take().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_previous_config() {
        let (sheriff, client) = sheriff(SheriffSettings::default());
        sheriff.reload(config(&["echoloop"])).await.unwrap();

        let err = sheriff.reload(config(&["echoloop", "echoloop"])).await.unwrap_err();
        assert!(matches!(err, ProcmanError::Validation(_)));
        assert_eq!(sheriff.config().await, config(&["echoloop"]));
        assert!(client.take().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_to_disconnected_deputy_fails_fast() {
        let (sheriff, client) = sheriff(SheriffSettings::default());
        sheriff.reload(config(&["echoloop"])).await.unwrap();

        let started = Instant::now();
        let err = sheriff.dispatch("echoloop", ControlAction::Start).await.unwrap_err();
        assert!(matches!(err, ProcmanError::DeputyUnreachable { .. }));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(client.take().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_merges_ack() {
        let (sheriff, client) = sheriff(SheriffSettings::default());
        sheriff.reload(config(&["echoloop"])).await.unwrap();
        sheriff.ingest_report(HOST, report(1, &[])).await;
        sheriff.sync_deputy(HOST).await;
        client.take();

        let ack = sheriff.dispatch("echoloop", ControlAction::Restart).await.unwrap();
        assert_eq!(ack.state, Some(running(100)));
        assert_eq!(client.take(), vec![Command::Restart { name: "echoloop".into() }]);

        let views = sheriff.processes().await;
        assert_eq!(views[0].observed, ObservedState::Current { state: running(100) });

        let err = sheriff.dispatch("ghost", ControlAction::Stop).await.unwrap_err();
        assert_eq!(err, ProcmanError::NotFound("ghost".into()));
    }

    #[tokio::test]
    async fn test_silence_disconnects_deputy() {
        let (sheriff, _client) = sheriff(SheriffSettings {
            report_interval: Duration::from_millis(50),
            ..SheriffSettings::default()
        });
        sheriff.reload(config(&["echoloop"])).await.unwrap();
        sheriff.ingest_report(HOST, report(1, &["echoloop"])).await;
        assert!(sheriff.check_liveness().await.is_empty());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(sheriff.check_liveness().await, vec![HOST.to_string()]);
        assert_eq!(sheriff.deputies().await[0].connection_status, ConnectionStatus::Disconnected);

        let err = sheriff.dispatch("echoloop", ControlAction::Stop).await.unwrap_err();
        assert!(matches!(err, ProcmanError::DeputyUnreachable { .. }));
    }

    #[tokio::test]
    async fn test_undelivered_reconciliation_is_retried() {
        let (sheriff, client) = sheriff(SheriffSettings::default());
        sheriff.reload(config(&["echoloop"])).await.unwrap();

        client.unreachable.store(true, Ordering::SeqCst);
        sheriff.ingest_report(HOST, report(1, &[])).await;
        sheriff.sync_deputy(HOST).await;
        assert!(client.take().is_empty());

        client.unreachable.store(false, Ordering::SeqCst);
        let outcome = sheriff.ingest_report(HOST, report(2, &[])).await;
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
        sheriff.sync_deputy(HOST).await;
        assert_eq!(client.take(), vec![Command::UpdateSpec { spec: spec("echoloop") }]);
    }

    #[tokio::test]
    async fn test_stale_and_unknown_reports() {
        let (sheriff, _client) = sheriff(SheriffSettings::default());
        sheriff.reload(config(&[])).await.unwrap();

        assert!(matches!(
            sheriff.ingest_report(HOST, report(3, &[])).await,
            IngestOutcome::Accepted { .. }
        ));
        assert_eq!(sheriff.ingest_report(HOST, report(2, &[])).await, IngestOutcome::Stale);
        assert_eq!(
            sheriff.ingest_report("other:8000", report(4, &[])).await,
            IngestOutcome::UnknownDeputy
        );
    }
}
