//! The Sheriff's single view of the fleet.
//!
//! `Fleet` is a plain value: declared configuration plus one `DeputyRecord`
//! per address. The coordinator keeps it behind one lock, so a reload and a
//! report ingestion are each a single transition of this value.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::error::{ProcmanError, Result};
use crate::models::{Ack, Command, FleetConfig, HostStats, ProcessRuntimeState, ProcessSpec, StatusReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// Sheriff-side bookkeeping for one Deputy address
#[derive(Debug, Clone)]
pub struct DeputyRecord {
    pub address: String,
    pub connection_status: ConnectionStatus,
    pub last_seen: Option<Instant>,
    pub hostname: Option<String>,
    pub boot_id: Option<u64>,
    pub last_sequence: u64,
    /// Boot id replaced by `boot_id`; late reports from it are dropped
    previous_boot_id: Option<u64>,
    /// Most recently reported state per process
    pub processes: BTreeMap<String, ProcessRuntimeState>,
    pub host_stats: HostStats,
    /// What the Deputy is believed to hold. `None` marks a process the Deputy
    /// reported but whose spec this Sheriff never sent.
    assigned: BTreeMap<String, Option<ProcessSpec>>,
    needs_sync: bool,
    /// Serializes reconciliation runs against this Deputy
    lane: Arc<Mutex<()>>,
}

impl DeputyRecord {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            connection_status: ConnectionStatus::Disconnected,
            last_seen: None,
            hostname: None,
            boot_id: None,
            last_sequence: 0,
            previous_boot_id: None,
            processes: BTreeMap::new(),
            host_stats: HostStats::default(),
            assigned: BTreeMap::new(),
            needs_sync: true,
            lane: Arc::new(Mutex::new(())),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection_status == ConnectionStatus::Connected
    }

    /// Observed state of `name` as it may be shown to an operator
    pub fn observed(&self, name: &str) -> ObservedState {
        match (self.connection_status, self.processes.get(name)) {
            (ConnectionStatus::Connected, Some(state)) => ObservedState::Current { state: state.clone() },
            (ConnectionStatus::Connected, None) => ObservedState::Unreported,
            (ConnectionStatus::Disconnected, last_known) => ObservedState::Stale {
                last_known: last_known.cloned(),
            },
        }
    }
}

/// What the Sheriff knows about a process right now
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "observed", rename_all = "snake_case")]
pub enum ObservedState {
    /// From the latest report of a connected Deputy
    Current { state: ProcessRuntimeState },
    /// The Deputy is disconnected; `last_known` is history, not truth
    Stale { last_known: Option<ProcessRuntimeState> },
    /// The Deputy is connected but does not report this process
    Unreported,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted { needs_sync: bool },
    /// Not newer than the last accepted report; dropped
    Stale,
    UnknownDeputy,
}

/// Commands that move one Deputy onto the declared configuration
#[derive(Debug, Clone, PartialEq)]
pub struct DeputyPlan {
    pub address: String,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeputyView {
    pub address: String,
    pub connection_status: ConnectionStatus,
    pub last_seen_ms_ago: Option<u64>,
    pub hostname: Option<String>,
    pub boot_id: Option<u64>,
    pub last_sequence: u64,
    pub host_stats: HostStats,
    pub processes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessView {
    pub spec: ProcessSpec,
    pub connection_status: ConnectionStatus,
    #[serde(flatten)]
    pub observed: ObservedState,
}

#[derive(Debug, Default)]
pub struct Fleet {
    config: FleetConfig,
    records: BTreeMap<String, DeputyRecord>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn record(&self, address: &str) -> Option<&DeputyRecord> {
        self.records.get(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    /// Swap in an already validated configuration.
    ///
    /// Records of Deputies that left the fleet are dropped; for those still
    /// connected a retirement plan (stop + remove of everything they hold) is
    /// returned. Every remaining Deputy is flagged for reconciliation.
    pub fn apply_config(&mut self, config: FleetConfig) -> Vec<DeputyPlan> {
        let departed: Vec<String> = self
            .records
            .keys()
            .filter(|address| !config.deputies.contains(address))
            .cloned()
            .collect();

        let mut retirements = Vec::new();
        for address in departed {
            let Some(record) = self.records.remove(&address) else {
                continue;
            };
            if record.is_connected() {
                retirements.push(DeputyPlan {
                    commands: plan_commands(&record.assigned, &BTreeMap::new()),
                    address,
                });
            } else if !record.assigned.is_empty() {
                log::warn!(
                    "Deputy {} left the fleet while disconnected; its {} processes were not stopped",
                    address,
                    record.assigned.len()
                );
            }
        }

        for address in &config.deputies {
            self.records
                .entry(address.clone())
                .or_insert_with(|| DeputyRecord::new(address))
                .needs_sync = true;
        }

        self.config = config;
        retirements
    }

    /// Merge a status report received from `address`
    pub fn ingest(&mut self, address: &str, report: StatusReport, now: Instant) -> IngestOutcome {
        let Some(record) = self.records.get_mut(address) else {
            return IngestOutcome::UnknownDeputy;
        };

        // sequences are only ordered within one boot; any other boot id is a
        // new boot, except the one just replaced
        let rebooted = record.boot_id != Some(report.boot_id);
        let stale = if rebooted {
            record.previous_boot_id == Some(report.boot_id)
        } else {
            report.sequence <= record.last_sequence
        };
        if stale {
            log::debug!(
                "Discarding stale report #{} from {} (boot {}, have #{} of boot {:?})",
                report.sequence,
                address,
                report.boot_id,
                record.last_sequence,
                record.boot_id
            );
            return IngestOutcome::Stale;
        }

        if record.connection_status == ConnectionStatus::Disconnected {
            log::info!("✓ Deputy {} connected ({})", address, report.hostname);
        }

        record.connection_status = ConnectionStatus::Connected;
        record.last_seen = Some(now);
        record.hostname = Some(report.hostname);
        if rebooted {
            record.previous_boot_id = record.boot_id;
        }
        record.boot_id = Some(report.boot_id);
        record.last_sequence = report.sequence;
        record.host_stats = report.host_stats;
        record.processes = report
            .processes
            .into_iter()
            .map(|entry| (entry.name, entry.state))
            .collect();

        if rebooted {
            // a fresh Deputy (or a fresh Sheriff) only knows what was reported
            record.assigned = record.processes.keys().map(|name| (name.clone(), None)).collect();
            record.needs_sync = true;
        }

        IngestOutcome::Accepted {
            needs_sync: record.needs_sync,
        }
    }

    /// Mark Deputies silent for longer than `timeout` as DISCONNECTED.
    /// Returns the addresses that flipped.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let mut flipped = Vec::new();
        for record in self.records.values_mut() {
            if !record.is_connected() {
                continue;
            }
            let silent = record
                .last_seen
                .map_or(true, |seen| now.saturating_duration_since(seen) > timeout);
            if silent {
                record.connection_status = ConnectionStatus::Disconnected;
                flipped.push(record.address.clone());
            }
        }
        flipped
    }

    /// Take the pending reconciliation of a connected Deputy, if any
    pub fn take_plan(&mut self, address: &str) -> Option<DeputyPlan> {
        let desired = self.config.specs_for(address);
        let record = self.records.get_mut(address)?;
        if !record.needs_sync || !record.is_connected() {
            return None;
        }
        record.needs_sync = false;
        Some(DeputyPlan {
            address: address.to_string(),
            commands: plan_commands(&record.assigned, &desired),
        })
    }

    /// Record that `command` was acknowledged by `address`
    pub fn confirm(&mut self, address: &str, ack: &Ack, command: &Command) {
        let Some(record) = self.records.get_mut(address) else {
            return;
        };
        match command {
            Command::UpdateSpec { spec } => {
                record.assigned.insert(spec.name.clone(), Some(spec.clone()));
            }
            Command::Remove { name } => {
                record.assigned.remove(name);
            }
            Command::Start { .. } | Command::Stop { .. } | Command::Restart { .. } => {}
        }
        Self::merge_ack(record, ack);
    }

    /// Cache the state carried by a successful command
    pub fn record_ack(&mut self, address: &str, ack: &Ack) {
        if let Some(record) = self.records.get_mut(address) {
            Self::merge_ack(record, ack);
        }
    }

    fn merge_ack(record: &mut DeputyRecord, ack: &Ack) {
        match &ack.state {
            Some(state) => {
                record.processes.insert(ack.name.clone(), state.clone());
            }
            None => {
                record.processes.remove(&ack.name);
            }
        }
    }

    /// Flag `address` for another reconciliation pass
    pub fn mark_unsynced(&mut self, address: &str) {
        if let Some(record) = self.records.get_mut(address) {
            record.needs_sync = true;
        }
    }

    pub fn lane(&self, address: &str) -> Option<Arc<Mutex<()>>> {
        self.records.get(address).map(|record| record.lane.clone())
    }

    /// The Deputy owning process `name`
    pub fn locate(&self, name: &str) -> Result<&DeputyRecord> {
        let spec = self
            .config
            .find(name)
            .ok_or_else(|| ProcmanError::NotFound(name.to_string()))?;
        self.records
            .get(&spec.host)
            .ok_or_else(|| ProcmanError::NotFound(name.to_string()))
    }

    pub fn deputy_views(&self, now: Instant) -> Vec<DeputyView> {
        self.records
            .values()
            .map(|record| DeputyView {
                address: record.address.clone(),
                connection_status: record.connection_status,
                last_seen_ms_ago: record
                    .last_seen
                    .map(|seen| now.saturating_duration_since(seen).as_millis() as u64),
                hostname: record.hostname.clone(),
                boot_id: record.boot_id,
                last_sequence: record.last_sequence,
                host_stats: record.host_stats.clone(),
                processes: record.processes.len(),
            })
            .collect()
    }

    pub fn process_views(&self) -> Vec<ProcessView> {
        self.config
            .processes
            .iter()
            .map(|spec| match self.records.get(&spec.host) {
                Some(record) => ProcessView {
                    spec: spec.clone(),
                    connection_status: record.connection_status,
                    observed: record.observed(&spec.name),
                },
                None => ProcessView {
                    spec: spec.clone(),
                    connection_status: ConnectionStatus::Disconnected,
                    observed: ObservedState::Stale { last_known: None },
                },
            })
            .collect()
    }
}

/// Set difference between what a Deputy holds and what it should hold.
///
/// Removed processes are stopped then removed, new ones are assigned, changed
/// ones are re-sent without any start or stop, unchanged ones produce
/// nothing. Starting a new `autostart` process is left to the Deputy that
/// receives it.
pub fn plan_commands(
    assigned: &BTreeMap<String, Option<ProcessSpec>>,
    desired: &BTreeMap<String, ProcessSpec>,
) -> Vec<Command> {
    let mut commands = Vec::new();

    for name in assigned.keys().filter(|name| !desired.contains_key(*name)) {
        commands.push(Command::Stop { name: name.clone() });
        commands.push(Command::Remove { name: name.clone() });
    }

    for (name, spec) in desired {
        match assigned.get(name) {
            None => commands.push(Command::UpdateSpec { spec: spec.clone() }),
            Some(Some(known)) if known == spec => {}
            Some(_) => commands.push(Command::UpdateSpec { spec: spec.clone() }),
        }
    }

    commands
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProcessStatus, ReportEntry};

    const HOST: &str = "host-a:8000";

    fn spec(name: &str, autostart: bool) -> ProcessSpec {
        ProcessSpec {
            name: name.into(),
            command: "sleep 30".into(),
            working_dir: "/tmp".into(),
            host: HOST.into(),
            autostart,
            auto_restart: false,
        }
    }

    fn config(specs: Vec<ProcessSpec>) -> FleetConfig {
        FleetConfig {
            deputies: vec![HOST.into()],
            processes: specs,
        }
    }

    fn running(pid: u32) -> ProcessRuntimeState {
        ProcessRuntimeState {
            status: ProcessStatus::Running,
            pid: Some(pid),
            start_time: Some(1_700_000_000_000),
            cpu_percent: 12.5,
            memory_bytes: 4096,
            ..ProcessRuntimeState::default()
        }
    }

    fn report(boot_id: u64, sequence: u64, entries: Vec<(&str, ProcessRuntimeState)>) -> StatusReport {
        StatusReport {
            host: HOST.into(),
            hostname: "host-a".into(),
            boot_id,
            sequence,
            generated_at: 0,
            processes: entries
                .into_iter()
                .map(|(name, state)| ReportEntry {
                    name: name.into(),
                    state,
                })
                .collect(),
            host_stats: HostStats::default(),
        }
    }

    fn ack_for(command: &Command) -> Ack {
        Ack {
            name: command.name().to_string(),
            state: match command {
                Command::Remove { .. } => None,
                _ => Some(ProcessRuntimeState::default()),
            },
        }
    }

    fn confirm_all(fleet: &mut Fleet, plan: &DeputyPlan) {
        for command in &plan.commands {
            fleet.confirm(&plan.address, &ack_for(command), command);
        }
    }

    #[test]
    fn test_report_round_trip() {
        let mut fleet = Fleet::new();
        fleet.apply_config(config(vec![spec("echoloop", true)]));

        let state = running(4242);
        let outcome = fleet.ingest(HOST, report(1, 1, vec![("echoloop", state.clone())]), Instant::now());
        assert_eq!(outcome, IngestOutcome::Accepted { needs_sync: true });

        let record = fleet.record(HOST).unwrap();
        assert_eq!(record.connection_status, ConnectionStatus::Connected);
        assert_eq!(record.processes["echoloop"], state);
        assert_eq!(record.observed("echoloop"), ObservedState::Current { state });
    }

    #[test]
    fn test_stale_reports_are_discarded() {
        let mut fleet = Fleet::new();
        fleet.apply_config(config(vec![]));
        let now = Instant::now();

        fleet.ingest(HOST, report(10, 5, vec![("echoloop", running(1))]), now);
        assert_eq!(fleet.ingest(HOST, report(10, 4, vec![]), now), IngestOutcome::Stale);
        assert_eq!(fleet.ingest(HOST, report(10, 5, vec![]), now), IngestOutcome::Stale);
        assert_eq!(fleet.record(HOST).unwrap().processes.len(), 1);

        // a restarted deputy starts counting again under a new boot id
        let outcome = fleet.ingest(HOST, report(11, 1, vec![]), now);
        assert_eq!(outcome, IngestOutcome::Accepted { needs_sync: true });
        assert!(fleet.record(HOST).unwrap().processes.is_empty());

        // a late report from the boot just replaced
        assert_eq!(fleet.ingest(HOST, report(10, 6, vec![]), now), IngestOutcome::Stale);
        assert_eq!(fleet.record(HOST).unwrap().boot_id, Some(11));
    }

    #[test]
    fn test_reboot_with_a_clock_behind_is_accepted() {
        let mut fleet = Fleet::new();
        fleet.apply_config(config(vec![]));
        let now = Instant::now();

        fleet.ingest(HOST, report(500, 40, vec![]), now);
        fleet.take_plan(HOST);
        fleet.expire(now + Duration::from_secs(60), Duration::from_secs(3));

        let outcome = fleet.ingest(HOST, report(300, 1, vec![("echoloop", running(3))]), now);
        assert_eq!(outcome, IngestOutcome::Accepted { needs_sync: true });
        let record = fleet.record(HOST).unwrap();
        assert_eq!(record.connection_status, ConnectionStatus::Connected);
        assert_eq!(record.boot_id, Some(300));
        assert_eq!(record.last_sequence, 1);
        assert!(fleet.take_plan(HOST).is_some());

        assert_eq!(
            fleet.ingest(HOST, report(300, 2, vec![]), now),
            IngestOutcome::Accepted { needs_sync: false }
        );
        assert_eq!(fleet.ingest(HOST, report(500, 41, vec![]), now), IngestOutcome::Stale);
    }

    #[test]
    fn test_unknown_deputy() {
        let mut fleet = Fleet::new();
        assert_eq!(
            fleet.ingest("nowhere:1", report(1, 1, vec![]), Instant::now()),
            IngestOutcome::UnknownDeputy
        );
    }

    #[test]
    fn test_silence_marks_disconnected_and_stale() {
        let mut fleet = Fleet::new();
        fleet.apply_config(config(vec![spec("echoloop", true)]));
        let seen = Instant::now();
        fleet.ingest(HOST, report(1, 1, vec![("echoloop", running(7))]), seen);

        let timeout = Duration::from_secs(3);
        assert!(fleet.expire(seen + Duration::from_secs(2), timeout).is_empty());
        assert_eq!(fleet.expire(seen + Duration::from_secs(4), timeout), vec![HOST.to_string()]);

        let views = fleet.process_views();
        assert_eq!(views[0].connection_status, ConnectionStatus::Disconnected);
        assert_eq!(
            views[0].observed,
            ObservedState::Stale {
                last_known: Some(running(7))
            }
        );
        // flips only once
        assert!(fleet.expire(seen + Duration::from_secs(5), timeout).is_empty());
    }

    #[test]
    fn test_reload_touches_only_the_difference() {
        let mut fleet = Fleet::new();
        fleet.apply_config(config(vec![spec("echoloop", true), spec("dateprinter", true)]));
        let now = Instant::now();

        // first contact: nothing reported yet, everything is new
        fleet.ingest(HOST, report(1, 1, vec![]), now);
        let plan = fleet.take_plan(HOST).unwrap();
        assert_eq!(plan.commands.len(), 2);
        assert!(plan.commands.iter().all(|c| matches!(c, Command::UpdateSpec { .. })));
        confirm_all(&mut fleet, &plan);
        assert_eq!(fleet.take_plan(HOST), None);

        let mut logrotator = spec("logrotator", true);
        logrotator.command = "sleep 60".into();
        let retired = fleet.apply_config(config(vec![spec("echoloop", true), logrotator.clone()]));
        assert!(retired.is_empty());

        let plan = fleet.take_plan(HOST).unwrap();
        assert_eq!(
            plan.commands,
            vec![
                Command::Stop { name: "dateprinter".into() },
                Command::Remove { name: "dateprinter".into() },
                Command::UpdateSpec { spec: logrotator },
            ]
        );
        assert!(plan.commands.iter().all(|c| c.name() != "echoloop"));
    }

    #[test]
    fn test_reported_processes_are_not_restarted() {
        let mut fleet = Fleet::new();
        fleet.apply_config(config(vec![spec("echoloop", true)]));
        fleet.ingest(HOST, report(1, 1, vec![("echoloop", running(9))]), Instant::now());

        // known by name only: re-send the spec, never start it again
        let plan = fleet.take_plan(HOST).unwrap();
        assert_eq!(plan.commands, vec![Command::UpdateSpec { spec: spec("echoloop", true) }]);
    }

    #[test]
    fn test_changed_spec_is_only_resent() {
        let mut assigned = BTreeMap::new();
        assigned.insert("echoloop".to_string(), Some(spec("echoloop", true)));
        let mut changed = spec("echoloop", true);
        changed.working_dir = "/var/tmp".into();
        let desired = BTreeMap::from([("echoloop".to_string(), changed.clone())]);

        assert_eq!(plan_commands(&assigned, &desired), vec![Command::UpdateSpec { spec: changed }]);
    }

    #[test]
    fn test_disconnected_deputy_has_no_plan() {
        let mut fleet = Fleet::new();
        fleet.apply_config(config(vec![spec("echoloop", true)]));
        assert_eq!(fleet.take_plan(HOST), None);
        assert!(fleet.locate("echoloop").is_ok());
        assert_eq!(
            fleet.locate("ghost").unwrap_err(),
            ProcmanError::NotFound("ghost".into())
        );
    }

    #[test]
    fn test_departed_deputy_is_retired() {
        let mut fleet = Fleet::new();
        fleet.apply_config(config(vec![spec("echoloop", false)]));
        fleet.ingest(HOST, report(1, 1, vec![]), Instant::now());
        let plan = fleet.take_plan(HOST).unwrap();
        confirm_all(&mut fleet, &plan);

        let retired = fleet.apply_config(FleetConfig::default());
        assert_eq!(
            retired,
            vec![DeputyPlan {
                address: HOST.into(),
                commands: vec![
                    Command::Stop { name: "echoloop".into() },
                    Command::Remove { name: "echoloop".into() },
                ],
            }]
        );
        assert!(fleet.record(HOST).is_none());
    }
}
