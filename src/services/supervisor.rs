//! Per-process lifecycle state machine.
//!
//! Every supervised process is driven by one actor task. Commands, child exit
//! notifications and timers all arrive as [`Event`]s on the same queue, so
//! everything that touches one process is serialized while different
//! processes run fully in parallel. The current [`ProcessRuntimeState`] is
//! published through a `watch` channel; readers clone the latest value and
//! never wait on a transition.

use nix::sys::signal::Signal;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ProcmanError, Result};
use crate::models::{now_millis, ProcessRuntimeState, ProcessSpec, ProcessStatus, StartReason};
use crate::services::runner;

#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Time between SIGTERM and SIGKILL on stop
    pub grace_period: Duration,
    /// Time spent in RESTARTING before an automatic respawn
    pub restart_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            restart_delay: Duration::from_secs(1),
        }
    }
}

type Reply = oneshot::Sender<Result<ProcessRuntimeState>>;

enum Event {
    Start { reason: StartReason, reply: Reply },
    Stop { reply: Reply },
    Restart { reply: Reply },
    UpdateSpec { spec: ProcessSpec, reply: oneshot::Sender<bool> },
    /// The child spawned as `generation` terminated
    Exited { generation: u64, code: Option<i32> },
    GraceExpired { generation: u64 },
    /// The rest of the group of `generation` is gone, or stopped waiting for it
    GroupSettled { generation: u64 },
    RestartDue { token: u64 },
    Close,
}

/// Cheap, cloneable access to one supervisor actor
#[derive(Clone)]
pub struct SupervisorHandle {
    name: String,
    events: mpsc::UnboundedSender<Event>,
    state: watch::Receiver<ProcessRuntimeState>,
    spec: watch::Receiver<ProcessSpec>,
}

impl SupervisorHandle {
    /// Start the actor for `spec`; the process itself stays STOPPED
    pub fn spawn(spec: ProcessSpec, settings: SupervisorSettings) -> Self {
        Self::spawn_on(spec, settings, &Handle::current())
    }

    /// Like [`SupervisorHandle::spawn`], with the actor and its children
    /// bound to `runtime` instead of the caller's one
    pub fn spawn_on(spec: ProcessSpec, settings: SupervisorSettings, runtime: &Handle) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ProcessRuntimeState::default());
        let (spec_tx, spec_rx) = watch::channel(spec.clone());

        let supervisor = Supervisor {
            spec,
            settings,
            state: ProcessRuntimeState::default(),
            state_tx,
            spec_tx,
            events: events_tx.clone(),
            generation: 0,
            restart_token: 0,
            stop_waiters: Vec::new(),
            start_waiters: Vec::new(),
            start_queued: false,
            leader_exited: false,
        };
        let name = supervisor.spec.name.clone();
        runtime.spawn(supervisor.run(events_rx));

        Self {
            name,
            events: events_tx,
            state: state_rx,
            spec: spec_rx,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn snapshot(&self) -> ProcessRuntimeState {
        self.state.borrow().clone()
    }

    pub fn spec(&self) -> ProcessSpec {
        self.spec.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ProcessRuntimeState> {
        self.state.clone()
    }

    pub async fn start(&self, reason: StartReason) -> Result<ProcessRuntimeState> {
        self.request(|reply| Event::Start { reason, reply }).await
    }

    /// Resolves once the process reached STOPPED (or was not running)
    pub async fn stop(&self) -> Result<ProcessRuntimeState> {
        self.request(|reply| Event::Stop { reply }).await
    }

    pub async fn restart(&self) -> Result<ProcessRuntimeState> {
        self.request(|reply| Event::Restart { reply }).await
    }

    /// Replace the spec; a running process keeps running with the old one.
    /// Returns whether anything changed.
    pub async fn update_spec(&self, spec: ProcessSpec) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::UpdateSpec { spec, reply })
            .map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())
    }

    /// Terminate the actor. Callers stop the process first.
    pub fn close(&self) {
        let _ = self.events.send(Event::Close);
    }

    async fn request(&self, make: impl FnOnce(Reply) -> Event) -> Result<ProcessRuntimeState> {
        let (reply, rx) = oneshot::channel();
        self.events.send(make(reply)).map_err(|_| self.gone())?;
        rx.await.map_err(|_| self.gone())?
    }

    fn gone(&self) -> ProcmanError {
        ProcmanError::NotFound(self.name.clone())
    }
}

struct Supervisor {
    spec: ProcessSpec,
    settings: SupervisorSettings,
    state: ProcessRuntimeState,
    state_tx: watch::Sender<ProcessRuntimeState>,
    spec_tx: watch::Sender<ProcessSpec>,
    /// Own sender, used by exit watchers and timers
    events: mpsc::UnboundedSender<Event>,
    /// Bumped on every spawn; events from older children are ignored
    generation: u64,
    /// Bumped whenever a scheduled automatic restart is cancelled or fired
    restart_token: u64,
    stop_waiters: Vec<Reply>,
    /// Restart callers waiting for the start that follows a stop
    start_waiters: Vec<Reply>,
    start_queued: bool,
    /// Set while STOPPING once the leader is gone but its group is not
    leader_exited: bool,
}

impl Supervisor {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            match event {
                Event::Start { reason, reply } => {
                    let result = self.on_start(reason);
                    let _ = reply.send(result);
                }
                Event::Stop { reply } => self.on_stop(reply),
                Event::Restart { reply } => self.on_restart(reply),
                Event::UpdateSpec { spec, reply } => {
                    let changed = self.spec != spec;
                    if changed {
                        log::info!("Spec of '{}' updated (takes effect on next start)", self.spec.name);
                        self.spec = spec;
                        self.spec_tx.send_replace(self.spec.clone());
                    }
                    let _ = reply.send(changed);
                }
                Event::Exited { generation, code } => self.on_exit(generation, code),
                Event::GraceExpired { generation } => self.on_grace_expired(generation),
                Event::GroupSettled { generation } => self.on_group_settled(generation),
                Event::RestartDue { token } => self.on_restart_due(token),
                Event::Close => break,
            }
        }

        if let Some(pid) = self.state.pid {
            log::warn!("Supervisor for '{}' closed with pid {} alive, killing it", self.spec.name, pid);
            runner::kill_group(pid);
        }
        log::debug!("Supervisor for '{}' finished", self.spec.name);
    }

    fn publish(&self) {
        self.state_tx.send_replace(self.state.clone());
    }

    fn on_start(&mut self, reason: StartReason) -> Result<ProcessRuntimeState> {
        match self.state.status {
            ProcessStatus::Stopped | ProcessStatus::Crashed => self.launch(reason),
            _ => Ok(self.state.clone()),
        }
    }

    fn on_stop(&mut self, reply: Reply) {
        match self.state.status {
            ProcessStatus::Running | ProcessStatus::Starting | ProcessStatus::Stopping => {
                // a stop supersedes a restart still waiting for its start
                self.start_queued = false;
                self.stop_waiters.push(reply);
                self.begin_stop();
            }
            ProcessStatus::Restarting | ProcessStatus::Crashed => {
                self.restart_token += 1;
                self.state.status = ProcessStatus::Stopped;
                log::info!("Process '{}' stopped", self.spec.name);
                self.publish();
                let _ = reply.send(Ok(self.state.clone()));
            }
            ProcessStatus::Stopped => {
                let _ = reply.send(Ok(self.state.clone()));
            }
        }
    }

    fn on_restart(&mut self, reply: Reply) {
        match self.state.status {
            ProcessStatus::Running | ProcessStatus::Starting | ProcessStatus::Stopping => {
                self.start_queued = true;
                self.start_waiters.push(reply);
                self.begin_stop();
            }
            ProcessStatus::Restarting => {
                self.restart_token += 1;
                let _ = reply.send(self.launch(StartReason::Command));
            }
            ProcessStatus::Stopped | ProcessStatus::Crashed => {
                let _ = reply.send(self.launch(StartReason::Command));
            }
        }
    }

    fn launch(&mut self, reason: StartReason) -> Result<ProcessRuntimeState> {
        self.state.status = ProcessStatus::Starting;
        self.publish();

        match runner::spawn(&self.spec) {
            Ok(spawned) => {
                self.generation += 1;
                let generation = self.generation;

                self.state.status = ProcessStatus::Running;
                self.state.pid = Some(spawned.pid);
                self.state.start_time = Some(now_millis());
                self.state.start_reason = Some(reason);
                self.state.failure = None;
                log::info!(
                    "Process '{}' running (pid {}, {:?})",
                    self.spec.name,
                    spawned.pid,
                    reason
                );

                let events = self.events.clone();
                tokio::spawn(async move {
                    let code = runner::wait(spawned.child).await;
                    let _ = events.send(Event::Exited { generation, code });
                });

                self.publish();
                Ok(self.state.clone())
            }
            Err(failure) => {
                log::warn!("Failed to spawn '{}': {}", self.spec.name, failure);
                self.state.status = ProcessStatus::Crashed;
                self.state.clear_process();
                self.state.failure = Some(failure.clone());
                self.publish();
                Err(ProcmanError::SpawnFailure {
                    name: self.spec.name.clone(),
                    reason: failure,
                })
            }
        }
    }

    fn begin_stop(&mut self) {
        if self.state.status == ProcessStatus::Stopping {
            return;
        }
        let Some(pid) = self.state.pid else {
            self.finish_stop();
            return;
        };

        self.state.status = ProcessStatus::Stopping;
        self.publish();
        log::info!("Stopping '{}' (pid {})", self.spec.name, pid);
        if let Err(e) = runner::signal_group(pid, Signal::SIGTERM) {
            log::warn!("Failed to send SIGTERM to '{}' (pid {}): {}", self.spec.name, pid, e);
        }

        let events = self.events.clone();
        let generation = self.generation;
        let grace = self.settings.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(Event::GraceExpired { generation });
        });
    }

    /// STOPPING → STOPPED, then run a start queued by restart
    fn finish_stop(&mut self) {
        self.leader_exited = false;
        self.state.status = ProcessStatus::Stopped;
        self.state.clear_process();
        log::info!("Process '{}' stopped", self.spec.name);
        self.publish();

        for waiter in self.stop_waiters.drain(..) {
            let _ = waiter.send(Ok(self.state.clone()));
        }

        let result = if std::mem::take(&mut self.start_queued) {
            self.launch(StartReason::Command)
        } else {
            Ok(self.state.clone())
        };
        for waiter in self.start_waiters.drain(..) {
            let _ = waiter.send(result.clone());
        }
    }

    fn on_grace_expired(&mut self, generation: u64) {
        if generation != self.generation || self.state.status != ProcessStatus::Stopping {
            return;
        }
        if self.leader_exited {
            self.on_group_settled(generation);
            return;
        }
        if let Some(pid) = self.state.pid {
            log::warn!(
                "Process '{}' (pid {}) ignored SIGTERM for {:?}, sending SIGKILL",
                self.spec.name,
                pid,
                self.settings.grace_period
            );
            if let Err(e) = runner::signal_group(pid, Signal::SIGKILL) {
                log::warn!("Failed to send SIGKILL to '{}': {}", self.spec.name, e);
            }
        }
    }

    fn on_exit(&mut self, generation: u64, code: Option<i32>) {
        if generation != self.generation || !self.state.status.has_pid() {
            log::debug!("Ignoring stale exit of '{}' (generation {})", self.spec.name, generation);
            return;
        }

        self.state.last_exit_code = code;
        if self.state.status == ProcessStatus::Stopping {
            match self.state.pid.filter(|pid| runner::group_alive(*pid)) {
                Some(pid) => self.await_group(pid),
                None => self.finish_stop(),
            }
            return;
        }

        if let Some(pid) = self.state.pid {
            runner::kill_group(pid);
        }
        self.state.clear_process();
        if self.spec.auto_restart {
            self.state.status = ProcessStatus::Crashed;
            self.publish();
            log::warn!(
                "Process '{}' exited unexpectedly (code {:?}), restarting in {:?}",
                self.spec.name,
                code,
                self.settings.restart_delay
            );

            self.state.status = ProcessStatus::Restarting;
            self.publish();
            self.restart_token += 1;
            let token = self.restart_token;
            let events = self.events.clone();
            let delay = self.settings.restart_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = events.send(Event::RestartDue { token });
            });
        } else {
            log::warn!("Process '{}' exited unexpectedly (code {:?})", self.spec.name, code);
            self.state.status = ProcessStatus::Crashed;
            self.publish();
        }
    }

    /// The leader exited during a stop while other members of its group
    /// remain; keep STOPPING until they are gone, for at most one more grace
    /// period.
    fn await_group(&mut self, pid: u32) {
        log::info!(
            "Leader of '{}' exited, waiting for the rest of process group {}",
            self.spec.name,
            pid
        );
        self.leader_exited = true;

        let events = self.events.clone();
        let generation = self.generation;
        let deadline = tokio::time::Instant::now() + self.settings.grace_period;
        tokio::spawn(async move {
            while runner::group_alive(pid) && tokio::time::Instant::now() < deadline {
                if events.is_closed() {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let _ = events.send(Event::GroupSettled { generation });
        });
    }

    fn on_group_settled(&mut self, generation: u64) {
        if generation != self.generation
            || self.state.status != ProcessStatus::Stopping
            || !self.leader_exited
        {
            return;
        }
        if let Some(pid) = self.state.pid {
            if runner::group_alive(pid) {
                log::warn!(
                    "Process group of '{}' ({}) outlived its leader, sending SIGKILL",
                    self.spec.name,
                    pid
                );
                runner::kill_group(pid);
            }
        }
        self.finish_stop();
    }

    fn on_restart_due(&mut self, token: u64) {
        if token != self.restart_token || self.state.status != ProcessStatus::Restarting {
            return;
        }
        self.state.restart_count += 1;
        // a failed respawn leaves the process CRASHED and is not retried
        let _ = self.launch(StartReason::AutoRestart);
    }
}
