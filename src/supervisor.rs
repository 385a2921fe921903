//! The process supervisor.
//!
//! One control-loop task owns the worker table. Operators talk to it through a
//! [`SupervisorHandle`]; worker processes talk to it through the notices their
//! plumbing tasks send (see [`crate::process`]). Nothing else touches the table,
//! so there are no locks around it.
//!
//! # Worker lifecycle
//!
//! ```text
//! Starting -> Ready -> Draining -> Stopped
//!     \         \         \
//!      +---------+---------+-----> Crashed
//! ```
//!
//! A crashed worker is never reused; its replacement gets a new [`WorkerId`].
//!
//! # Rolling reload
//!
//! A reload spawns one replacement at a time. When the replacement reports
//! ready, one old worker is retired in the same control-loop step, so the
//! table never holds more Ready workers than the configured count.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{SupervisorConfig, WorkerBootConfig};
use crate::control::{ControlCommand, ShutdownMode, WorkerEvent, WorkerStatsSnapshot};
use crate::error::{SpawnError, SupervisorError};
use crate::listener::{self, ListenerHandle};
use crate::policy::{RestartBudget, RestartDecision};
use crate::process::{self, ExitInfo, WorkerNotice, WorkerProcess};

/// Control loop housekeeping interval (health checks, deadlines, due restarts)
const TICK_INTERVAL_MS: u64 = 100;

/// Extra time a draining worker gets beyond its own grace period before it is killed
const DRAIN_SLACK_MS: u64 = 2000;

/// How long an immediate stop may take before the process is killed
const IMMEDIATE_KILL_AFTER_MS: u64 = 1000;

/// Supervisor-assigned worker identity. Never reused within one supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a worker record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Spawned, not yet accepting
    Starting,
    /// Accepting connections
    Ready,
    /// Told to stop, finishing in-flight work
    Draining,
    /// Exited after a requested stop
    Stopped,
    /// Exited or was killed without being asked to stop
    Crashed,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Crashed)
    }

    /// Counts towards the pool size
    pub fn accepts_work(self) -> bool {
        matches!(self, WorkerState::Starting | WorkerState::Ready)
    }

    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        match (self, next) {
            (Starting, Ready) | (Starting, Draining) | (Ready, Draining) => true,
            (Draining, Stopped) => true,
            (current, Crashed) => !current.is_terminal(),
            _ => false,
        }
    }
}

/// Per-worker entry in a [`StatusSnapshot`]
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub generation: u64,
    pub pid: u32,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub restart_count: u32,
    /// Seconds since the worker reported ready
    pub ready_secs: Option<u64>,
    pub last_heartbeat_ms: u64,
    pub stats: WorkerStatsSnapshot,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub bind: SocketAddr,
    pub target_workers: usize,
    pub generation: u64,
    pub ready: usize,
    pub starting: usize,
    pub draining: usize,
    pub total_restarts: u64,
    pub restart_budget_exhausted: bool,
    pub reload_in_progress: bool,
    pub shutting_down: bool,
    pub uptime_secs: u64,
    pub workers: Vec<WorkerStatus>,
}

/// Result of asking for a reload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ReloadOutcome {
    Started { generation: u64 },
    AlreadyInProgress,
}

/// Why the control loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// An operator asked for shutdown
    OperatorShutdown,
    /// Workers kept crashing and none are left
    RestartBudgetExhausted,
}

impl ExitReason {
    pub fn exit_code(self) -> i32 {
        match self {
            ExitReason::OperatorShutdown => 0,
            ExitReason::RestartBudgetExhausted => 3,
        }
    }
}

enum Operation {
    Reload {
        reply: oneshot::Sender<Result<ReloadOutcome, SupervisorError>>,
    },
    ReloadOne {
        id: WorkerId,
        reply: oneshot::Sender<Result<ReloadOutcome, SupervisorError>>,
    },
    Shutdown {
        mode: ShutdownMode,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<StatusSnapshot>,
    },
}

/// Cloneable operator handle to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    ops: mpsc::UnboundedSender<Operation>,
    addr: SocketAddr,
}

impl SupervisorHandle {
    /// Address of the shared listener
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start a rolling replacement of every worker
    pub async fn reload(&self) -> Result<ReloadOutcome, SupervisorError> {
        self.request(|reply| Operation::Reload { reply }).await?
    }

    /// Replace one worker the same way a reload does
    pub async fn reload_one(&self, id: WorkerId) -> Result<ReloadOutcome, SupervisorError> {
        self.request(|reply| Operation::ReloadOne { id, reply }).await?
    }

    /// Begin shutting the pool down. Returns once the request is accepted;
    /// the control-loop task finishes when the last worker is gone.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), SupervisorError> {
        self.request(|reply| Operation::Shutdown { mode, reply }).await
    }

    pub async fn status(&self) -> Result<StatusSnapshot, SupervisorError> {
        self.request(|reply| Operation::Status { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Operation,
    ) -> Result<T, SupervisorError> {
        let (tx, rx) = oneshot::channel();
        self.ops.send(make(tx)).map_err(|_| SupervisorError::Gone)?;
        rx.await.map_err(|_| SupervisorError::Gone)
    }
}

struct WorkerRecord {
    id: WorkerId,
    generation: u64,
    process: WorkerProcess,
    state: WorkerState,
    spawned_at: Instant,
    started_at: DateTime<Utc>,
    restart_count: u32,
    ready_at: Option<Instant>,
    last_heartbeat: Instant,
    last_ping: Option<Instant>,
    stats: WorkerStatsSnapshot,
    stop_deadline: Option<Instant>,
    killed: bool,
}

impl WorkerRecord {
    fn transition(&mut self, next: WorkerState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        debug!(worker_id = %self.id, from = ?self.state, to = ?next, "Worker state change");
        self.state = next;
        true
    }

    fn kill(&mut self) {
        if !self.killed {
            self.process.kill();
            self.killed = true;
        }
    }

    fn status(&self, now: Instant) -> WorkerStatus {
        WorkerStatus {
            id: self.id,
            generation: self.generation,
            pid: self.process.pid(),
            state: self.state,
            started_at: self.started_at,
            uptime_secs: now.duration_since(self.spawned_at).as_secs(),
            restart_count: self.restart_count,
            ready_secs: self.ready_at.map(|at| now.duration_since(at).as_secs()),
            last_heartbeat_ms: now.duration_since(self.last_heartbeat).as_millis() as u64,
            stats: self.stats,
        }
    }
}

struct PendingRestart {
    due: Instant,
    restart_count: u32,
}

/// Where a restart granted by the budget goes
enum RestartSlot {
    Pool { restart_count: u32 },
    Replacement,
}

struct Rollout {
    /// Workers still to be retired, oldest first
    targets: VecDeque<WorkerId>,
    /// Replacement currently starting
    replacement: Option<WorkerId>,
    /// Backoff before the next replacement after a failed one
    retry_at: Option<Instant>,
    replaced: usize,
}

struct ShutdownState {
    mode: ShutdownMode,
    deadline: Instant,
}

pub struct Supervisor {
    config: SupervisorConfig,
    boot: WorkerBootConfig,
    listener: ListenerHandle,
    workers: BTreeMap<WorkerId, WorkerRecord>,
    next_id: u64,
    generation: u64,
    budget: RestartBudget,
    pending: Vec<PendingRestart>,
    rollout: Option<Rollout>,
    shutdown: Option<ShutdownState>,
    exit_reason: ExitReason,
    startup: Option<oneshot::Sender<Result<(), SupervisorError>>>,
    notices: mpsc::UnboundedSender<WorkerNotice>,
    started_at: Instant,
}

impl Supervisor {
    /// Bind the listener, spawn the pool and wait (up to the startup timeout)
    /// for every worker to report ready.
    ///
    /// The returned task resolves when the supervisor has shut down.
    pub async fn start(
        config: SupervisorConfig,
    ) -> Result<(SupervisorHandle, JoinHandle<ExitReason>), SupervisorError> {
        let listener = listener::bind(config.bind, config.backlog)?;
        let addr = listener.local_addr();
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let startup_timeout = config.startup_timeout;
        let worker_count = config.worker_count;

        let mut supervisor = Supervisor {
            boot: config.boot_config(),
            budget: RestartBudget::new(config.restart),
            config,
            listener,
            workers: BTreeMap::new(),
            next_id: 1,
            generation: 1,
            pending: Vec::new(),
            rollout: None,
            shutdown: None,
            exit_reason: ExitReason::OperatorShutdown,
            startup: Some(ready_tx),
            notices: notices_tx,
            started_at: Instant::now(),
        };

        info!(workers = worker_count, addr = %addr, "Starting worker pool");
        let now = Instant::now();
        for _ in 0..worker_count {
            if supervisor.budget.is_exhausted() {
                break;
            }
            // Failures are charged and retried like crashes
            supervisor.spawn_or_charge(now, 0);
        }
        supervisor.check_startup();
        supervisor.check_exhausted(now);

        let task = tokio::spawn(supervisor.run(ops_rx, notices_rx));
        let handle = SupervisorHandle { ops: ops_tx, addr };

        match tokio::time::timeout(startup_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => info!(workers = worker_count, "All workers ready"),
            Ok(Ok(Err(e))) => {
                let _ = task.await;
                return Err(e);
            }
            Ok(Err(_)) => return Err(SupervisorError::Gone),
            Err(_) => warn!(
                timeout_secs = startup_timeout.as_secs(),
                "Not every worker became ready before the startup timeout"
            ),
        }

        Ok((handle, task))
    }

    async fn run(
        mut self,
        mut ops: mpsc::UnboundedReceiver<Operation>,
        mut notices: mpsc::UnboundedReceiver<WorkerNotice>,
    ) -> ExitReason {
        let mut tick = tokio::time::interval(Duration::from_millis(TICK_INTERVAL_MS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(op) = ops.recv() => self.handle_operation(op, Instant::now()),
                Some(notice) = notices.recv() => match notice {
                    WorkerNotice::Event(id, event) => self.on_event(id, event, Instant::now()),
                    WorkerNotice::Exited(id, exit) => self.on_exit(id, exit, Instant::now()),
                },
                _ = tick.tick() => self.on_tick(Instant::now()),
            }

            if self.shutdown.is_some() && self.workers.is_empty() {
                break;
            }
        }

        info!(
            reason = ?self.exit_reason,
            total_restarts = self.budget.total_restarts(),
            uptime_secs = self.started_at.elapsed().as_secs(),
            "Worker pool stopped, closing listener"
        );
        self.exit_reason
    }

    fn handle_operation(&mut self, op: Operation, now: Instant) {
        match op {
            Operation::Reload { reply } => {
                let _ = reply.send(self.start_reload(now));
            }
            Operation::ReloadOne { id, reply } => {
                let _ = reply.send(self.start_reload_one(id, now));
            }
            Operation::Shutdown { mode, reply } => {
                self.begin_shutdown(mode, now);
                let _ = reply.send(());
            }
            Operation::Status { reply } => {
                let _ = reply.send(self.snapshot(now));
            }
        }
    }

    fn start_reload(&mut self, now: Instant) -> Result<ReloadOutcome, SupervisorError> {
        if self.shutdown.is_some() {
            return Err(SupervisorError::ShuttingDown);
        }
        if self.rollout.is_some() {
            info!("Reload requested while one is running, ignoring");
            return Ok(ReloadOutcome::AlreadyInProgress);
        }

        self.budget.reset();
        self.generation += 1;
        let generation = self.generation;
        let targets: VecDeque<WorkerId> = self
            .workers
            .values()
            .filter(|r| r.state.accepts_work() && r.generation < generation)
            .map(|r| r.id)
            .collect();

        info!(generation, workers = targets.len(), "Rolling reload started");
        self.rollout = Some(Rollout {
            targets,
            replacement: None,
            retry_at: None,
            replaced: 0,
        });

        // Top up first, then begin replacing
        self.maintain_pool(now);
        self.advance_rollout(now);
        Ok(ReloadOutcome::Started { generation })
    }

    fn start_reload_one(
        &mut self,
        id: WorkerId,
        now: Instant,
    ) -> Result<ReloadOutcome, SupervisorError> {
        if self.shutdown.is_some() {
            return Err(SupervisorError::ShuttingDown);
        }
        match self.workers.get(&id) {
            Some(record) if record.state.accepts_work() => {}
            _ => return Err(SupervisorError::UnknownWorker(id)),
        }
        if self.rollout.is_some() {
            info!(worker_id = %id, "Worker reload requested while a reload is running, ignoring");
            return Ok(ReloadOutcome::AlreadyInProgress);
        }

        info!(worker_id = %id, "Replacing worker");
        self.rollout = Some(Rollout {
            targets: VecDeque::from([id]),
            replacement: None,
            retry_at: None,
            replaced: 0,
        });
        self.advance_rollout(now);
        Ok(ReloadOutcome::Started {
            generation: self.generation,
        })
    }

    fn begin_shutdown(&mut self, mode: ShutdownMode, now: Instant) {
        if let Some(state) = self.shutdown.as_mut() {
            if mode == ShutdownMode::Immediate && state.mode == ShutdownMode::Graceful {
                info!("Escalating to immediate shutdown");
                state.mode = ShutdownMode::Immediate;
                state.deadline = state
                    .deadline
                    .min(now + Duration::from_millis(IMMEDIATE_KILL_AFTER_MS));
                self.broadcast_stop(ControlCommand::ImmediateStop, now);
            } else {
                debug!(?mode, "Shutdown already in progress");
            }
            return;
        }

        let (command, deadline) = match mode {
            ShutdownMode::Graceful => (
                ControlCommand::GracefulStop,
                now + self.config.graceful_timeout + Duration::from_millis(DRAIN_SLACK_MS),
            ),
            ShutdownMode::Immediate => (
                ControlCommand::ImmediateStop,
                now + Duration::from_millis(IMMEDIATE_KILL_AFTER_MS),
            ),
        };

        info!(?mode, workers = self.workers.len(), "Shutting down worker pool");
        self.shutdown = Some(ShutdownState { mode, deadline });
        self.pending.clear();
        if self.rollout.take().is_some() {
            info!("Rolling reload cancelled by shutdown");
        }
        if let Some(tx) = self.startup.take() {
            let _ = tx.send(Err(SupervisorError::ShuttingDown));
        }
        self.broadcast_stop(command, now);
    }

    fn broadcast_stop(&mut self, command: ControlCommand, now: Instant) {
        let deadline = self.shutdown.as_ref().map(|s| s.deadline).unwrap_or(now);
        for record in self.workers.values_mut() {
            if record.state.is_terminal() {
                continue;
            }
            if let Err(e) = record.process.send(command) {
                warn!(worker_id = %record.id, error = %e, "Control pipe closed, falling back to SIGTERM");
                record.process.terminate();
            }
            record.transition(WorkerState::Draining);
            record.stop_deadline = Some(deadline);
        }
    }

    fn on_event(&mut self, id: WorkerId, event: WorkerEvent, now: Instant) {
        match event {
            WorkerEvent::Ready { pid } => self.on_ready(id, pid, now),
            WorkerEvent::Heartbeat { stats } => {
                if let Some(record) = self.workers.get_mut(&id) {
                    record.last_heartbeat = now;
                    record.stats = stats;
                }
            }
            WorkerEvent::Draining { in_flight } => {
                if let Some(record) = self.workers.get_mut(&id) {
                    record.last_heartbeat = now;
                    if record.transition(WorkerState::Draining) {
                        // Stopped by someone else (e.g. a signal sent directly to it)
                        info!(worker_id = %id, in_flight, "Worker began draining on its own");
                        record.stop_deadline = Some(
                            now + self.config.graceful_timeout
                                + Duration::from_millis(DRAIN_SLACK_MS),
                        );
                    } else {
                        debug!(worker_id = %id, in_flight, "Worker draining");
                    }
                }
                self.maintain_pool(now);
            }
            WorkerEvent::Stopped { forced } => {
                if forced > 0 {
                    warn!(worker_id = %id, forced, "Worker force-closed connections at the deadline");
                } else {
                    debug!(worker_id = %id, "Worker drained cleanly");
                }
            }
        }
    }

    fn on_ready(&mut self, id: WorkerId, pid: u32, now: Instant) {
        match self.workers.get(&id) {
            Some(record) if record.state == WorkerState::Starting => {}
            Some(record) => {
                debug!(worker_id = %id, state = ?record.state, "Ignoring ready from worker");
                return;
            }
            None => return,
        }

        let is_replacement = self
            .rollout
            .as_ref()
            .map_or(false, |r| r.replacement == Some(id));

        if is_replacement {
            // Retire one old worker in the same step this one becomes ready
            if let Some(target) = self.next_rollout_target() {
                self.retire(target, now, "replaced by reload");
            }
            if let Some(rollout) = self.rollout.as_mut() {
                rollout.replacement = None;
                rollout.replaced += 1;
            }
        } else if self.count(WorkerState::Ready) >= self.config.worker_count {
            self.retire(id, now, "pool already full");
            return;
        }

        if let Some(record) = self.workers.get_mut(&id) {
            record.transition(WorkerState::Ready);
            record.ready_at = Some(now);
            record.last_heartbeat = now;
            info!(
                worker_id = %id,
                pid,
                generation = record.generation,
                startup_ms = now.duration_since(record.spawned_at).as_millis() as u64,
                "Worker ready"
            );
        }

        self.check_startup();
        self.advance_rollout(now);
    }

    fn on_exit(&mut self, id: WorkerId, exit: ExitInfo, now: Instant) {
        let state = match self.workers.get(&id) {
            Some(record) => record.state,
            None => {
                debug!(worker_id = %id, %exit, "Exit for unknown worker");
                return;
            }
        };

        match state {
            WorkerState::Starting | WorkerState::Ready => {
                self.fail_worker(id, &format!("exited unexpectedly with {}", exit), now);
            }
            WorkerState::Draining => {
                if let Some(record) = self.workers.get_mut(&id) {
                    if exit.success() || record.killed {
                        record.transition(WorkerState::Stopped);
                        info!(worker_id = %id, %exit, forced = record.killed, "Worker stopped");
                    } else {
                        record.transition(WorkerState::Crashed);
                        warn!(worker_id = %id, %exit, "Worker failed while draining");
                    }
                }
            }
            WorkerState::Stopped | WorkerState::Crashed => {}
        }

        if let Some(record) = self.workers.remove(&id) {
            debug!(
                worker_id = %id,
                state = ?record.state,
                uptime_secs = now.duration_since(record.spawned_at).as_secs(),
                "Worker record removed"
            );
        }

        self.maintain_pool(now);
        self.advance_rollout(now);
        self.check_exhausted(now);
    }

    fn on_tick(&mut self, now: Instant) {
        let startup_timeout = self.config.startup_timeout;
        let heartbeat_timeout = self.config.heartbeat_timeout;
        let heartbeat_interval = self.config.heartbeat_interval;
        let mut failed = Vec::new();

        for record in self.workers.values_mut() {
            let silent = now.duration_since(record.last_heartbeat);
            match record.state {
                WorkerState::Starting if now.duration_since(record.spawned_at) > startup_timeout => {
                    failed.push((record.id, "startup timeout"));
                }
                WorkerState::Ready | WorkerState::Draining if silent > heartbeat_timeout => {
                    failed.push((record.id, "heartbeat timeout"));
                }
                WorkerState::Ready if silent > heartbeat_interval * 2 => {
                    let due = record
                        .last_ping
                        .map_or(true, |at| now.duration_since(at) > heartbeat_interval);
                    if due {
                        let _ = record.process.send(ControlCommand::Heartbeat);
                        record.last_ping = Some(now);
                    }
                }
                _ => {}
            }

            if record.state == WorkerState::Draining
                && !record.killed
                && record.stop_deadline.map_or(false, |d| now >= d)
            {
                warn!(worker_id = %record.id, pid = record.process.pid(), "Worker exceeded its grace period, killing");
                record.kill();
            }
        }

        for (id, reason) in failed {
            self.fail_worker(id, reason, now);
        }

        if let Some(deadline) = self.shutdown.as_ref().map(|s| s.deadline) {
            if now >= deadline {
                for record in self.workers.values_mut() {
                    if !record.killed {
                        warn!(worker_id = %record.id, pid = record.process.pid(), "Shutdown deadline reached, killing worker");
                        record.kill();
                    }
                }
            }
        }

        self.maintain_pool(now);
        self.advance_rollout(now);
        self.check_exhausted(now);
    }

    /// Mark a worker crashed, kill it and charge the restart budget
    fn fail_worker(&mut self, id: WorkerId, reason: &str, now: Instant) {
        let Some(record) = self.workers.get_mut(&id) else {
            return;
        };
        let previous = record.state;
        if !record.transition(WorkerState::Crashed) {
            return;
        }
        record.kill();
        warn!(
            worker_id = %id,
            pid = record.process.pid(),
            state = ?previous,
            reason,
            "Worker crashed"
        );

        if !previous.accepts_work() {
            // It was on its way out anyway
            return;
        }

        let restart_count = record.restart_count + 1;
        let slot = match self.rollout.as_mut() {
            Some(rollout) if rollout.replacement == Some(id) => {
                rollout.replacement = None;
                RestartSlot::Replacement
            }
            _ => RestartSlot::Pool { restart_count },
        };
        self.account_crash(now, slot);
    }

    fn account_crash(&mut self, now: Instant, slot: RestartSlot) {
        if self.shutdown.is_some() {
            return;
        }

        match self.budget.on_crash(now) {
            RestartDecision::Restart { delay, attempt } => {
                info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt,
                    max_restarts = self.config.restart.max_restarts,
                    "Scheduling worker restart"
                );
                match slot {
                    RestartSlot::Pool { restart_count } => self.pending.push(PendingRestart {
                        due: now + delay,
                        restart_count,
                    }),
                    RestartSlot::Replacement => {
                        if let Some(rollout) = self.rollout.as_mut() {
                            rollout.retry_at = Some(now + delay);
                        }
                    }
                }
            }
            RestartDecision::Exhausted => {
                error!(
                    max_restarts = self.config.restart.max_restarts,
                    window_secs = self.config.restart.window.as_secs(),
                    "Restart budget exhausted, not restarting workers until reload"
                );
                self.pending.clear();
            }
        }
    }

    /// Keep `worker_count` workers starting or ready
    fn maintain_pool(&mut self, now: Instant) {
        if self.shutdown.is_some() || self.budget.is_exhausted() {
            return;
        }

        let mut due = Vec::new();
        self.pending.retain(|p| {
            if p.due <= now {
                due.push(p.restart_count);
                false
            } else {
                true
            }
        });

        for restart_count in due {
            if self.budget.is_exhausted() {
                return;
            }
            if self.live_count() < self.config.worker_count {
                self.spawn_or_charge(now, restart_count);
            } else {
                debug!("Pool is full, dropping scheduled restart");
            }
        }

        let deficit = self
            .config
            .worker_count
            .saturating_sub(self.live_count() + self.pending.len());
        for _ in 0..deficit {
            if self.budget.is_exhausted() {
                return;
            }
            self.spawn_or_charge(now, 0);
        }
    }

    fn spawn_or_charge(&mut self, now: Instant, restart_count: u32) {
        if let Err(e) = self.spawn(now, restart_count) {
            error!(error = %e, "Failed to spawn worker");
            self.account_crash(
                now,
                RestartSlot::Pool {
                    restart_count: restart_count + 1,
                },
            );
        }
    }

    fn advance_rollout(&mut self, now: Instant) {
        let workers = &self.workers;
        let Some(rollout) = self.rollout.as_mut() else {
            return;
        };

        rollout
            .targets
            .retain(|id| workers.get(id).map_or(false, |r| r.state.accepts_work()));

        if rollout.replacement.is_some() {
            return;
        }
        if rollout.targets.is_empty() {
            info!(
                replaced = rollout.replaced,
                generation = self.generation,
                "Reload complete"
            );
            self.rollout = None;
            return;
        }
        if rollout.retry_at.map_or(false, |at| now < at) {
            return;
        }
        if self.budget.is_exhausted() {
            error!(
                remaining = rollout.targets.len(),
                "Reload abandoned, restart budget exhausted"
            );
            self.rollout = None;
            return;
        }

        match self.spawn(now, 0) {
            Ok(id) => {
                if let Some(rollout) = self.rollout.as_mut() {
                    rollout.replacement = Some(id);
                    rollout.retry_at = None;
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn replacement worker");
                self.account_crash(now, RestartSlot::Replacement);
            }
        }
    }

    fn next_rollout_target(&mut self) -> Option<WorkerId> {
        let workers = &self.workers;
        let rollout = self.rollout.as_mut()?;
        while let Some(id) = rollout.targets.pop_front() {
            if workers.get(&id).map_or(false, |r| r.state.accepts_work()) {
                return Some(id);
            }
        }
        None
    }

    /// Gracefully stop a worker that is being replaced
    fn retire(&mut self, id: WorkerId, now: Instant, reason: &str) {
        let deadline = now + self.config.graceful_timeout + Duration::from_millis(DRAIN_SLACK_MS);
        let Some(record) = self.workers.get_mut(&id) else {
            return;
        };
        if !record.transition(WorkerState::Draining) {
            return;
        }
        if let Err(e) = record.process.send(ControlCommand::GracefulStop) {
            warn!(worker_id = %id, error = %e, "Control pipe closed, falling back to SIGTERM");
            record.process.terminate();
        }
        record.stop_deadline = Some(deadline);
        info!(
            worker_id = %id,
            pid = record.process.pid(),
            generation = record.generation,
            reason,
            "Retiring worker"
        );
    }

    fn spawn(&mut self, now: Instant, restart_count: u32) -> Result<WorkerId, SpawnError> {
        let id = WorkerId::new(self.next_id);
        self.next_id += 1;

        let process = process::spawn_worker(
            &self.config.worker_command,
            id,
            &self.listener,
            &self.boot,
            self.notices.clone(),
        )?;
        if let Err(e) = process.send(ControlCommand::Start) {
            warn!(worker_id = %id, error = %e, "Failed to queue start command");
        }

        self.workers.insert(
            id,
            WorkerRecord {
                id,
                generation: self.generation,
                process,
                state: WorkerState::Starting,
                spawned_at: now,
                started_at: Utc::now(),
                restart_count,
                ready_at: None,
                last_heartbeat: now,
                last_ping: None,
                stats: WorkerStatsSnapshot::default(),
                stop_deadline: None,
                killed: false,
            },
        );
        Ok(id)
    }

    fn check_startup(&mut self) {
        if self.startup.is_some() && self.count(WorkerState::Ready) >= self.config.worker_count {
            if let Some(tx) = self.startup.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    fn check_exhausted(&mut self, now: Instant) {
        if self.shutdown.is_some() || !self.budget.is_exhausted() {
            return;
        }
        if self.workers.values().any(|r| !r.state.is_terminal()) {
            return;
        }

        error!("Restart budget exhausted and no workers left, shutting down");
        self.exit_reason = ExitReason::RestartBudgetExhausted;
        if let Some(tx) = self.startup.take() {
            let _ = tx.send(Err(SupervisorError::RestartBudgetExhausted));
        }
        self.begin_shutdown(ShutdownMode::Immediate, now);
    }

    fn count(&self, state: WorkerState) -> usize {
        self.workers.values().filter(|r| r.state == state).count()
    }

    fn live_count(&self) -> usize {
        self.workers.values().filter(|r| r.state.accepts_work()).count()
    }

    fn snapshot(&self, now: Instant) -> StatusSnapshot {
        StatusSnapshot {
            bind: self.listener.local_addr(),
            target_workers: self.config.worker_count,
            generation: self.generation,
            ready: self.count(WorkerState::Ready),
            starting: self.count(WorkerState::Starting),
            draining: self.count(WorkerState::Draining),
            total_restarts: self.budget.total_restarts(),
            restart_budget_exhausted: self.budget.is_exhausted(),
            reload_in_progress: self.rollout.is_some(),
            shutting_down: self.shutdown.is_some(),
            uptime_secs: now.duration_since(self.started_at).as_secs(),
            workers: self.workers.values().map(|r| r.status(now)).collect(),
        }
    }
}
