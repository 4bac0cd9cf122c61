//! Worker lifecycle state machine.
//!
//! Serializes kill and restart requests against the supervised worker. Every
//! transition is recorded while the state mutex is held; the slow part of a
//! stop or start runs on a helper thread afterwards and reports back through
//! `finish_stop` / `finish_start`. A per-worker watcher notices exits that
//! nobody asked for. Watch ids are monotonic so a watcher left over from a
//! replaced worker can never overwrite newer state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::metrics::Metrics;
use crate::supervisor::{ExitStatus, LaunchSpec, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Stopped => "STOPPED",
            Phase::Starting => "STARTING",
            Phase::Running => "RUNNING",
            Phase::Stopping => "STOPPING",
            Phase::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Idle,
    Kill,
    Restart,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Idle => "idle",
            Operation::Kill => "kill",
            Operation::Restart => "restart",
        }
    }
}

/// A refused request. `status` follows HTTP semantics.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct LifecycleError {
    pub status: u16,
    pub message: String,
    pub retry_after_secs: Option<u64>,
}

impl LifecycleError {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleSnapshot {
    pub phase: Phase,
    pub operation: Operation,
    pub pid: Option<i32>,
    pub managed: bool,
    pub last_error: Option<String>,
    pub restart_count: u32,
    pub watch_id: u64,
    pub updated_at: String,
}

/// Acknowledgement for an accepted (or replayed) mutation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleAck {
    pub status: &'static str,
    pub lifecycle: Phase,
    pub pid: Option<i32>,
    pub accepted_new: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub phase: Phase,
    pub operation: Operation,
    pub pid: Option<i32>,
    pub managed: bool,
    pub last_error: Option<String>,
    pub trigger: &'static str,
}

impl Transition {
    pub fn title(&self) -> String {
        format!("LIFECYCLE_{}", self.phase.as_str())
    }

    pub fn summary(&self) -> String {
        format!(
            "phase={} operation={} pid={} managed={}",
            self.phase.as_str(),
            self.operation.as_str(),
            self.pid.unwrap_or(0),
            self.managed
        )
    }

    pub fn reason(&self) -> String {
        match &self.last_error {
            Some(err) => format!("{}: {}", self.trigger, err),
            None => self.trigger.to_string(),
        }
    }
}

/// Starts a new worker process for a restart.
pub trait WorkerLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Supervisor>;
}

/// Observes lifecycle activity. Called with the state lock held, so
/// implementations must be cheap and non-blocking and must not call back
/// into the lifecycle. Queue the transition and do I/O elsewhere.
pub trait LifecycleHooks: Send + Sync {
    fn on_transition(&self, transition: &Transition);

    /// Every observed worker exit, including ones the lifecycle caused.
    fn on_worker_exit(&self, _pid: i32, _status: ExitStatus) {}
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub stop_grace: Duration,
    pub kill_replay_window: Duration,
    pub restart_budget_max: usize,
    pub restart_budget_window: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(2),
            kill_replay_window: Duration::from_secs(2),
            restart_budget_max: 3,
            restart_budget_window: Duration::from_secs(300),
        }
    }
}

struct State {
    phase: Phase,
    operation: Operation,
    pid: Option<i32>,
    managed: bool,
    supervisor: Option<Arc<Supervisor>>,
    spec: Option<LaunchSpec>,
    last_error: Option<String>,
    last_kill: Option<(Instant, Option<i32>)>,
    restart_requested_at: Option<Instant>,
    watch_id: u64,
    restart_count: u32,
    restart_history: VecDeque<Instant>,
    updated_at: String,
}

struct Shared {
    config: LifecycleConfig,
    launcher: Arc<dyn WorkerLauncher>,
    hooks: Arc<dyn LifecycleHooks>,
    metrics: Metrics,
    state: Mutex<State>,
}

#[derive(Clone)]
pub struct WorkerLifecycle {
    shared: Arc<Shared>,
}

impl WorkerLifecycle {
    pub fn new(
        config: LifecycleConfig,
        launcher: Arc<dyn WorkerLauncher>,
        hooks: Arc<dyn LifecycleHooks>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                launcher,
                hooks,
                metrics: Metrics::new(),
                state: Mutex::new(State {
                    phase: Phase::Stopped,
                    operation: Operation::Idle,
                    pid: None,
                    managed: false,
                    supervisor: None,
                    spec: None,
                    last_error: None,
                    last_kill: None,
                    restart_requested_at: None,
                    watch_id: 0,
                    restart_count: 0,
                    restart_history: VecDeque::new(),
                    updated_at: Utc::now().to_rfc3339(),
                }),
            }),
        }
    }

    /// Counters shared with the control plane.
    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adopts a worker the controller launched itself. `spec` is kept for
    /// later restarts with any stdin payload dropped.
    pub fn register_external(&self, spec: LaunchSpec, supervisor: Arc<Supervisor>) {
        let mut state = self.lock();
        let pid = supervisor.pid();
        state.spec = Some(LaunchSpec {
            stdin: None,
            ..spec
        });
        state.supervisor = Some(Arc::clone(&supervisor));
        state.pid = Some(pid);
        state.managed = false;
        state.phase = Phase::Running;
        state.operation = Operation::Idle;
        state.last_error = None;
        self.start_watcher(&mut state, supervisor);
        self.emit(&mut state, "external_worker_registered");
    }

    pub fn request_kill(&self) -> std::result::Result<LifecycleAck, LifecycleError> {
        self.request_kill_with_grace(self.shared.config.stop_grace)
    }

    /// Same as [`request_kill`](Self::request_kill) with an explicit SIGTERM grace.
    pub fn request_kill_with_grace(
        &self,
        grace: Duration,
    ) -> std::result::Result<LifecycleAck, LifecycleError> {
        let mut state = self.lock();
        let phase = state.phase;
        match phase {
            Phase::Starting => Err(LifecycleError::new(409, "restart already in progress")),
            Phase::Stopping => Ok(LifecycleAck {
                status: "stop_requested",
                lifecycle: Phase::Stopping,
                pid: state.pid,
                accepted_new: false,
            }),
            Phase::Stopped | Phase::Failed => match state.last_kill {
                Some((at, pid))
                    if phase == Phase::Stopped
                        && at.elapsed() <= self.shared.config.kill_replay_window =>
                {
                    Ok(LifecycleAck {
                        status: "stop_requested",
                        lifecycle: Phase::Stopped,
                        pid,
                        accepted_new: false,
                    })
                }
                _ => Err(LifecycleError::new(400, "no active process to kill")),
            },
            Phase::Running => {
                let supervisor = match state.supervisor.clone() {
                    Some(supervisor) => supervisor,
                    None => return Err(LifecycleError::new(400, "no active process to kill")),
                };
                let pid = state.pid;
                let requested_at = Instant::now();
                state.phase = Phase::Stopping;
                state.operation = Operation::Kill;
                state.last_error = None;
                state.last_kill = Some((requested_at, pid));
                self.emit(&mut state, "kill_requested");
                drop(state);
                self.shared.metrics.record_kill();

                let lifecycle = self.clone();
                thread::spawn(move || {
                    let result = supervisor.stop(grace);
                    lifecycle.finish_stop(result.map_err(|err| err.to_string()), requested_at);
                });

                Ok(LifecycleAck {
                    status: "stop_requested",
                    lifecycle: Phase::Stopping,
                    pid,
                    accepted_new: true,
                })
            }
        }
    }

    pub fn request_restart(&self) -> std::result::Result<LifecycleAck, LifecycleError> {
        let mut state = self.lock();
        let phase = state.phase;
        match phase {
            Phase::Stopping => Err(LifecycleError::new(
                409,
                "worker is stopping; retry restart after stop completes",
            )),
            Phase::Starting => Ok(LifecycleAck {
                status: "restart_requested",
                lifecycle: Phase::Starting,
                pid: None,
                accepted_new: false,
            }),
            Phase::Running => Err(LifecycleError::new(
                409,
                "process is still running; stop/kill it before restart",
            )),
            Phase::Stopped | Phase::Failed => {
                let spec = match state.spec.clone() {
                    Some(spec) if !spec.argv.is_empty() => spec,
                    _ => return Err(LifecycleError::new(400, "no command available to restart")),
                };

                let now = Instant::now();
                if let Some(retry_after) = self.budget_exhausted(&mut state, now) {
                    let config = &self.shared.config;
                    let message = format!(
                        "restart budget exceeded: allowed {} restart requests per {}s",
                        config.restart_budget_max,
                        config.restart_budget_window.as_secs()
                    );
                    state.last_error = Some(message.clone());
                    self.emit(&mut state, "restart_budget_blocked");
                    self.shared.metrics.record_restart_budget_blocked();
                    return Err(LifecycleError {
                        status: 429,
                        message,
                        retry_after_secs: Some(retry_after),
                    });
                }
                state.restart_history.push_back(now);
                state.restart_requested_at = Some(now);
                state.restart_count += 1;
                state.phase = Phase::Starting;
                state.operation = Operation::Restart;
                state.pid = None;
                state.last_error = None;
                self.emit(&mut state, "restart_requested");
                drop(state);
                self.shared.metrics.record_restart();

                let lifecycle = self.clone();
                thread::spawn(move || {
                    let result = lifecycle.shared.launcher.launch(&spec);
                    lifecycle.finish_start(result.map_err(|err| err.to_string()));
                });

                Ok(LifecycleAck {
                    status: "restart_requested",
                    lifecycle: Phase::Starting,
                    pid: None,
                    accepted_new: true,
                })
            }
        }
    }

    pub fn snapshot(&self) -> LifecycleSnapshot {
        let state = self.lock();
        LifecycleSnapshot {
            phase: state.phase,
            operation: state.operation,
            pid: state.pid,
            managed: state.managed,
            last_error: state.last_error.clone(),
            restart_count: state.restart_count,
            watch_id: state.watch_id,
            updated_at: state.updated_at.clone(),
        }
    }

    /// The current worker handle, if one is running.
    pub fn supervisor(&self) -> Option<Arc<Supervisor>> {
        self.lock().supervisor.clone()
    }

    /// True when nothing is running and no operation is in flight.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        matches!(state.phase, Phase::Stopped | Phase::Failed) && state.operation == Operation::Idle
    }

    fn finish_stop(&self, result: std::result::Result<(), String>, requested_at: Instant) {
        let mut state = self.lock();
        if state.phase != Phase::Stopping {
            return;
        }
        self.shared
            .metrics
            .observe_stop(requested_at.elapsed(), result.is_ok());
        state.operation = Operation::Idle;
        match result {
            Ok(()) => {
                // Invalidate the watcher; this finalizer owns the transition.
                state.watch_id += 1;
                state.supervisor = None;
                state.pid = None;
                state.managed = false;
                state.phase = Phase::Stopped;
                state.last_error = None;
                self.emit(&mut state, "stop_completed");
            }
            Err(err) => {
                warn!(error = %err, "Worker stop failed");
                state.phase = Phase::Failed;
                state.last_error = Some(err);
                self.emit(&mut state, "stop_failed");
            }
        }
    }

    fn finish_start(&self, result: std::result::Result<Supervisor, String>) {
        let mut state = self.lock();
        if state.phase != Phase::Starting {
            return;
        }
        if let Some(requested_at) = state.restart_requested_at.take() {
            self.shared
                .metrics
                .observe_restart(requested_at.elapsed(), result.is_ok());
        }
        state.operation = Operation::Idle;
        match result {
            Ok(supervisor) => {
                let supervisor = Arc::new(supervisor);
                state.pid = Some(supervisor.pid());
                state.supervisor = Some(Arc::clone(&supervisor));
                state.managed = true;
                state.phase = Phase::Running;
                state.last_error = None;
                self.start_watcher(&mut state, supervisor);
                self.emit(&mut state, "restart_completed");
            }
            Err(err) => {
                warn!(error = %err, "Worker restart failed");
                state.supervisor = None;
                state.pid = None;
                state.managed = false;
                state.phase = Phase::Failed;
                state.last_error = Some(err);
                self.emit(&mut state, "restart_failed");
            }
        }
    }

    fn start_watcher(&self, state: &mut State, supervisor: Arc<Supervisor>) {
        state.watch_id += 1;
        let id = state.watch_id;
        let lifecycle = self.clone();
        thread::spawn(move || {
            let status = supervisor.wait();
            lifecycle.worker_exited(id, supervisor.pid(), status);
        });
    }

    fn worker_exited(&self, id: u64, pid: i32, status: ExitStatus) {
        let mut state = self.lock();
        self.shared.hooks.on_worker_exit(pid, status);
        if id != state.watch_id {
            return;
        }
        // An explicit stop owns the transition out of STOPPING.
        if state.phase == Phase::Stopping || state.operation == Operation::Kill {
            return;
        }

        state.supervisor = None;
        state.pid = None;
        state.managed = false;
        state.operation = Operation::Idle;
        if status.success() {
            state.phase = Phase::Stopped;
            state.last_error = None;
            self.emit(&mut state, "worker_exited");
        } else {
            state.phase = Phase::Failed;
            state.last_error = Some(describe_exit(status));
            self.emit(&mut state, "worker_exit_error");
        }
    }

    /// Prunes the restart history and returns a retry-after hint if full.
    fn budget_exhausted(&self, state: &mut State, now: Instant) -> Option<u64> {
        let config = &self.shared.config;
        if config.restart_budget_max == 0 || config.restart_budget_window.is_zero() {
            return None;
        }
        let window = config.restart_budget_window;
        while let Some(oldest) = state.restart_history.front() {
            if now.duration_since(*oldest) >= window {
                state.restart_history.pop_front();
            } else {
                break;
            }
        }
        if state.restart_history.len() < config.restart_budget_max {
            return None;
        }
        let oldest = state.restart_history.front().copied().unwrap_or(now);
        let wait = window.saturating_sub(now.duration_since(oldest));
        let mut secs = wait.as_secs();
        if wait.subsec_nanos() > 0 {
            secs += 1;
        }
        Some(secs.max(1))
    }

    fn emit(&self, state: &mut State, trigger: &'static str) {
        state.updated_at = Utc::now().to_rfc3339();
        let transition = Transition {
            phase: state.phase,
            operation: state.operation,
            pid: state.pid,
            managed: state.managed,
            last_error: state.last_error.clone(),
            trigger,
        };
        info!(
            phase = transition.phase.as_str(),
            operation = transition.operation.as_str(),
            pid = ?transition.pid,
            trigger,
            "Lifecycle transition"
        );
        self.shared.hooks.on_transition(&transition);
    }
}

pub fn describe_exit(status: ExitStatus) -> String {
    match (status.code, status.signal) {
        (Some(code), _) => format!("exit status {}", code),
        (None, Some(signal)) => format!("terminated by signal {}", signal),
        (None, None) => "exit status unknown".to_string(),
    }
}
