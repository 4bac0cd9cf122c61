//! Run controller.
//!
//! Owns one supervised worker for the life of a run. Samples, worker exits,
//! lifecycle transitions and shutdown requests all arrive on a single
//! channel and are handled on the calling thread, so the decision pipeline
//! (telemetry → decider → incident → lifecycle) never races with itself.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::config::{FlowforgeConfig, RunSpec};
use crate::control::ControlPlane;
use crate::crypto::MASTER_KEY_ENV;
use crate::db::{
    new_id, now_rfc3339, Db, Incident, EVENT_AUDIT, EVENT_DECISION, EVENT_INCIDENT,
    EVENT_LIFECYCLE, EVENT_RUN,
};
use crate::error::Result;
use crate::evidence::SIGNING_KEY_ENV;
use crate::journal::Journal;
use crate::lifecycle::{
    LifecycleConfig, LifecycleHooks, Phase, Transition, WorkerLauncher, WorkerLifecycle,
};
use crate::observer::{LogObserver, ObserverSink};
use crate::policy::{apply_rollout, Action, Decider, Decision, Policy, Telemetry, ThresholdDecider};
use crate::redact::redact;
use crate::sampler::{self, Sample, SamplerConfig, SourceFactory};
use crate::stagnation::{entropy_score, log_repetition, progress_like, raw_diversity};
use crate::supervisor::{ExitStatus, LaunchSpec, Sink, Supervisor, Tee};
use crate::task::TaskHandle;
use crate::tokens::{estimate_cost, TokenCounter};

const ACTOR: &str = "flowforge";
const IDLE_TICK: Duration = Duration::from_millis(100);
const USER_STOP_GRACE: Duration = Duration::from_secs(3);
const EXIT_WAIT: Duration = Duration::from_secs(2);
const OUTPUT_DRAIN: Duration = Duration::from_secs(1);
const TOKEN_RATE_WARMUP: Duration = Duration::from_secs(6);
const NOT_APPLICABLE: &str = "N/A";

pub const EXIT_LOOP_DETECTED: &str = "LOOP_DETECTED";
pub const EXIT_SAFETY_LIMIT: &str = "SAFETY_LIMIT_EXCEEDED";
pub const EXIT_USER_TERMINATED: &str = "USER_TERMINATED";
pub const EXIT_COMMAND_FAILURE: &str = "COMMAND_FAILURE";

/// Everything the controller reacts to.
#[derive(Debug)]
pub enum ControllerMsg {
    Sample(Sample),
    Shutdown { signal: i32 },
    WorkerExit { pid: i32, status: ExitStatus },
    Transition(Transition),
}

/// Asks a running controller to stop its worker and finish the run.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Sender<ControllerMsg>,
}

impl ShutdownHandle {
    pub fn request(&self, signal: i32) {
        if self.tx.send(ControllerMsg::Shutdown { signal }).is_err() {
            debug!(signal, "Controller already finished; shutdown ignored");
        }
    }
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    pub spec: RunSpec,
    pub policy: Policy,
    pub lifecycle: LifecycleConfig,
    /// Zero disables the token-rate choke.
    pub max_tokens_per_min: f64,
    pub alert_cooldown: Duration,
    /// The token-rate choke stays off until the run is this old.
    pub token_rate_warmup: Duration,
    /// Tee child output to our own stdout/stderr.
    pub echo_output: bool,
}

impl ControllerOptions {
    pub fn from_config(config: &FlowforgeConfig, spec: RunSpec) -> Self {
        Self {
            policy: config.policy(&spec),
            lifecycle: config.lifecycle_config(),
            max_tokens_per_min: config.policy.max_tokens_per_min,
            alert_cooldown: Duration::from_secs(config.policy.alert_cooldown_secs),
            token_rate_warmup: TOKEN_RATE_WARMUP,
            echo_output: true,
            spec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Detection,
    User,
    TeardownFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub exit_code: i32,
    pub exit_status: Option<ExitStatus>,
    pub terminated_by: Option<Termination>,
    pub incident_ids: Vec<String>,
    pub total_tokens: u64,
    pub cost_estimate: f64,
    pub max_cpu: f64,
}

/// Runs under the lifecycle lock, so it only queues. The controller
/// journals transitions in arrival order.
struct RunHooks {
    tx: Sender<ControllerMsg>,
}

impl LifecycleHooks for RunHooks {
    fn on_transition(&self, transition: &Transition) {
        let _ = self.tx.send(ControllerMsg::Transition(transition.clone()));
    }

    fn on_worker_exit(&self, pid: i32, status: ExitStatus) {
        let _ = self.tx.send(ControllerMsg::WorkerExit { pid, status });
    }
}

struct ObservedLauncher {
    observer: Arc<LogObserver>,
    echo: bool,
}

impl ObservedLauncher {
    fn sinks(&self) -> (Sink, Sink) {
        let observed = || Box::new(ObserverSink(Arc::clone(&self.observer))) as Sink;
        if self.echo {
            (
                Box::new(Tee::new(vec![Box::new(std::io::stdout()), observed()])),
                Box::new(Tee::new(vec![Box::new(std::io::stderr()), observed()])),
            )
        } else {
            (observed(), observed())
        }
    }
}

impl WorkerLauncher for ObservedLauncher {
    fn launch(&self, spec: &LaunchSpec) -> Result<Supervisor> {
        let (stdout, stderr) = self.sinks();
        Supervisor::start(spec, stdout, stderr)
    }
}

/// No-kill escalation. Cooldown shrinks as the level rises.
#[derive(Debug, Default)]
struct Watchdog {
    level: u32,
    last: Option<Instant>,
}

impl Watchdog {
    fn cooldown(&self) -> Duration {
        match self.level {
            0 => Duration::from_secs(30),
            1 => Duration::from_secs(15),
            _ => Duration::from_secs(5),
        }
    }

    /// Raises the level unless still inside the cooldown of the last alert.
    fn escalate(&mut self, now: Instant) -> Option<(u32, &'static str)> {
        if matches!(self.last, Some(at) if now.saturating_duration_since(at) <= self.cooldown()) {
            return None;
        }
        self.last = Some(now);
        self.level += 1;
        let title = match self.level {
            1 => "WATCHDOG_ALERT",
            2 => "WATCHDOG_WARN",
            _ => "WATCHDOG_CRITICAL",
        };
        Some((self.level, title))
    }

    fn calm(&mut self) {
        self.level = 0;
    }
}

#[derive(Default)]
struct RunState {
    supervisor: Option<Arc<Supervisor>>,
    sampler: Option<TaskHandle>,
    max_cpu: f64,
    cpu_over_since: Option<Instant>,
    incident_id: Option<String>,
    incident_ids: Vec<String>,
    detection_terminated: bool,
    user_terminated: bool,
    teardown_failed: bool,
    pending_restart: bool,
    watchdog: Watchdog,
    last_alert: Option<(Instant, String)>,
    last_probe_alert: Option<Instant>,
}

impl RunState {
    fn current_pid(&self) -> Option<i32> {
        self.supervisor.as_ref().map(|supervisor| supervisor.pid())
    }

    fn stop_sampler(&mut self) {
        if let Some(handle) = self.sampler.take() {
            handle.cancel_and_join();
        }
    }
}

pub struct Controller {
    options: ControllerOptions,
    agent_id: String,
    journal: Journal,
    observer: Arc<LogObserver>,
    lifecycle: WorkerLifecycle,
    launcher: Arc<ObservedLauncher>,
    decider: Box<dyn Decider>,
    sources: SourceFactory,
    started_at: Instant,
    tx: Sender<ControllerMsg>,
    rx: Receiver<ControllerMsg>,
}

impl Controller {
    pub fn new(options: ControllerOptions, db: Arc<Db>, counter: TokenCounter) -> Self {
        let run_id = new_id("run");
        let journal = Journal::new(db, run_id);
        let (tx, rx) = mpsc::channel();
        let observer = Arc::new(LogObserver::new(options.spec.log_window, counter));
        let launcher = Arc::new(ObservedLauncher {
            observer: Arc::clone(&observer),
            echo: options.echo_output,
        });
        let hooks = Arc::new(RunHooks { tx: tx.clone() });
        let lifecycle = WorkerLifecycle::new(
            options.lifecycle.clone(),
            Arc::clone(&launcher) as Arc<dyn WorkerLauncher>,
            hooks,
        );
        Self {
            options,
            agent_id: new_id("agent"),
            journal,
            observer,
            lifecycle,
            launcher,
            decider: Box::new(ThresholdDecider),
            sources: sampler::sysinfo_factory(),
            started_at: Instant::now(),
            tx,
            rx,
        }
    }

    pub fn with_decider(mut self, decider: Box<dyn Decider>) -> Self {
        self.decider = decider;
        self
    }

    pub fn with_metrics_source(mut self, sources: SourceFactory) -> Self {
        self.sources = sources;
        self
    }

    pub fn run_id(&self) -> &str {
        self.journal.run_id()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.tx.clone(),
        }
    }

    pub fn control_plane(&self) -> ControlPlane {
        ControlPlane::new(self.lifecycle.clone(), self.journal.clone())
    }

    /// Launches the worker and supervises it until the run ends.
    pub fn run(self) -> Result<RunOutcome> {
        let spec = &self.options.spec;
        spec.validate()?;
        let launch = self.launch_spec();
        let supervisor = Arc::new(self.launcher.launch(&launch)?);
        let pid = supervisor.pid();

        info!(
            run_id = %self.run_id(),
            agent_id = %self.agent_id,
            pid,
            max_cpu_pct = spec.max_cpu_pct,
            poll_interval_ms = spec.poll_interval_ms,
            log_window = spec.log_window,
            rollout_mode = spec.rollout_mode.as_str(),
            no_kill = spec.no_kill,
            "Run started"
        );
        self.journal.append(
            self.journal
                .event(EVENT_RUN, ACTOR, "RUN_STARTED")
                .summary(redact(&spec.command))
                .reason(format!(
                    "rollout={} no_kill={} model={}",
                    spec.rollout_mode.as_str(),
                    spec.no_kill,
                    spec.model_id
                ))
                .pid(Some(pid)),
        );

        let mut state = RunState {
            supervisor: Some(Arc::clone(&supervisor)),
            ..RunState::default()
        };
        self.lifecycle.register_external(launch, supervisor);
        self.start_sampler(pid, &mut state);

        loop {
            match self.rx.recv_timeout(IDLE_TICK) {
                Ok(msg) => self.on_message(msg, &mut state),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.finished(&state) {
                break;
            }
        }

        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                ControllerMsg::Transition(transition) => {
                    self.record_transition(&transition);
                    if transition.trigger == "stop_failed" {
                        state.teardown_failed = true;
                    }
                }
                other => debug!(msg = ?other, "Dropping message after run end"),
            }
        }
        Ok(self.finish(state))
    }

    fn launch_spec(&self) -> LaunchSpec {
        let spec = &self.options.spec;
        let stdin = spec.inject_feedback.as_ref().and_then(|path| {
            match fs_err::read(path) {
                Ok(bytes) => {
                    info!(path = %path.display(), bytes = bytes.len(), "Injecting feedback into stdin");
                    Some(bytes)
                }
                Err(err) => {
                    warn!(error = %err, "Could not read feedback file; continuing without it");
                    None
                }
            }
        });
        LaunchSpec {
            argv: spec.argv.clone(),
            cwd: spec.cwd.clone(),
            env_remove: vec![MASTER_KEY_ENV.to_string(), SIGNING_KEY_ENV.to_string()],
            stdin,
        }
    }

    fn finished(&self, state: &RunState) -> bool {
        self.lifecycle.is_idle()
            && !state.pending_restart
            && (state.user_terminated || !self.options.spec.linger)
    }

    fn start_sampler(&self, pid: i32, state: &mut RunState) {
        state.stop_sampler();
        let tx = self.tx.clone();
        let config = SamplerConfig {
            poll_interval: self.options.spec.poll_interval(),
            deep_watch: self.options.spec.deep_watch,
        };
        match sampler::spawn(pid, config, (self.sources)(), move |sample| {
            tx.send(ControllerMsg::Sample(sample)).is_ok()
        }) {
            Ok(handle) => state.sampler = Some(handle),
            Err(err) => warn!(pid, error = %err, "Failed to start sampler; running unobserved"),
        }
    }

    fn on_message(&self, msg: ControllerMsg, state: &mut RunState) {
        match msg {
            ControllerMsg::Sample(sample) => self.on_sample(sample, state),
            ControllerMsg::Shutdown { signal } => self.on_shutdown(signal, state),
            ControllerMsg::WorkerExit { pid, status } => {
                debug!(pid, code = ?status.code, signal = ?status.signal, "Worker exited");
                if state.current_pid() == Some(pid) {
                    state.stop_sampler();
                }
            }
            ControllerMsg::Transition(transition) => {
                self.record_transition(&transition);
                self.on_transition(&transition, state)
            }
        }
    }

    fn record_transition(&self, transition: &Transition) {
        self.journal.append(
            self.journal
                .event(EVENT_LIFECYCLE, "lifecycle", &transition.title())
                .summary(transition.summary())
                .reason(transition.reason())
                .pid(transition.pid),
        );
    }

    fn on_transition(&self, transition: &Transition, state: &mut RunState) {
        let pid = transition.pid;
        match transition.trigger {
            "restart_completed" => {
                if let Some(supervisor) = self.lifecycle.supervisor() {
                    let pid = supervisor.pid();
                    state.supervisor = Some(supervisor);
                    state.cpu_over_since = None;
                    state.watchdog = Watchdog::default();
                    self.start_sampler(pid, state);
                }
            }
            "stop_completed" if state.pending_restart => {
                state.pending_restart = false;
                if let Err(err) = self.lifecycle.request_restart() {
                    warn!(error = %err, status = err.status, "Automatic restart refused");
                    self.journal.append(
                        self.journal
                            .event(EVENT_AUDIT, ACTOR, "AUTO_RESTART_FAILED")
                            .summary(err.message.clone())
                            .reason(format!("status={}", err.status))
                            .pid(pid),
                    );
                    state.detection_terminated = true;
                }
            }
            "stop_failed" => {
                error!(phase = transition.phase.as_str(), "Worker teardown failed");
                state.teardown_failed = true;
                state.pending_restart = false;
            }
            "restart_failed" => {
                state.pending_restart = false;
            }
            _ => {}
        }
    }

    fn on_shutdown(&self, signal: i32, state: &mut RunState) {
        if state.user_terminated {
            return;
        }
        state.user_terminated = true;
        state.pending_restart = false;
        info!(signal, "Received shutdown signal; stopping worker");

        let incident_id = new_id("inc");
        let pid = state.current_pid();
        let reason = format!("received signal {}", signal);
        self.journal.append(
            self.journal
                .event(EVENT_AUDIT, ACTOR, EXIT_USER_TERMINATED)
                .incident(&incident_id)
                .summary("operator requested shutdown")
                .reason(reason.clone())
                .pid(pid),
        );
        self.record_incident(
            &incident_id,
            EXIT_USER_TERMINATED,
            NOT_APPLICABLE,
            &reason,
            None,
            "terminated",
            state,
        );

        if let Err(err) = self.lifecycle.request_kill_with_grace(USER_STOP_GRACE) {
            debug!(error = %err, "No running worker to stop on shutdown");
        }
    }

    fn on_sample(&self, sample: Sample, state: &mut RunState) {
        let pid = sample.pid;
        if state.current_pid() != Some(pid) {
            return;
        }
        let policy = &self.options.policy;
        // An unreadable tick leaves the over-threshold window untouched.
        if let Some(cpu) = sample.cpu_pct {
            state.max_cpu = state.max_cpu.max(cpu);
            if policy.max_cpu_pct > 0.0 && cpu > policy.max_cpu_pct {
                state.cpu_over_since.get_or_insert(sample.t);
            } else {
                state.cpu_over_since = None;
            }
        }
        if sample.probing {
            self.note_probing(&sample, state);
        }
        if self.lifecycle.snapshot().phase != Phase::Running || state.user_terminated {
            return;
        }

        let window = self.options.spec.log_window;
        let normalized = self.observer.last_normalized(window);
        let raw = self.observer.last_lines(window);
        let entropy = if normalized.len() >= window {
            entropy_score(&normalized)
        } else {
            100.0
        };
        let memory_mb = sample.memory_mb();
        let telemetry = Telemetry {
            cpu_pct: sample.cpu_pct,
            cpu_over_for: state
                .cpu_over_since
                .map(|since| sample.t.saturating_duration_since(since))
                .unwrap_or_default(),
            memory_mb,
            log_repetition: log_repetition(&normalized, window),
            log_entropy: entropy / 100.0,
            raw_diversity: raw_diversity(&raw),
            progress_like: progress_like(&raw),
            rollout_key: self.run_id().to_string(),
        };
        let decision = self.decider.evaluate(&telemetry, policy);
        debug!(
            pid,
            cpu = ?sample.cpu_pct,
            repetition = telemetry.log_repetition,
            entropy = telemetry.log_entropy,
            action = decision.action.as_str(),
            "Policy evaluated"
        );

        if decision.intended_action.is_destructive() {
            let over_memory =
                memory_mb.filter(|mb| policy.max_memory_mb > 0.0 && *mb > policy.max_memory_mb);
            let (exit_reason, pattern) =
                if let Some(mb) = over_memory {
                    (EXIT_SAFETY_LIMIT, format!("Memory Limit: {:.2}MB", mb))
                } else {
                    let pattern = normalized
                        .first()
                        .filter(|line| !line.is_empty())
                        .cloned()
                        .unwrap_or_else(|| NOT_APPLICABLE.to_string());
                    (EXIT_LOOP_DETECTED, pattern)
                };
            self.on_destructive(decision, exit_reason, pattern, pid, state);
            return;
        }

        match decision.action {
            Action::Continue => state.watchdog.calm(),
            _ => self.note_alert(&decision, pid, state),
        }
        self.check_token_rate(&decision, pid, state);
    }

    fn check_token_rate(&self, last: &Decision, pid: i32, state: &mut RunState) {
        let limit = self.options.max_tokens_per_min;
        if limit <= 0.0 {
            return;
        }
        let elapsed = self.started_at.elapsed();
        if elapsed <= self.options.token_rate_warmup || elapsed.is_zero() {
            return;
        }
        let elapsed_min = elapsed.as_secs_f64() / 60.0;
        let rate = self.observer.total_tokens() as f64 / elapsed_min;
        if rate <= limit {
            return;
        }
        let reason = format!("token rate {:.0}/min exceeded {:.0}/min", rate, limit);
        let (action, reason) = apply_rollout(
            Action::Kill,
            reason,
            &self.options.policy,
            self.run_id(),
        );
        let decision = Decision {
            action,
            intended_action: Action::Kill,
            reason,
            ..last.clone()
        };
        self.on_destructive(
            decision,
            EXIT_SAFETY_LIMIT,
            format!("Token Rate: {:.0}/min", rate),
            pid,
            state,
        );
    }

    fn on_destructive(
        &self,
        decision: Decision,
        exit_reason: &'static str,
        pattern: String,
        pid: i32,
        state: &mut RunState,
    ) {
        if decision.action == Action::LogOnly {
            self.note_alert(&decision, pid, state);
            return;
        }
        if self.options.spec.no_kill {
            self.watchdog(&decision, &pattern, pid, state);
            return;
        }

        let (incident_id, first) = match &state.incident_id {
            Some(id) => (id.clone(), false),
            None => {
                let id = new_id("inc");
                state.incident_id = Some(id.clone());
                (id, true)
            }
        };
        warn!(
            pid,
            incident_id = %incident_id,
            action = decision.action.as_str(),
            reason = %decision.reason,
            "Destructive decision"
        );

        self.journal
            .append(self.decision_event(&decision, pid).incident(&incident_id));
        let audit_title = match decision.action {
            Action::Restart => "AUTO_RESTART",
            _ => "AUTO_KILL",
        };
        self.journal.append(
            self.journal
                .event(EVENT_AUDIT, ACTOR, audit_title)
                .incident(&incident_id)
                .summary(format!("{} pid={}", exit_reason, pid))
                .reason(decision.reason.clone())
                .pid(Some(pid))
                .scores(decision.cpu_score, decision.entropy_score, decision.confidence),
        );
        if first {
            let recovery = match decision.action {
                Action::Restart => "restarting",
                _ => "terminated",
            };
            self.record_incident(
                &incident_id,
                exit_reason,
                &pattern,
                &decision.reason,
                Some(&decision),
                recovery,
                state,
            );
        }

        match self.lifecycle.request_kill() {
            Ok(_) => {
                state.detection_terminated = decision.action == Action::Kill;
                state.pending_restart = decision.action == Action::Restart;
            }
            Err(err) => warn!(error = %err, status = err.status, "Lifecycle refused kill"),
        }
    }

    fn watchdog(&self, decision: &Decision, pattern: &str, pid: i32, state: &mut RunState) {
        let Some((level, title)) = state.watchdog.escalate(Instant::now()) else {
            return;
        };
        warn!(pid, level, title, pattern, "Watchdog escalation");

        self.journal.append(self.decision_event(decision, pid));
        self.journal.append(
            self.journal
                .event(EVENT_AUDIT, ACTOR, title)
                .summary(pattern.to_string())
                .reason(decision.reason.clone())
                .pid(Some(pid))
                .scores(decision.cpu_score, decision.entropy_score, decision.confidence)
                .payload(json!({
                    "level": level,
                    "intended_action": decision.intended_action,
                    "tokens": self.observer.total_tokens(),
                })),
        );
    }

    /// Records a non-destructive decision unless the same reason was
    /// recorded within the cooldown.
    fn note_alert(&self, decision: &Decision, pid: i32, state: &mut RunState) {
        let cooldown = self.options.alert_cooldown;
        if let Some((at, reason)) = &state.last_alert {
            if reason == &decision.reason && at.elapsed() < cooldown {
                return;
            }
        }
        state.last_alert = Some((Instant::now(), decision.reason.clone()));
        info!(pid, action = decision.action.as_str(), reason = %decision.reason, "Policy alert");

        self.journal.append(self.decision_event(decision, pid));
    }

    fn note_probing(&self, sample: &Sample, state: &mut RunState) {
        let cooldown = self.options.alert_cooldown;
        if matches!(state.last_probe_alert, Some(at) if at.elapsed() < cooldown) {
            return;
        }
        state.last_probe_alert = Some(Instant::now());
        let summary = format!(
            "fds={} sockets={}",
            sample.open_fds.unwrap_or(0),
            sample.socket_count.unwrap_or(0)
        );
        warn!(pid = sample.pid, %summary, "Probing detected");
        self.journal.append(
            self.journal
                .event(EVENT_AUDIT, ACTOR, "PROBING_DETECTED")
                .summary(summary)
                .reason("descriptor or socket burst over baseline")
                .pid(Some(sample.pid)),
        );
    }

    fn decision_event(&self, decision: &Decision, pid: i32) -> crate::db::Event {
        self.journal
            .event(EVENT_DECISION, "policy", decision.action.as_str())
            .summary(format!(
                "action={} intended={}",
                decision.action, decision.intended_action
            ))
            .reason(decision.reason.clone())
            .pid(Some(pid))
            .scores(decision.cpu_score, decision.entropy_score, decision.confidence)
            .payload(json!(decision))
    }

    #[allow(clippy::too_many_arguments)]
    fn record_incident(
        &self,
        incident_id: &str,
        exit_reason: &str,
        pattern: &str,
        reason: &str,
        decision: Option<&Decision>,
        recovery_status: &str,
        state: &mut RunState,
    ) {
        let tokens = self.observer.total_tokens();
        let model = &self.options.spec.model_id;
        let incident = Incident {
            incident_id: incident_id.to_string(),
            ts: now_rfc3339(),
            run_id: self.run_id().to_string(),
            command: self.options.spec.command.clone(),
            model: model.clone(),
            exit_reason: exit_reason.to_string(),
            max_cpu: state.max_cpu,
            pattern: pattern.to_string(),
            tokens,
            cost_estimate: estimate_cost(tokens, model),
            agent_id: self.agent_id.clone(),
            reason: reason.to_string(),
            action: decision.map(|d| d.action.as_str()).unwrap_or("KILL").to_string(),
            intended_action: decision
                .map(|d| d.intended_action.as_str())
                .unwrap_or("KILL")
                .to_string(),
            cpu_score: decision.map(|d| d.cpu_score).unwrap_or(0.0),
            entropy_score: decision.map(|d| d.entropy_score).unwrap_or(0.0),
            confidence_score: decision.map(|d| d.confidence).unwrap_or(0.0),
            recovery_status: recovery_status.to_string(),
            restart_count: self.lifecycle.snapshot().restart_count,
        };
        if let Err(err) = self.journal.db().insert_incident(&incident) {
            warn!(incident_id, error = %err, "Failed to record incident");
        }
        state.incident_ids.push(incident_id.to_string());
        self.journal.append(
            self.journal
                .event(EVENT_INCIDENT, ACTOR, exit_reason)
                .incident(incident_id)
                .summary(pattern.to_string())
                .reason(reason.to_string())
                .pid(state.current_pid())
                .scores(incident.cpu_score, incident.entropy_score, incident.confidence_score)
                .payload(json!({
                    "tokens": incident.tokens,
                    "cost_estimate": incident.cost_estimate,
                    "max_cpu": incident.max_cpu,
                    "recovery_status": incident.recovery_status,
                })),
        );
    }

    fn finish(&self, mut state: RunState) -> RunOutcome {
        state.stop_sampler();
        self.observer.flush_pending();

        let exit_status = state.supervisor.as_ref().and_then(|supervisor| {
            supervisor
                .exit_status()
                .or_else(|| supervisor.wait_timeout(EXIT_WAIT))
        });
        if let Some(supervisor) = &state.supervisor {
            if !supervisor.drain_output(OUTPUT_DRAIN) {
                debug!(pid = supervisor.pid(), "Output pipes still open; flushing what arrived");
            }
        }

        let failed_on_its_own = !state.user_terminated
            && !state.detection_terminated
            && matches!(exit_status, Some(ExitStatus { code: Some(code), .. }) if code != 0);
        if failed_on_its_own {
            let reason = exit_status
                .map(crate::lifecycle::describe_exit)
                .unwrap_or_default();
            let incident_id = new_id("inc");
            self.record_incident(
                &incident_id,
                EXIT_COMMAND_FAILURE,
                NOT_APPLICABLE,
                &reason,
                None,
                "exited",
                &mut state,
            );
        }

        let terminated_by = if state.teardown_failed {
            Some(Termination::TeardownFailure)
        } else if state.detection_terminated {
            Some(Termination::Detection)
        } else if state.user_terminated {
            Some(Termination::User)
        } else {
            None
        };
        let exit_code = match terminated_by {
            Some(Termination::TeardownFailure) | Some(Termination::Detection) => 1,
            _ => match exit_status {
                Some(ExitStatus {
                    code: Some(code), ..
                }) => code,
                _ => 1,
            },
        };

        let total_tokens = self.observer.total_tokens();
        let cost_estimate = estimate_cost(total_tokens, &self.options.spec.model_id);
        info!(
            run_id = %self.run_id(),
            exit_code,
            ?terminated_by,
            total_tokens,
            cost_estimate,
            max_cpu = state.max_cpu,
            "Run finished"
        );
        self.journal.append(
            self.journal
                .event(EVENT_RUN, ACTOR, "RUN_FINISHED")
                .summary(format!(
                    "exit_code={} tokens={} cost={:.4}",
                    exit_code, total_tokens, cost_estimate
                ))
                .reason(
                    exit_status
                        .map(crate::lifecycle::describe_exit)
                        .unwrap_or_else(|| "exit status unknown".to_string()),
                )
                .pid(state.current_pid())
                .payload(json!({ "metrics": self.lifecycle.metrics().snapshot() })),
        );

        RunOutcome {
            run_id: self.run_id().to_string(),
            exit_code,
            exit_status,
            terminated_by,
            incident_ids: state.incident_ids,
            total_tokens,
            cost_estimate,
            max_cpu: state.max_cpu,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::Operation;

    #[test]
    fn watchdog_cooldown_shrinks_with_each_level() {
        let t0 = Instant::now();
        let mut watchdog = Watchdog::default();

        assert_eq!(watchdog.escalate(t0), Some((1, "WATCHDOG_ALERT")));
        assert_eq!(watchdog.escalate(t0 + Duration::from_secs(10)), None);
        assert_eq!(
            watchdog.escalate(t0 + Duration::from_secs(16)),
            Some((2, "WATCHDOG_WARN"))
        );
        assert_eq!(watchdog.escalate(t0 + Duration::from_secs(20)), None);
        assert_eq!(
            watchdog.escalate(t0 + Duration::from_secs(22)),
            Some((3, "WATCHDOG_CRITICAL"))
        );
        assert_eq!(watchdog.escalate(t0 + Duration::from_secs(25)), None);
        assert_eq!(
            watchdog.escalate(t0 + Duration::from_secs(28)),
            Some((4, "WATCHDOG_CRITICAL"))
        );
    }

    #[test]
    fn calm_watchdog_starts_over_at_alert() {
        let t0 = Instant::now();
        let mut watchdog = Watchdog::default();
        watchdog.escalate(t0);
        watchdog.escalate(t0 + Duration::from_secs(16));
        watchdog.calm();

        // Level 0 uses the long cooldown again.
        assert_eq!(watchdog.escalate(t0 + Duration::from_secs(40)), None);
        assert_eq!(
            watchdog.escalate(t0 + Duration::from_secs(47)),
            Some((1, "WATCHDOG_ALERT"))
        );
    }

    #[test]
    fn transitions_are_queued_for_the_controller() {
        let (tx, rx) = mpsc::channel();
        let hooks = RunHooks { tx };
        let transition = Transition {
            phase: Phase::Stopping,
            operation: Operation::Kill,
            pid: Some(42),
            managed: true,
            last_error: None,
            trigger: "kill_requested",
        };

        hooks.on_transition(&transition);

        match rx.try_recv() {
            Ok(ControllerMsg::Transition(queued)) => assert_eq!(queued, transition),
            other => panic!("expected a queued transition, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
