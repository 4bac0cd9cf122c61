use flowforge_core::controller::{
    EXIT_COMMAND_FAILURE, EXIT_LOOP_DETECTED, EXIT_SAFETY_LIMIT, EXIT_USER_TERMINATED,
};
use flowforge_core::db::{EVENT_AUDIT, EVENT_DECISION, EVENT_INCIDENT, EVENT_LIFECYCLE, EVENT_RUN};
use flowforge_core::sampler::{MetricsSource, Reading, SourceFactory};
use flowforge_core::supervisor::process_alive;
use flowforge_core::{
    Action, Controller, ControllerOptions, Db, Decider, Decision, FieldCipher, LifecycleConfig,
    Policy, RolloutMode, RunSpec, Telemetry, Termination, TokenCounter,
};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const KEY: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
const LOOPING: &str = "while true; do echo \"retry attempt 1 failed\"; sleep 0.05; done";
const VARIED: &str = "for i in $(seq 1 50); do echo \"step $i of work\"; sleep 0.02; done";

/// Reports a fixed CPU load while the process exists.
struct FixedCpu(f64);

impl MetricsSource for FixedCpu {
    fn read(&mut self, pid: i32) -> Option<Reading> {
        if !process_alive(pid) {
            return None;
        }
        Some(Reading {
            cpu_pct: Some(self.0),
            rss_bytes: Some(16 * 1024 * 1024),
            open_fds: Some(4),
            socket_count: Some(0),
        })
    }
}

fn fixed_cpu(pct: f64) -> SourceFactory {
    Arc::new(move || Box::new(FixedCpu(pct)) as Box<dyn MetricsSource>)
}

/// High CPU on every other tick; the ticks in between have no CPU reading.
struct GappyCpu {
    ticks: u64,
}

impl MetricsSource for GappyCpu {
    fn read(&mut self, pid: i32) -> Option<Reading> {
        if !process_alive(pid) {
            return None;
        }
        self.ticks += 1;
        Some(Reading {
            cpu_pct: (self.ticks % 2 == 0).then_some(95.0),
            rss_bytes: None,
            open_fds: Some(4),
            socket_count: Some(0),
        })
    }
}

struct AlwaysContinue;

impl Decider for AlwaysContinue {
    fn evaluate(&self, _telemetry: &Telemetry, _policy: &Policy) -> Decision {
        Decision {
            action: Action::Continue,
            intended_action: Action::Continue,
            reason: "operator override".to_string(),
            cpu_score: 0.0,
            entropy_score: 100.0,
            confidence: 0.0,
        }
    }
}

fn open_db(dir: &Path) -> Arc<Db> {
    let cipher = FieldCipher::from_hex(KEY).expect("cipher");
    Arc::new(Db::open(dir.join("flowforge.db"), cipher).expect("open db"))
}

fn options(script: &str, rollout: RolloutMode) -> ControllerOptions {
    let mut spec = RunSpec::new(vec!["sh".into(), "-c".into(), script.into()]);
    spec.log_window = 10;
    spec.poll_interval_ms = 50;
    spec.rollout_mode = rollout;
    let policy = Policy {
        rollout_mode: rollout,
        ..Policy::default()
    };
    ControllerOptions {
        spec,
        policy,
        lifecycle: LifecycleConfig {
            stop_grace: Duration::from_millis(500),
            ..LifecycleConfig::default()
        },
        max_tokens_per_min: 0.0,
        alert_cooldown: Duration::from_secs(30),
        token_rate_warmup: Duration::from_secs(6),
        echo_output: false,
    }
}

fn controller(db: &Arc<Db>, options: ControllerOptions, cpu: f64) -> Controller {
    let counter = TokenCounter::heuristic(&options.spec.model_id);
    Controller::new(options, Arc::clone(db), counter).with_metrics_source(fixed_cpu(cpu))
}

#[test]
fn runaway_loop_is_killed_with_one_incident_chain() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());

    let outcome = controller(&db, options(LOOPING, RolloutMode::Enforce), 95.0)
        .run()
        .expect("run");

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.terminated_by, Some(Termination::Detection));
    assert_eq!(outcome.incident_ids.len(), 1);
    assert!(outcome.max_cpu >= 95.0);

    let incidents = db.list_incidents().expect("incidents");
    assert_eq!(incidents.len(), 1);
    let incident = &incidents[0];
    assert_eq!(incident.exit_reason, EXIT_LOOP_DETECTED);
    assert_eq!(incident.action, "KILL");
    assert_eq!(incident.run_id, outcome.run_id);
    assert!(incident.reason.contains("CPU exceeded 90%"));
    assert!(incident.reason.contains("log repetition exceeded 0.80"));
    assert!(incident.pattern.contains("retry attempt"));

    let chain = db
        .incident_chain(&incident.incident_id, 100)
        .expect("chain");
    let kinds: Vec<&str> = chain.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(kinds, vec![EVENT_DECISION, EVENT_AUDIT, EVENT_INCIDENT]);
    assert_eq!(chain[1].title, "AUTO_KILL");

    let run_events = db.run_events(&outcome.run_id, 500).expect("run events");
    assert_eq!(run_events.first().map(|e| e.title.as_str()), Some("RUN_STARTED"));
    let last = run_events.last().expect("last event");
    assert_eq!(last.event_type, EVENT_RUN);
    assert_eq!(last.title, "RUN_FINISHED");

    let phases: Vec<&str> = run_events
        .iter()
        .filter(|e| e.event_type == EVENT_LIFECYCLE)
        .map(|e| e.reason.as_str())
        .collect();
    assert_eq!(
        phases,
        vec!["external_worker_registered", "kill_requested", "stop_completed"]
    );
}

#[test]
fn shadow_mode_records_intent_without_killing() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());
    let script = "for i in $(seq 1 30); do echo \"retry attempt 1 failed\"; sleep 0.05; done";

    let outcome = controller(&db, options(script, RolloutMode::Shadow), 95.0)
        .run()
        .expect("run");

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.terminated_by, None);
    assert!(outcome.incident_ids.is_empty());
    assert!(db.list_incidents().expect("incidents").is_empty());

    let decisions = db.events_of_type(EVENT_DECISION, 100).expect("decisions");
    let shadowed = decisions
        .iter()
        .find(|e| e.title == "LOG_ONLY")
        .expect("a log-only decision");
    assert!(shadowed
        .reason
        .starts_with("Shadow mode: would KILL. CPU exceeded 90%"));
    assert!(shadowed.incident_id.is_none());
    // Thirty ticks carry the same reason; the cooldown keeps one.
    assert_eq!(decisions.iter().filter(|e| e.title == "LOG_ONLY").count(), 1);
    assert!(decisions.iter().filter(|e| e.title == "ALERT").count() <= 1);
}

#[test]
fn missing_cpu_readings_do_not_reset_the_cpu_window() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());
    let script = "for i in $(seq 1 60); do echo \"retry attempt 1 failed\"; sleep 0.05; done";
    let mut opts = options(script, RolloutMode::Enforce);
    opts.policy.cpu_window = Duration::from_secs(1);
    let counter = TokenCounter::heuristic(&opts.spec.model_id);
    let gappy: SourceFactory =
        Arc::new(|| Box::new(GappyCpu { ticks: 0 }) as Box<dyn MetricsSource>);

    let outcome = Controller::new(opts, Arc::clone(&db), counter)
        .with_metrics_source(gappy)
        .run()
        .expect("run");

    assert_eq!(outcome.terminated_by, Some(Termination::Detection));
    assert!(outcome.max_cpu >= 95.0);
    let incidents = db.list_incidents().expect("incidents");
    assert_eq!(incidents.len(), 1);
    assert!(incidents[0].reason.contains("CPU exceeded 90% for 1s"));
}

#[test]
fn token_rate_over_the_limit_kills_after_warmup() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());
    let mut opts = options(VARIED, RolloutMode::Enforce);
    opts.max_tokens_per_min = 1.0;
    opts.token_rate_warmup = Duration::from_millis(200);

    let outcome = controller(&db, opts, 5.0).run().expect("run");

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.terminated_by, Some(Termination::Detection));
    let incidents = db.list_incidents().expect("incidents");
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].exit_reason, EXIT_SAFETY_LIMIT);
    assert!(incidents[0].pattern.starts_with("Token Rate: "));
    assert!(incidents[0].reason.contains("token rate"));
}

#[test]
fn token_rate_is_ignored_during_warmup() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());
    let mut opts = options(VARIED, RolloutMode::Enforce);
    opts.max_tokens_per_min = 1.0;
    opts.token_rate_warmup = Duration::from_secs(60);

    let outcome = controller(&db, opts, 5.0).run().expect("run");

    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.terminated_by, None);
    assert!(db.list_incidents().expect("incidents").is_empty());
}

#[test]
fn custom_decider_replaces_threshold_policy() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());
    let script = "for i in $(seq 1 20); do echo \"retry attempt 1 failed\"; sleep 0.05; done";

    let outcome = controller(&db, options(script, RolloutMode::Enforce), 95.0)
        .with_decider(Box::new(AlwaysContinue))
        .run()
        .expect("run");

    assert_eq!(outcome.exit_code, 0);
    assert!(db.list_incidents().expect("incidents").is_empty());
    assert!(db.events_of_type(EVENT_DECISION, 100).expect("decisions").is_empty());
}

#[test]
fn failing_command_records_command_failure() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());

    let outcome = controller(&db, options("echo starting; exit 3", RolloutMode::Enforce), 5.0)
        .run()
        .expect("run");

    assert_eq!(outcome.exit_code, 3);
    assert_eq!(outcome.terminated_by, None);
    let incidents = db.list_incidents().expect("incidents");
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].exit_reason, EXIT_COMMAND_FAILURE);
    assert_eq!(incidents[0].pattern, "N/A");
}

#[test]
fn clean_exit_records_no_incident() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());

    let outcome = controller(&db, options("echo done", RolloutMode::Enforce), 5.0)
        .run()
        .expect("run");

    assert_eq!(outcome.exit_code, 0);
    assert!(db.list_incidents().expect("incidents").is_empty());
}

#[test]
fn shutdown_request_terminates_the_worker() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());

    let controller = controller(&db, options("sleep 30", RolloutMode::Enforce), 1.0);
    let shutdown = controller.shutdown_handle();
    let runner = thread::spawn(move || controller.run());

    thread::sleep(Duration::from_millis(300));
    shutdown.request(libc::SIGINT);
    let outcome = runner.join().expect("join").expect("run");

    assert_eq!(outcome.terminated_by, Some(Termination::User));
    assert_eq!(outcome.exit_code, 1);
    let incidents = db.list_incidents().expect("incidents");
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].exit_reason, EXIT_USER_TERMINATED);
    assert_eq!(incidents[0].pattern, "N/A");
}

#[test]
fn no_kill_escalates_watchdog_instead() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());
    let script = "for i in $(seq 1 30); do echo \"retry attempt 1 failed\"; sleep 0.05; done";
    let mut opts = options(script, RolloutMode::Enforce);
    opts.spec.no_kill = true;

    let outcome = controller(&db, opts, 95.0).run().expect("run");

    assert_eq!(outcome.exit_code, 0);
    assert!(db.list_incidents().expect("incidents").is_empty());
    let audits = db.events_of_type(EVENT_AUDIT, 100).expect("audits");
    assert_eq!(
        audits.iter().filter(|e| e.title == "WATCHDOG_ALERT").count(),
        1
    );
}

#[test]
fn empty_command_is_rejected_before_launch() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());
    let mut opts = options("true", RolloutMode::Enforce);
    opts.spec = RunSpec::new(Vec::new());

    assert!(controller(&db, opts, 1.0).run().is_err());
    assert!(db.timeline(10).expect("timeline").is_empty());
}

#[test]
fn restart_on_breach_stops_at_the_restart_budget() {
    let temp_dir = tempfile::tempdir().expect("temp dir");
    let db = open_db(temp_dir.path());
    let mut opts = options(LOOPING, RolloutMode::Enforce);
    opts.policy.restart_on_breach = true;
    opts.lifecycle.restart_budget_max = 2;

    let outcome = controller(&db, opts, 95.0).run().expect("run");

    assert_eq!(outcome.exit_code, 1);
    assert_eq!(outcome.terminated_by, Some(Termination::Detection));
    let incidents = db.list_incidents().expect("incidents");
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].action, "RESTART");
    assert_eq!(incidents[0].recovery_status, "restarting");

    let audits = db.events_of_type(EVENT_AUDIT, 100).expect("audits");
    assert_eq!(audits.iter().filter(|e| e.title == "AUTO_RESTART").count(), 3);
    assert_eq!(
        audits.iter().filter(|e| e.title == "AUTO_RESTART_FAILED").count(),
        1
    );
    let lifecycle = db
        .events_of_type(EVENT_LIFECYCLE, 200)
        .expect("lifecycle events");
    assert!(lifecycle
        .iter()
        .any(|e| e.reason.starts_with("restart_budget_blocked")));
    assert_eq!(
        lifecycle
            .iter()
            .filter(|e| e.reason == "restart_completed")
            .count(),
        2
    );
}
