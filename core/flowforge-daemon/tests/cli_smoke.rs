use flowforge_protocol::Response;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const MASTER_KEY: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

struct RunGuard {
    child: Child,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn flowforge(home: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_flowforge"));
    command
        .env("FLOWFORGE_DAEMON_DIR", home)
        .env("FLOWFORGE_MASTER_KEY", MASTER_KEY)
        .env_remove("FLOWFORGE_EVIDENCE_SIGNING_KEY")
        .env_remove("FLOWFORGE_DB_PATH")
        .env_remove("FLOWFORGE_CONTROL_SOCKET");
    command
}

fn output(command: &mut Command) -> Output {
    command.output().expect("Failed to run flowforge")
}

fn socket_path(home: &Path) -> PathBuf {
    home.join("control.sock")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for control socket at {}", path.display());
}

fn run_args(script: &str) -> [&str; 6] {
    ["run", "--no-control", "--", "sh", "-c", script]
}

fn ctl(home: &Path, args: &[&str]) -> Response {
    let out = output(flowforge(home).arg("ctl").args(args));
    serde_json::from_slice(&out.stdout).expect("Failed to parse ctl output")
}

#[test]
fn run_passes_through_output_and_exit_code() {
    let home = TempDir::new().expect("temp dir");

    let ok = output(flowforge(home.path()).args(run_args("echo hello")));
    assert_eq!(ok.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&ok.stdout).contains("hello"));

    let failed = output(flowforge(home.path()).args(run_args("exit 4")));
    assert_eq!(failed.status.code(), Some(4));
}

#[test]
fn run_without_master_key_fails() {
    let home = TempDir::new().expect("temp dir");
    let out = output(
        flowforge(home.path())
            .env_remove("FLOWFORGE_MASTER_KEY")
            .args(["run", "--no-control", "--", "true"]),
    );
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn evidence_export_then_verify() {
    let home = TempDir::new().expect("temp dir");
    let failed = output(flowforge(home.path()).args(run_args("exit 2")));
    assert_eq!(failed.status.code(), Some(2));

    let bundle = home.path().join("bundle");
    let bundle_arg = bundle.to_string_lossy().to_string();
    let export = output(
        flowforge(home.path()).args(["evidence", "export", "--out", &bundle_arg]),
    );
    assert!(export.status.success(), "export failed: {:?}", export);
    assert!(bundle.join("manifest.json").exists());
    assert!(bundle.join("signature.json").exists());

    let verify = output(flowforge(home.path()).args(["evidence", "verify", &bundle_arg]));
    assert!(verify.status.success(), "verify failed: {:?}", verify);

    std::fs::write(bundle.join("incidents.json"), b"[]\n").expect("tamper");
    let tampered = output(flowforge(home.path()).args(["evidence", "verify", &bundle_arg]));
    assert_eq!(tampered.status.code(), Some(1));

    let wrong_key = output(flowforge(home.path()).args([
        "evidence",
        "verify",
        &bundle_arg,
        "--signing-key",
        "hex:ffeeddccbbaa99887766554433221100",
    ]));
    assert_eq!(wrong_key.status.code(), Some(1));
}

#[test]
fn control_socket_serves_idempotent_kill() {
    let home = TempDir::new().expect("temp dir");
    let child = flowforge(home.path())
        .args(["run", "--linger", "--", "sleep", "30"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn flowforge run");
    let mut guard = RunGuard { child };
    wait_for_socket(&socket_path(home.path()), Duration::from_secs(5));

    let health = ctl(home.path(), &["health"]);
    assert!(health.ok);

    let status = ctl(home.path(), &["status"]);
    assert_eq!(
        status.data.as_ref().and_then(|d| d.get("phase")).and_then(|v| v.as_str()),
        Some("RUNNING")
    );

    let first = ctl(home.path(), &["--idempotency-key", "k-1", "kill"]);
    assert_eq!(first.status, 202);
    assert!(!first.idempotent_replay);

    let second = ctl(home.path(), &["--idempotency-key", "k-1", "kill"]);
    assert_eq!(second.status, 202);
    assert!(second.idempotent_replay);
    assert_eq!(second.data, first.data);

    let conflict = ctl(
        home.path(),
        &["--idempotency-key", "k-1", "kill", "--reason", "different"],
    );
    assert_eq!(conflict.status, 409);

    let metrics = ctl(home.path(), &["metrics", "--json"]);
    let counters = &metrics.data.as_ref().expect("metrics data")["counters"];
    assert_eq!(counters["process_kills"], 1);
    assert_eq!(counters["idempotent_replays"], 1);
    assert_eq!(counters["idempotency_conflicts"], 1);
    let text = output(flowforge(home.path()).args(["ctl", "metrics"]));
    assert!(String::from_utf8_lossy(&text.stdout).contains("flowforge_process_kill_total 1"));

    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(guard.child.id() as i32, libc::SIGTERM) };
    assert_eq!(rc, 0);
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(status) = guard.child.try_wait().expect("try_wait") {
            assert!(status.code().is_some());
            break;
        }
        assert!(Instant::now() < deadline, "flowforge run did not exit");
        sleep(Duration::from_millis(50));
    }
    assert!(!socket_path(home.path()).exists());

    let bundle = home.path().join("bundle");
    let bundle_arg = bundle.to_string_lossy().to_string();
    let export = output(
        flowforge(home.path()).args(["evidence", "export", "--out", &bundle_arg]),
    );
    assert!(export.status.success(), "export failed: {:?}", export);
    let incidents = std::fs::read_to_string(bundle.join("incidents.json")).expect("incidents");
    assert!(
        incidents.contains("received signal 15"),
        "SIGTERM not named in {}",
        incidents
    );
}

#[test]
fn clean_guards_and_prunes_incidents() {
    let home = TempDir::new().expect("temp dir");
    let failed = output(flowforge(home.path()).args(run_args("exit 2")));
    assert_eq!(failed.status.code(), Some(2));

    let negative = output(flowforge(home.path()).args(["clean", "--days", "-1"]));
    assert_eq!(negative.status.code(), Some(1));
    let unforced = output(flowforge(home.path()).args(["clean", "--days", "0"]));
    assert_eq!(unforced.status.code(), Some(1));

    let kept = output(flowforge(home.path()).args(["clean", "--days", "30"]));
    assert!(kept.status.success(), "clean failed: {:?}", kept);
    assert!(String::from_utf8_lossy(&kept.stdout).starts_with("removed 0 incidents"));

    let wiped = output(flowforge(home.path()).args(["clean", "--days", "0", "--force"]));
    assert!(wiped.status.success(), "clean failed: {:?}", wiped);
    assert!(String::from_utf8_lossy(&wiped.stdout).starts_with("removed 1 incidents"));
}
