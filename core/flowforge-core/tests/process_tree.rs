use flowforge_core::supervisor::{group_alive, process_alive, Sink};
use flowforge_core::{LaunchSpec, Supervisor};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::{Duration, Instant};

#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("capture lock")).into_owned()
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("capture lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn wait_for_line(captured: &Captured, timeout: Duration) -> String {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        let text = captured.text();
        if let Some(line) = text.lines().next() {
            if text.contains('\n') {
                return line.trim().to_string();
            }
        }
        sleep(Duration::from_millis(20));
    }
    panic!("Timed out waiting for child output");
}

#[test]
fn stop_reaps_background_descendants() {
    let stdout = Captured::default();
    let spec = LaunchSpec {
        argv: vec![
            "sh".into(),
            "-c".into(),
            "sleep 30 & echo $!; wait".into(),
        ],
        ..LaunchSpec::default()
    };
    let supervisor = Supervisor::start(
        &spec,
        Box::new(stdout.clone()) as Sink,
        Box::new(io::sink()) as Sink,
    )
    .expect("start");

    let grandchild: i32 = wait_for_line(&stdout, Duration::from_secs(5))
        .parse()
        .expect("grandchild pid");
    assert!(process_alive(grandchild));

    supervisor.stop(Duration::from_millis(500)).expect("stop");

    assert!(!group_alive(supervisor.pid()));
    assert!(!process_alive(grandchild));
    assert!(supervisor.exit_status().is_some());
}

#[test]
fn stop_escalates_for_descendants_ignoring_term() {
    let stdout = Captured::default();
    let spec = LaunchSpec {
        argv: vec![
            "sh".into(),
            "-c".into(),
            "trap '' TERM; (trap '' TERM; sleep 30) & echo $!; wait".into(),
        ],
        ..LaunchSpec::default()
    };
    let supervisor = Supervisor::start(
        &spec,
        Box::new(stdout.clone()) as Sink,
        Box::new(io::sink()) as Sink,
    )
    .expect("start");
    let grandchild: i32 = wait_for_line(&stdout, Duration::from_secs(5))
        .parse()
        .expect("grandchild pid");

    let started = Instant::now();
    supervisor.stop(Duration::from_millis(300)).expect("stop");

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(!process_alive(grandchild));
}
