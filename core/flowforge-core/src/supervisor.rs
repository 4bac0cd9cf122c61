//! Process-group supervisor for a single child.
//!
//! The child is started as the leader of a fresh process group so that
//! every descendant it forks can be signalled at once. `stop` escalates
//! SIGTERM → SIGKILL against the whole group and is safe to call from any
//! number of threads; concurrent calls coalesce onto one teardown.

use std::io::{self, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{FlowforgeError, Result};

pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);
const KILL_WAIT: Duration = Duration::from_secs(2);
const POLL_INTERVAL: Duration = Duration::from_millis(25);
const READ_CHUNK_SIZE: usize = 4096;

pub type Sink = Box<dyn Write + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitStatus {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    fn from_std(status: std::process::ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LaunchSpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Environment variables removed from the inherited environment.
    pub env_remove: Vec<String>,
    /// Single-shot stdin payload; stdin is closed after it is written.
    pub stdin: Option<Vec<u8>>,
}

struct ExitCell {
    status: Mutex<Option<ExitStatus>>,
    cond: Condvar,
}

pub struct Supervisor {
    pid: i32,
    exit: Arc<ExitCell>,
    /// Cached outcome of the first completed stop; `Some(pgid)` on failure.
    stop_outcome: Mutex<Option<std::result::Result<(), i32>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    /// Spawns the child in its own process group and tees its output.
    pub fn start(spec: &LaunchSpec, stdout_sink: Sink, stderr_sink: Sink) -> Result<Self> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| FlowforgeError::StartFailure {
                cause: "argv is empty".to_string(),
            })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for key in &spec.env_remove {
            command.env_remove(key);
        }

        let mut child = command.spawn().map_err(|err| FlowforgeError::StartFailure {
            cause: format!("{}: {}", program, err),
        })?;
        let pid = child.id() as i32;

        if let (Some(payload), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            thread::spawn(move || {
                if let Err(err) = stdin.write_all(&payload) {
                    debug!(pid, error = %err, "Failed to feed child stdin");
                }
            });
        }
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump("stdout", stdout, stdout_sink));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump("stderr", stderr, stderr_sink));
        }

        let exit = Arc::new(ExitCell {
            status: Mutex::new(None),
            cond: Condvar::new(),
        });
        let waiter_exit = Arc::clone(&exit);
        thread::spawn(move || {
            let status = match child.wait() {
                Ok(status) => ExitStatus::from_std(status),
                Err(err) => {
                    warn!(pid, error = %err, "Failed to wait on child");
                    ExitStatus {
                        code: None,
                        signal: None,
                    }
                }
            };
            let mut slot = waiter_exit.status.lock().unwrap_or_else(|p| p.into_inner());
            *slot = Some(status);
            waiter_exit.cond.notify_all();
        });

        info!(pid, program = %program, "Supervised process started");
        Ok(Self {
            pid,
            exit,
            stop_outcome: Mutex::new(None),
            pumps: Mutex::new(pumps),
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Waits until both output pumps hit EOF and flushed their sinks.
    /// Returns false if a pipe is still open at the deadline, which happens
    /// when a detached grandchild keeps the write end alive.
    pub fn drain_output(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut pumps = self.pumps.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            let (done, open): (Vec<_>, Vec<_>) =
                pumps.drain(..).partition(|pump| pump.is_finished());
            *pumps = open;
            for pump in done {
                if pump.join().is_err() {
                    warn!(pid = self.pid, "Output pump panicked");
                }
            }
            if pumps.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    pub fn exited(&self) -> bool {
        self.exit_status().is_some()
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Blocks until the child terminates.
    pub fn wait(&self) -> ExitStatus {
        let mut slot = self.exit.status.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(status) = *slot {
                return status;
            }
            slot = match self.exit.cond.wait(slot) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<ExitStatus> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.exit.status.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            if let Some(status) = *slot {
                return Some(status);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            slot = match self.exit.cond.wait_timeout(slot, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Terminates the process group. Idempotent: later calls return the
    /// outcome of the first.
    pub fn stop(&self, grace: Duration) -> Result<()> {
        let mut outcome = self.stop_outcome.lock().unwrap_or_else(|p| p.into_inner());
        if outcome.is_none() {
            *outcome = Some(self.teardown(grace));
        }
        match outcome.as_ref() {
            Some(Err(pgid)) => Err(FlowforgeError::TeardownFailure { pgid: *pgid }),
            _ => Ok(()),
        }
    }

    fn teardown(&self, grace: Duration) -> std::result::Result<(), i32> {
        let pgid = self.pid;
        info!(pid = pgid, grace_ms = grace.as_millis() as u64, "Stopping process group");

        self.signal_all(libc::SIGTERM);
        if self.wait_gone(grace) {
            return Ok(());
        }

        warn!(pid = pgid, "Process group survived SIGTERM; escalating to SIGKILL");
        self.signal_all(libc::SIGKILL);
        if self.wait_gone(KILL_WAIT) {
            return Ok(());
        }

        warn!(pid = pgid, "Process group still alive after SIGKILL");
        Err(pgid)
    }

    fn signal_all(&self, signal: i32) {
        if let Err(err) = send_signal(-self.pid, signal) {
            debug!(pid = self.pid, signal, error = %err, "Group signal failed");
        }
        // The leader is only signalled while unreaped so a recycled pid is never hit.
        if !self.exited() {
            if let Err(err) = send_signal(self.pid, signal) {
                debug!(pid = self.pid, signal, error = %err, "Leader signal failed");
            }
        }
    }

    fn wait_gone(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if self.wait_timeout(timeout).is_none() {
            return false;
        }
        loop {
            if !group_alive(self.pid) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

/// Sends `signal` to a pid (or a group when negative). ESRCH counts as success.
pub fn send_signal(target: i32, signal: i32) -> io::Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(target, signal) };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// True while any non-zombie member of the group remains.
pub fn group_alive(pgid: i32) -> bool {
    if !accepts_signal0(-pgid) {
        return false;
    }
    match live_group_members(pgid) {
        Some(count) => count > 0,
        None => true,
    }
}

/// True while `pid` exists and has not become a zombie.
pub fn process_alive(pid: i32) -> bool {
    if !accepts_signal0(pid) {
        return false;
    }
    match proc_stat(pid) {
        Some((state, _)) => !matches!(state, 'Z' | 'X'),
        None => true,
    }
}

/// Signal-0 liveness check. EPERM means the target exists under another uid.
fn accepts_signal0(target: i32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(target, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// `(state, pgrp)` from `/proc/<pid>/stat`; `None` where procfs is unavailable.
fn proc_stat(pid: i32) -> Option<(char, i32)> {
    let raw = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // comm may contain spaces and parens, so parse after the last ')'.
    let rest = &raw[raw.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let state = fields.next()?.chars().next()?;
    let _ppid = fields.next()?;
    let pgrp = fields.next()?.parse().ok()?;
    Some((state, pgrp))
}

/// Counts running members of a process group, or `None` without procfs.
fn live_group_members(pgid: i32) -> Option<usize> {
    let entries = std::fs::read_dir("/proc").ok()?;
    let count = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter_map(proc_stat)
        .filter(|(state, pgrp)| *pgrp == pgid && !matches!(state, 'Z' | 'X'))
        .count();
    Some(count)
}

fn spawn_pump<R: Read + Send + 'static>(
    stream: &'static str,
    mut reader: R,
    mut sink: Sink,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    if let Err(err) = sink.write_all(&chunk[..n]) {
                        debug!(stream, error = %err, "Output sink rejected write");
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    debug!(stream, error = %err, "Output pipe read failed");
                    break;
                }
            }
        }
        let _ = sink.flush();
    })
}

/// Fans one stream out to several sinks. A sink that fails is dropped and
/// the others keep receiving output.
pub struct Tee {
    sinks: Vec<Option<Sink>>,
}

impl Tee {
    pub fn new(sinks: Vec<Sink>) -> Self {
        Self {
            sinks: sinks.into_iter().map(Some).collect(),
        }
    }

    fn live(&self) -> usize {
        self.sinks.iter().filter(|sink| sink.is_some()).count()
    }
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for (index, slot) in self.sinks.iter_mut().enumerate() {
            let Some(sink) = slot.as_mut() else { continue };
            if let Err(err) = sink.write_all(buf) {
                warn!(sink = index, error = %err, "Output sink failed; dropping it");
                *slot = None;
            }
        }
        if self.live() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "every output sink failed",
            ));
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        for (index, slot) in self.sinks.iter_mut().enumerate() {
            let Some(sink) = slot.as_mut() else { continue };
            if let Err(err) = sink.flush() {
                warn!(sink = index, error = %err, "Output sink flush failed; dropping it");
                *slot = None;
            }
        }
        Ok(())
    }
}
