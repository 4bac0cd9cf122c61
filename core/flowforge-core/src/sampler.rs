//! Periodic resource sampling for the supervised process.
//!
//! One sampler runs per launched process. It ticks every `poll_interval`,
//! reads CPU, RSS and descriptor counts, and hands each [`Sample`] to the
//! controller. It stops on cancellation or once the process is gone.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::debug;

use crate::supervisor::process_alive;
use crate::task::{CancelToken, TaskHandle};

#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub t: Instant,
    pub pid: i32,
    pub cpu_pct: Option<f64>,
    pub rss_bytes: Option<u64>,
    pub open_fds: Option<u64>,
    pub socket_count: Option<u64>,
    /// Set only when deep watch is enabled and the probing detector fires.
    pub probing: bool,
}

impl Sample {
    pub fn memory_mb(&self) -> Option<f64> {
        self.rss_bytes.map(|bytes| bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Raw readings for one tick. Any field may be unavailable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reading {
    pub cpu_pct: Option<f64>,
    pub rss_bytes: Option<u64>,
    pub open_fds: Option<u64>,
    pub socket_count: Option<u64>,
}

/// Source of per-process metrics. `None` means the process could not be read.
pub trait MetricsSource: Send {
    fn read(&mut self, pid: i32) -> Option<Reading>;
}

impl<T: MetricsSource + ?Sized> MetricsSource for Box<T> {
    fn read(&mut self, pid: i32) -> Option<Reading> {
        (**self).read(pid)
    }
}

/// Builds a fresh source for each launched process.
pub type SourceFactory = std::sync::Arc<dyn Fn() -> Box<dyn MetricsSource> + Send + Sync>;

pub fn sysinfo_factory() -> SourceFactory {
    std::sync::Arc::new(|| Box::new(SysinfoSource::new()) as Box<dyn MetricsSource>)
}

pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoSource {
    fn read(&mut self, pid: i32) -> Option<Reading> {
        let sys_pid = Pid::from(pid as usize);
        if !self.system.refresh_process_specifics(
            sys_pid,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        ) {
            return None;
        }
        let process = self.system.process(sys_pid)?;
        let (open_fds, socket_count) = match descriptor_counts(pid) {
            Some((fds, sockets)) => (Some(fds), Some(sockets)),
            None => (None, None),
        };
        Some(Reading {
            cpu_pct: Some(f64::from(process.cpu_usage())),
            rss_bytes: Some(process.memory()),
            open_fds,
            socket_count,
        })
    }
}

/// `(open fds, sockets)` from `/proc/<pid>/fd`.
fn descriptor_counts(pid: i32) -> Option<(u64, u64)> {
    let entries = std::fs::read_dir(format!("/proc/{}/fd", pid)).ok()?;
    let mut fds = 0u64;
    let mut sockets = 0u64;
    for entry in entries.flatten() {
        fds += 1;
        if let Ok(target) = std::fs::read_link(entry.path()) {
            if target.to_string_lossy().starts_with("socket:") {
                sockets += 1;
            }
        }
    }
    Some((fds, sockets))
}

/// Flags bursts of sockets or descriptors relative to the first reading.
#[derive(Debug, Default)]
pub struct ProbeDetector {
    baselines: HashMap<i32, (u64, u64)>,
}

impl ProbeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, pid: i32, fds: u64, sockets: u64) -> bool {
        let (base_fds, base_sockets) = *self.baselines.entry(pid).or_insert((fds, sockets));
        let socket_burst = sockets > 50 && sockets > base_sockets.saturating_mul(2);
        let fd_burst = fds > base_fds.saturating_mul(3) && fds > 20;
        socket_burst || fd_burst
    }

    pub fn forget(&mut self, pid: i32) {
        self.baselines.remove(&pid);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub poll_interval: Duration,
    pub deep_watch: bool,
}

/// Starts sampling `pid`. `emit` returns `false` once the receiver is gone.
pub fn spawn<S, E>(
    pid: i32,
    config: SamplerConfig,
    source: S,
    emit: E,
) -> std::io::Result<TaskHandle>
where
    S: MetricsSource + 'static,
    E: Fn(Sample) -> bool + Send + 'static,
{
    TaskHandle::spawn("sampler", move |token| {
        run_loop(pid, config, source, emit, token)
    })
}

fn run_loop<S, E>(pid: i32, config: SamplerConfig, mut source: S, emit: E, token: CancelToken)
where
    S: MetricsSource,
    E: Fn(Sample) -> bool,
{
    let mut detector = ProbeDetector::new();
    loop {
        if token.wait_timeout(config.poll_interval) {
            break;
        }
        let reading = match source.read(pid) {
            Some(reading) => reading,
            None if !process_alive(pid) => {
                debug!(pid, "Sampled process is gone; sampler exiting");
                break;
            }
            None => {
                debug!(pid, "Sampling failed; skipping tick");
                continue;
            }
        };

        let probing = match (config.deep_watch, reading.open_fds, reading.socket_count) {
            (true, Some(fds), Some(sockets)) => detector.observe(pid, fds, sockets),
            _ => false,
        };
        let sample = Sample {
            t: Instant::now(),
            pid,
            cpu_pct: reading.cpu_pct,
            rss_bytes: reading.rss_bytes,
            open_fds: reading.open_fds,
            socket_count: reading.socket_count,
            probing,
        };
        if !emit(sample) {
            break;
        }
    }
    detector.forget(pid);
}
