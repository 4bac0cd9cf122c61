//! In-process counters for lifecycle actions and control-plane replays,
//! plus stop/restart latency against fixed SLO targets.
//!
//! One [`Metrics`] handle is shared by the lifecycle and the control plane.
//! Nothing is persisted; counters start at zero with each supervisor.

use std::fmt::{self, Write as _};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;

pub const STOP_SLO: Duration = Duration::from_secs(3);
pub const RESTART_SLO: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub count: u64,
    pub success: u64,
    pub within_slo: u64,
    pub sum_seconds: f64,
    pub last_seconds: f64,
    pub max_seconds: f64,
}

impl LatencyStats {
    fn observe(&mut self, elapsed: Duration, success: bool, slo: Duration) {
        let seconds = elapsed.as_secs_f64();
        self.count = self.count.saturating_add(1);
        if success {
            self.success = self.success.saturating_add(1);
            if elapsed <= slo {
                self.within_slo = self.within_slo.saturating_add(1);
            }
        }
        self.sum_seconds += seconds;
        self.last_seconds = seconds;
        self.max_seconds = self.max_seconds.max(seconds);
    }

    /// Share of observed operations that succeeded within the SLO.
    pub fn compliance_ratio(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.within_slo as f64 / self.count as f64
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub process_kills: u64,
    pub process_restarts: u64,
    pub restart_budget_blocked: u64,
    pub idempotent_replays: u64,
    pub idempotency_conflicts: u64,
    pub uptime_secs: u64,
    pub stop_latency: LatencyStats,
    pub restart_latency: LatencyStats,
}

struct Inner {
    started_at: Instant,
    counters: MetricsSnapshot,
}

#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                started_at: Instant::now(),
                counters: MetricsSnapshot::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_kill(&self) {
        let mut inner = self.lock();
        inner.counters.process_kills = inner.counters.process_kills.saturating_add(1);
    }

    pub fn record_restart(&self) {
        let mut inner = self.lock();
        inner.counters.process_restarts = inner.counters.process_restarts.saturating_add(1);
    }

    pub fn record_restart_budget_blocked(&self) {
        let mut inner = self.lock();
        inner.counters.restart_budget_blocked =
            inner.counters.restart_budget_blocked.saturating_add(1);
    }

    pub fn record_idempotent_replay(&self) {
        let mut inner = self.lock();
        inner.counters.idempotent_replays = inner.counters.idempotent_replays.saturating_add(1);
    }

    pub fn record_idempotency_conflict(&self) {
        let mut inner = self.lock();
        inner.counters.idempotency_conflicts =
            inner.counters.idempotency_conflicts.saturating_add(1);
    }

    pub fn observe_stop(&self, elapsed: Duration, success: bool) {
        self.lock().counters.stop_latency.observe(elapsed, success, STOP_SLO);
    }

    pub fn observe_restart(&self, elapsed: Duration, success: bool) {
        self.lock()
            .counters
            .restart_latency
            .observe(elapsed, success, RESTART_SLO);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.lock();
        MetricsSnapshot {
            uptime_secs: inner.started_at.elapsed().as_secs(),
            ..inner.counters.clone()
        }
    }

    /// Prometheus text exposition. `active` reports whether a worker is
    /// currently running.
    pub fn render_prometheus(&self, active: bool) -> String {
        let snapshot = self.snapshot();
        let mut out = String::with_capacity(4096);
        // Writing into a String cannot fail.
        let _ = write_families(&mut out, &snapshot, active);
        out
    }
}

fn write_families(out: &mut String, s: &MetricsSnapshot, active: bool) -> fmt::Result {
    family(out, "process_kill_total", "counter", "Process kill actions.", s.process_kills)?;
    family(
        out,
        "process_restart_total",
        "counter",
        "Process restart actions.",
        s.process_restarts,
    )?;
    family(
        out,
        "restart_budget_block_total",
        "counter",
        "Restart requests blocked by restart budget.",
        s.restart_budget_blocked,
    )?;
    family(
        out,
        "controlplane_idempotent_replay_total",
        "counter",
        "Replayed control-plane mutations served from persisted idempotency state.",
        s.idempotent_replays,
    )?;
    family(
        out,
        "controlplane_idempotency_conflict_total",
        "counter",
        "Conflicts where an idempotency key was reused with a different payload.",
        s.idempotency_conflicts,
    )?;
    family(out, "uptime_seconds", "gauge", "Supervisor uptime in seconds.", s.uptime_secs)?;
    family(
        out,
        "stop_slo_target_seconds",
        "gauge",
        "Stop SLO target in seconds.",
        format_args!("{:.1}", STOP_SLO.as_secs_f64()),
    )?;
    family(
        out,
        "restart_slo_target_seconds",
        "gauge",
        "Restart SLO target in seconds.",
        format_args!("{:.1}", RESTART_SLO.as_secs_f64()),
    )?;
    latency_families(out, "stop", &s.stop_latency)?;
    latency_families(out, "restart", &s.restart_latency)?;
    family(
        out,
        "active_process",
        "gauge",
        "Whether a supervised process is active.",
        u8::from(active),
    )
}

fn latency_families(out: &mut String, op: &str, stats: &LatencyStats) -> fmt::Result {
    family(
        out,
        &format!("{op}_latency_count"),
        "counter",
        &format!("Observed {op} latency operations."),
        stats.count,
    )?;
    family(
        out,
        &format!("{op}_latency_success_total"),
        "counter",
        &format!("Successful {op} operations."),
        stats.success,
    )?;
    family(
        out,
        &format!("{op}_latency_within_slo_total"),
        "counter",
        &format!("Successful {op} operations within SLO."),
        stats.within_slo,
    )?;
    family(
        out,
        &format!("{op}_latency_last_seconds"),
        "gauge",
        &format!("Last observed {op} latency in seconds."),
        format_args!("{:.6}", stats.last_seconds),
    )?;
    family(
        out,
        &format!("{op}_latency_max_seconds"),
        "gauge",
        &format!("Maximum observed {op} latency in seconds."),
        format_args!("{:.6}", stats.max_seconds),
    )?;
    family(
        out,
        &format!("{op}_latency_sum_seconds"),
        "counter",
        &format!("Sum of observed {op} latencies in seconds."),
        format_args!("{:.6}", stats.sum_seconds),
    )?;
    family(
        out,
        &format!("{op}_slo_compliance_ratio"),
        "gauge",
        &format!("Ratio of {op} operations that met SLO."),
        format_args!("{:.6}", stats.compliance_ratio()),
    )
}

fn family(
    out: &mut String,
    name: &str,
    kind: &str,
    help: &str,
    value: impl fmt::Display,
) -> fmt::Result {
    writeln!(out, "# HELP flowforge_{name} {help}")?;
    writeln!(out, "# TYPE flowforge_{name} {kind}")?;
    writeln!(out, "flowforge_{name} {value}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_tracks_success_and_slo() {
        let metrics = Metrics::new();
        metrics.observe_stop(Duration::from_millis(800), true);
        metrics.observe_stop(Duration::from_millis(3600), false);
        metrics.observe_restart(Duration::from_millis(1200), true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.stop_latency.count, 2);
        assert_eq!(snapshot.stop_latency.success, 1);
        assert_eq!(snapshot.stop_latency.within_slo, 1);
        assert!((snapshot.stop_latency.max_seconds - 3.6).abs() < 1e-9);
        assert!((snapshot.stop_latency.last_seconds - 3.6).abs() < 1e-9);
        assert!((snapshot.stop_latency.sum_seconds - 4.4).abs() < 1e-9);
        assert_eq!(snapshot.stop_latency.compliance_ratio(), 0.5);
        assert_eq!(snapshot.restart_latency.compliance_ratio(), 1.0);
    }

    #[test]
    fn slow_success_misses_the_slo() {
        let metrics = Metrics::new();
        metrics.observe_restart(Duration::from_secs(6), true);
        let stats = metrics.snapshot().restart_latency;
        assert_eq!(stats.success, 1);
        assert_eq!(stats.within_slo, 0);
        assert_eq!(stats.compliance_ratio(), 0.0);
    }

    #[test]
    fn prometheus_text_lists_every_family() {
        let metrics = Metrics::new();
        metrics.observe_stop(Duration::from_millis(800), true);
        metrics.observe_stop(Duration::from_millis(3600), false);
        metrics.observe_restart(Duration::from_millis(1200), true);
        metrics.record_restart_budget_blocked();
        metrics.record_idempotent_replay();
        metrics.record_idempotency_conflict();
        metrics.record_kill();

        let text = metrics.render_prometheus(false);
        for line in [
            "flowforge_process_kill_total 1",
            "flowforge_process_restart_total 0",
            "flowforge_stop_latency_count 2",
            "flowforge_stop_latency_success_total 1",
            "flowforge_stop_latency_within_slo_total 1",
            "flowforge_restart_latency_count 1",
            "flowforge_restart_latency_success_total 1",
            "flowforge_restart_latency_within_slo_total 1",
            "flowforge_stop_slo_compliance_ratio 0.500000",
            "flowforge_restart_slo_compliance_ratio 1.000000",
            "flowforge_stop_slo_target_seconds 3.0",
            "flowforge_restart_slo_target_seconds 5.0",
            "flowforge_restart_budget_block_total 1",
            "flowforge_controlplane_idempotent_replay_total 1",
            "flowforge_controlplane_idempotency_conflict_total 1",
            "flowforge_active_process 0",
            "# TYPE flowforge_stop_latency_max_seconds gauge",
        ] {
            assert!(text.contains(line), "missing {line:?} in\n{text}");
        }
        assert!(metrics
            .render_prometheus(true)
            .contains("flowforge_active_process 1"));
    }

    #[test]
    fn empty_store_reports_zero_compliance() {
        let snapshot = Metrics::new().snapshot();
        assert_eq!(snapshot.stop_latency.compliance_ratio(), 0.0);
        assert_eq!(snapshot.process_kills, 0);
    }
}
