//! Threshold and stagnation policy decider.
//!
//! Evaluation is a pure function of `(Telemetry, Policy)`. Canary bucketing
//! hashes the rollout key with FNV-1a so a key maps to the same bucket in
//! every process.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const DEFAULT_ROLLOUT_KEY: &str = "default-rollout-key";
const PROGRESS_DIVERSITY_FLOOR: f64 = 0.9;
const PROGRESS_SUPPRESSED: &str = "progressing output pattern detected; destructive action suppressed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Continue,
    Alert,
    Kill,
    Restart,
    LogOnly,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Continue => "CONTINUE",
            Action::Alert => "ALERT",
            Action::Kill => "KILL",
            Action::Restart => "RESTART",
            Action::LogOnly => "LOG_ONLY",
        }
    }

    pub fn is_destructive(self) -> bool {
        matches!(self, Action::Kill | Action::Restart)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutMode {
    #[default]
    Enforce,
    Shadow,
    Canary,
}

impl RolloutMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RolloutMode::Enforce => "enforce",
            RolloutMode::Shadow => "shadow",
            RolloutMode::Canary => "canary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "enforce" => Some(RolloutMode::Enforce),
            "shadow" => Some(RolloutMode::Shadow),
            "canary" => Some(RolloutMode::Canary),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    /// `None` when the tick could not read CPU; the CPU predicate is skipped.
    pub cpu_pct: Option<f64>,
    pub cpu_over_for: Duration,
    pub memory_mb: Option<f64>,
    pub log_repetition: f64,
    pub log_entropy: f64,
    pub raw_diversity: f64,
    pub progress_like: bool,
    pub rollout_key: String,
}

/// Thresholds. A non-positive limit disables its predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub max_cpu_pct: f64,
    pub cpu_window: Duration,
    pub max_memory_mb: f64,
    pub max_log_repetition: f64,
    pub min_log_entropy: f64,
    pub restart_on_breach: bool,
    pub rollout_mode: RolloutMode,
    pub canary_percent: u8,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            max_cpu_pct: 90.0,
            cpu_window: Duration::ZERO,
            max_memory_mb: 0.0,
            max_log_repetition: 0.80,
            min_log_entropy: 0.20,
            restart_on_breach: false,
            rollout_mode: RolloutMode::Enforce,
            canary_percent: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub action: Action,
    pub intended_action: Action,
    pub reason: String,
    pub cpu_score: f64,
    pub entropy_score: f64,
    pub confidence: f64,
}

pub trait Decider: Send + Sync {
    fn evaluate(&self, telemetry: &Telemetry, policy: &Policy) -> Decision;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThresholdDecider;

impl Decider for ThresholdDecider {
    fn evaluate(&self, t: &Telemetry, p: &Policy) -> Decision {
        let cpu_score = match t.cpu_pct {
            Some(cpu) if p.max_cpu_pct > 0.0 => (cpu / p.max_cpu_pct * 100.0).clamp(0.0, 100.0),
            _ => 0.0,
        };
        let entropy_score = (t.log_entropy * 100.0).clamp(0.0, 100.0);
        let confidence = (0.65 * cpu_score + 0.35 * (100.0 - entropy_score)).clamp(0.0, 100.0);
        let decision = |action: Action, intended_action: Action, reason: String| Decision {
            action,
            intended_action,
            reason,
            cpu_score,
            entropy_score,
            confidence,
        };

        let cpu_breach = p.max_cpu_pct > 0.0
            && t.cpu_pct.is_some_and(|cpu| cpu > p.max_cpu_pct)
            && (p.cpu_window.is_zero() || t.cpu_over_for >= p.cpu_window);
        let mem_breach =
            p.max_memory_mb > 0.0 && t.memory_mb.is_some_and(|mb| mb > p.max_memory_mb);
        let rep_breach = p.max_log_repetition > 0.0 && t.log_repetition > p.max_log_repetition;
        let ent_breach = p.min_log_entropy > 0.0 && t.log_entropy < p.min_log_entropy;

        let mut reasons = Vec::with_capacity(5);
        if cpu_breach {
            if p.cpu_window.is_zero() {
                reasons.push(format!("CPU exceeded {:.0}%", p.max_cpu_pct));
            } else {
                reasons.push(format!(
                    "CPU exceeded {:.0}% for {}s",
                    p.max_cpu_pct,
                    p.cpu_window.as_secs()
                ));
            }
        }
        if mem_breach {
            reasons.push(format!("memory exceeded {:.0}MB", p.max_memory_mb));
        }
        if rep_breach {
            reasons.push(format!("log repetition exceeded {:.2}", p.max_log_repetition));
        }
        if ent_breach {
            reasons.push(format!("log entropy dropped below {:.2}", p.min_log_entropy));
        }

        if reasons.is_empty() {
            return decision(
                Action::Continue,
                Action::Continue,
                "No thresholds breached".to_string(),
            );
        }

        let high_risk = mem_breach || (cpu_breach && (rep_breach || ent_breach));
        let mut action = match (high_risk, p.restart_on_breach) {
            (false, _) => Action::Alert,
            (true, true) => Action::Restart,
            (true, false) => Action::Kill,
        };

        if action.is_destructive()
            && t.progress_like
            && t.raw_diversity > PROGRESS_DIVERSITY_FLOOR
        {
            action = Action::Alert;
            reasons.push(PROGRESS_SUPPRESSED.to_string());
        }

        let (gated, reason) = apply_rollout(action, reasons.join(" AND "), p, &t.rollout_key);
        decision(gated, action, reason)
    }
}

/// Applies the rollout mode to an intended action. Non-destructive actions
/// pass through unchanged; destructive ones may be downgraded to `LogOnly`.
pub fn apply_rollout(
    action: Action,
    reason: String,
    policy: &Policy,
    rollout_key: &str,
) -> (Action, String) {
    if !action.is_destructive() {
        return (action, reason);
    }
    match policy.rollout_mode {
        RolloutMode::Enforce => (action, reason),
        RolloutMode::Shadow => (
            Action::LogOnly,
            format!("Shadow mode: would {}. {}", action, reason),
        ),
        RolloutMode::Canary if canary_enforces(rollout_key, policy.canary_percent) => {
            (action, format!("Canary mode: enforce. {}", reason))
        }
        RolloutMode::Canary => (Action::LogOnly, format!("Canary mode: log-only. {}", reason)),
    }
}

/// 32-bit FNV-1a.
pub fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Stable `[0, 100)` bucket for a rollout key.
pub fn canary_bucket(key: &str) -> u8 {
    let key = key.trim();
    let key = if key.is_empty() { DEFAULT_ROLLOUT_KEY } else { key };
    (fnv1a32(key.as_bytes()) % 100) as u8
}

pub fn canary_enforces(key: &str, percent: u8) -> bool {
    canary_bucket(key) < percent.min(100)
}
