//! Runtime configuration.
//!
//! `config.toml` in the daemon directory supplies defaults for every run;
//! command-line overrides are applied on top and the merged [`RunSpec`] is
//! validated once more. A missing file means built-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{FlowforgeError, Result};
use crate::lifecycle::LifecycleConfig;
use crate::policy::{Policy, RolloutMode};
use crate::tokens::DEFAULT_MODEL;

pub const DAEMON_DIR_ENV: &str = "FLOWFORGE_DAEMON_DIR";
pub const DB_PATH_ENV: &str = "FLOWFORGE_DB_PATH";
pub const CONTROL_SOCKET_ENV: &str = "FLOWFORGE_CONTROL_SOCKET";
pub const DEBUG_LOG_ENV: &str = "FLOWFORGE_DEBUG_LOG";

const DEFAULT_DAEMON_RELATIVE_DIR: &str = ".flowforge/daemon";
const CONFIG_FILENAME: &str = "config.toml";
const DB_FILENAME: &str = "flowforge.db";
const SOCKET_FILENAME: &str = "control.sock";
const DEFAULT_PROFILE: &str = "standard";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunSection {
    pub max_cpu_pct: f64,
    pub poll_interval_ms: u64,
    pub log_window: usize,
    pub model_id: String,
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            max_cpu_pct: 90.0,
            poll_interval_ms: 500,
            log_window: 10,
            model_id: DEFAULT_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicySection {
    pub cpu_window_secs: u64,
    pub max_memory_mb: f64,
    pub max_log_repetition: f64,
    pub min_log_entropy: f64,
    pub restart_on_breach: bool,
    pub rollout_mode: String,
    pub canary_percent: u8,
    pub max_tokens_per_min: f64,
    pub alert_cooldown_secs: u64,
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            cpu_window_secs: 0,
            max_memory_mb: 0.0,
            max_log_repetition: 0.80,
            min_log_entropy: 0.20,
            restart_on_breach: false,
            rollout_mode: RolloutMode::Enforce.as_str().to_string(),
            canary_percent: 10,
            max_tokens_per_min: 0.0,
            alert_cooldown_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleSection {
    pub stop_grace_ms: u64,
    pub kill_replay_window_ms: u64,
    pub restart_budget_max: usize,
    pub restart_budget_window_secs: u64,
}

impl Default for LifecycleSection {
    fn default() -> Self {
        Self {
            stop_grace_ms: 2000,
            kill_replay_window_ms: 2000,
            restart_budget_max: 3,
            restart_budget_window_secs: 300,
        }
    }
}

/// Named overrides for the `[run]` sampling knobs, e.g. `[profiles.heavy]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileSection {
    pub max_cpu_pct: Option<f64>,
    pub poll_interval_ms: Option<u64>,
    pub log_window: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlowforgeConfig {
    pub profile: Option<String>,
    pub run: RunSection,
    pub policy: PolicySection,
    pub lifecycle: LifecycleSection,
    pub profiles: BTreeMap<String, ProfileSection>,
}

impl FlowforgeConfig {
    /// Checks ranges on the file values.
    pub fn validate(&self) -> Result<()> {
        check_range("run.max_cpu_pct", self.run.max_cpu_pct, 1.0, 100.0)?;
        check_range("run.poll_interval_ms", self.run.poll_interval_ms as f64, 50.0, 60000.0)?;
        check_range("run.log_window", self.run.log_window as f64, 2.0, 10000.0)?;
        self.rollout_mode()?;
        check_range("policy.canary_percent", f64::from(self.policy.canary_percent), 0.0, 100.0)?;
        check_range("policy.max_log_repetition", self.policy.max_log_repetition, 0.0, 1.0)?;
        check_range("policy.min_log_entropy", self.policy.min_log_entropy, 0.0, 1.0)?;
        if self.policy.max_memory_mb < 0.0 {
            return Err(FlowforgeError::Config(
                "policy.max_memory_mb must be >= 0".to_string(),
            ));
        }
        if self.policy.max_tokens_per_min < 0.0 {
            return Err(FlowforgeError::Config(
                "policy.max_tokens_per_min must be >= 0".to_string(),
            ));
        }
        for (name, profile) in &self.profiles {
            if let Some(cpu) = profile.max_cpu_pct {
                check_range(&format!("profiles.{name}.max_cpu_pct"), cpu, 1.0, 100.0)?;
            }
            if let Some(poll) = profile.poll_interval_ms {
                check_range(&format!("profiles.{name}.poll_interval_ms"), poll as f64, 50.0, 60000.0)?;
            }
            if let Some(window) = profile.log_window {
                check_range(&format!("profiles.{name}.log_window"), window as f64, 2.0, 10000.0)?;
            }
        }
        Ok(())
    }

    pub fn rollout_mode(&self) -> Result<RolloutMode> {
        RolloutMode::parse(&self.policy.rollout_mode).ok_or_else(|| {
            FlowforgeError::Config(
                "policy.rollout_mode must be one of shadow|canary|enforce".to_string(),
            )
        })
    }

    /// Builds the decider policy for a run.
    pub fn policy(&self, spec: &RunSpec) -> Policy {
        Policy {
            max_cpu_pct: spec.max_cpu_pct,
            cpu_window: Duration::from_secs(self.policy.cpu_window_secs),
            max_memory_mb: self.policy.max_memory_mb,
            max_log_repetition: self.policy.max_log_repetition,
            min_log_entropy: self.policy.min_log_entropy,
            restart_on_breach: self.policy.restart_on_breach,
            rollout_mode: spec.rollout_mode,
            canary_percent: spec.canary_percent,
        }
    }

    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            stop_grace: Duration::from_millis(self.lifecycle.stop_grace_ms),
            kill_replay_window: Duration::from_millis(self.lifecycle.kill_replay_window_ms),
            restart_budget_max: self.lifecycle.restart_budget_max,
            restart_budget_window: Duration::from_secs(self.lifecycle.restart_budget_window_secs),
        }
    }

    /// Merges file values, the active profile, then CLI overrides.
    pub fn run_spec(&self, argv: Vec<String>, overrides: RunOverrides) -> Result<RunSpec> {
        let mut run = self.run.clone();
        let active = overrides
            .profile
            .clone()
            .or_else(|| self.profile.clone())
            .unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        match self.profiles.get(&active) {
            Some(profile) => {
                if let Some(cpu) = profile.max_cpu_pct.filter(|cpu| *cpu > 0.0) {
                    run.max_cpu_pct = cpu;
                }
                if let Some(poll) = profile.poll_interval_ms.filter(|poll| *poll > 0) {
                    run.poll_interval_ms = poll;
                }
                if let Some(window) = profile.log_window.filter(|window| *window > 0) {
                    run.log_window = window;
                }
            }
            None if overrides.profile.is_some() => {
                return Err(FlowforgeError::Config(format!(
                    "profile '{}' is not defined in the configuration",
                    active
                )));
            }
            None => {}
        }

        let rollout_mode = match overrides.rollout_mode.as_deref() {
            Some(raw) => RolloutMode::parse(raw).ok_or_else(|| {
                FlowforgeError::InvalidRunSpec(
                    "rollout mode must be one of shadow|canary|enforce".to_string(),
                )
            })?,
            None => self.rollout_mode()?,
        };

        let spec = RunSpec {
            command: argv.join(" "),
            argv,
            cwd: overrides.cwd,
            max_cpu_pct: overrides.max_cpu_pct.unwrap_or(run.max_cpu_pct),
            poll_interval_ms: overrides.poll_interval_ms.unwrap_or(run.poll_interval_ms),
            log_window: overrides.log_window.unwrap_or(run.log_window),
            model_id: overrides.model_id.unwrap_or(run.model_id),
            rollout_mode,
            canary_percent: overrides.canary_percent.unwrap_or(self.policy.canary_percent),
            no_kill: overrides.no_kill,
            deep_watch: overrides.deep_watch,
            inject_feedback: overrides.inject_feedback,
            linger: overrides.linger,
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Command-line values that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub profile: Option<String>,
    pub cwd: Option<PathBuf>,
    pub max_cpu_pct: Option<f64>,
    pub poll_interval_ms: Option<u64>,
    pub log_window: Option<usize>,
    pub model_id: Option<String>,
    pub rollout_mode: Option<String>,
    pub canary_percent: Option<u8>,
    pub no_kill: bool,
    pub deep_watch: bool,
    pub inject_feedback: Option<PathBuf>,
    pub linger: bool,
}

/// Everything captured at launch. Immutable for the life of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSpec {
    pub command: String,
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub max_cpu_pct: f64,
    pub poll_interval_ms: u64,
    pub log_window: usize,
    pub model_id: String,
    pub rollout_mode: RolloutMode,
    pub canary_percent: u8,
    pub no_kill: bool,
    pub deep_watch: bool,
    pub inject_feedback: Option<PathBuf>,
    pub linger: bool,
}

impl RunSpec {
    /// A spec with default knobs for `argv`.
    pub fn new(argv: Vec<String>) -> Self {
        let run = RunSection::default();
        Self {
            command: argv.join(" "),
            argv,
            cwd: None,
            max_cpu_pct: run.max_cpu_pct,
            poll_interval_ms: run.poll_interval_ms,
            log_window: run.log_window,
            model_id: run.model_id,
            rollout_mode: RolloutMode::Enforce,
            canary_percent: 10,
            no_kill: false,
            deep_watch: false,
            inject_feedback: None,
            linger: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.argv.is_empty() || self.argv[0].trim().is_empty() {
            return Err(FlowforgeError::InvalidRunSpec(
                "a command to run is required".to_string(),
            ));
        }
        let invalid = |msg: &str| Err(FlowforgeError::InvalidRunSpec(msg.to_string()));
        if !(1.0..=100.0).contains(&self.max_cpu_pct) {
            return invalid("max_cpu_pct must be between 1 and 100");
        }
        if !(50..=60000).contains(&self.poll_interval_ms) {
            return invalid("poll_interval_ms must be between 50 and 60000");
        }
        if !(2..=10000).contains(&self.log_window) {
            return invalid("log_window must be between 2 and 10000");
        }
        if self.canary_percent > 100 {
            return invalid("canary_percent must be between 0 and 100");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn check_range(key: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if value < min || value > max || value.is_nan() {
        return Err(FlowforgeError::Config(format!(
            "{} must be between {:.1} and {:.1}",
            key, min, max
        )));
    }
    Ok(())
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var_os(name)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

pub fn daemon_dir() -> Result<PathBuf> {
    if let Some(dir) = env_path(DAEMON_DIR_ENV) {
        return Ok(dir);
    }
    let home = dirs::home_dir()
        .ok_or_else(|| FlowforgeError::Config("Home directory not found".to_string()))?;
    Ok(home.join(DEFAULT_DAEMON_RELATIVE_DIR))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(daemon_dir()?.join(CONFIG_FILENAME))
}

pub fn db_path() -> Result<PathBuf> {
    match env_path(DB_PATH_ENV) {
        Some(path) => Ok(path),
        None => Ok(daemon_dir()?.join(DB_FILENAME)),
    }
}

pub fn control_socket_path() -> Result<PathBuf> {
    match env_path(CONTROL_SOCKET_ENV) {
        Some(path) => Ok(path),
        None => Ok(daemon_dir()?.join(SOCKET_FILENAME)),
    }
}

pub fn load_config(path: Option<PathBuf>) -> Result<FlowforgeConfig> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(FlowforgeConfig::default());
    }

    let content = fs_err::read_to_string(&config_path)?;
    let config = parse_config(&config_path, &content)?;
    config.validate()?;
    Ok(config)
}

fn parse_config(path: &Path, content: &str) -> Result<FlowforgeConfig> {
    toml::from_str::<FlowforgeConfig>(content).map_err(|err| FlowforgeError::ConfigMalformed {
        path: path.to_path_buf(),
        details: err.to_string(),
    })
}
