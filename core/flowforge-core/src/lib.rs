//! # flowforge-core
//!
//! Supervision pipeline for one local agent process: spawn it in its own
//! process group, observe its output, sample its resources, decide on a
//! policy and drive the worker lifecycle. Every decision lands in an
//! append-only event store that can be exported as a signed evidence bundle.
//!
//! ## Design Principles
//!
//! - **Synchronous**: threads and channels, no async runtime.
//! - **Single decision loop**: the [`Controller`] owns the pipeline; helpers
//!   only feed it messages.
//! - **Append-only history**: events are never updated or deleted.
//! - **Pure policy**: [`Decider::evaluate`] sees telemetry and policy only.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use flowforge_core::{load_config, Controller, ControllerOptions, Db, FieldCipher};
//!
//! let config = load_config(None)?;
//! let spec = config.run_spec(argv, Default::default())?;
//! let db = Arc::new(Db::open(db_path(), FieldCipher::from_env()?)?);
//! let outcome = Controller::new(ControllerOptions::from_config(&config, spec), db, counter).run()?;
//! ```

pub mod config;
pub mod control;
pub mod controller;
pub mod crypto;
pub mod db;
pub mod error;
pub mod evidence;
pub mod idempotency;
pub mod journal;
pub mod lifecycle;
pub mod metrics;
pub mod normalize;
pub mod observer;
pub mod policy;
pub mod redact;
pub mod sampler;
pub mod stagnation;
pub mod supervisor;
pub mod task;
pub mod tokens;

pub use config::{
    control_socket_path, daemon_dir, db_path, default_config_path, load_config, FlowforgeConfig,
    RunOverrides, RunSpec,
};
pub use control::ControlPlane;
pub use controller::{
    Controller, ControllerOptions, RunOutcome, ShutdownHandle, Termination,
};
pub use crypto::{FieldCipher, MASTER_KEY_ENV};
pub use db::{Db, Event, Incident, ReplayRecord, ReplayStats};
pub use error::{FlowforgeError, Result};
pub use evidence::{ExportOptions, ExportResult, Manifest, VerifyResult};
pub use journal::Journal;
pub use metrics::{Metrics, MetricsSnapshot};
pub use lifecycle::{LifecycleConfig, LifecycleSnapshot, Phase, WorkerLifecycle};
pub use observer::LogObserver;
pub use policy::{Action, Decider, Decision, Policy, RolloutMode, Telemetry, ThresholdDecider};
pub use supervisor::{ExitStatus, LaunchSpec, Supervisor};
pub use tokens::{estimate_cost, EncoderCache, TokenCounter};
