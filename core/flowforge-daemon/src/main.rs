//! flowforge: local supervisor for autonomous agent processes.
//!
//! ## Subcommands
//!
//! - `run`: launch a command under supervision and serve the control socket
//! - `evidence export|verify`: signed incident bundles
//! - `ctl`: talk to a running supervisor
//! - `replays list|purge`: inspect or prune stored idempotent replies
//! - `clean`: delete old incidents and compact the database

mod clean;
mod client;
mod ctl;
mod evidence;
mod logging;
mod replays;
mod run;
mod server;
mod signals;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flowforge")]
#[command(about = "Local supervisor for autonomous agent processes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command under supervision
    Run(RunArgs),

    /// Export or verify evidence bundles
    Evidence {
        #[command(subcommand)]
        command: EvidenceCommand,
    },

    /// Send a control request to a running supervisor
    Ctl(CtlArgs),

    /// Inspect or prune stored idempotent replies
    Replays {
        #[command(subcommand)]
        command: ReplaysCommand,
    },

    /// Delete incidents older than a number of days
    Clean(CleanArgs),
}

#[derive(Args, Debug)]
pub struct CleanArgs {
    /// Keep incidents newer than this many days
    #[arg(long, default_value_t = 30, allow_negative_numbers = true)]
    pub days: i64,

    /// Required with --days 0, which deletes every incident
    #[arg(long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Config file (defaults to <daemon dir>/config.toml)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Named profile from the config file
    #[arg(long)]
    pub profile: Option<String>,

    /// Working directory for the command
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// CPU threshold in percent
    #[arg(long = "max-cpu")]
    pub max_cpu: Option<f64>,

    /// Sampling interval in milliseconds
    #[arg(long = "poll-interval")]
    pub poll_interval: Option<u64>,

    /// Number of log lines kept for stagnation analysis
    #[arg(long = "log-window")]
    pub log_window: Option<usize>,

    /// Model used for token counting and cost estimates
    #[arg(long)]
    pub model: Option<String>,

    /// Rollout mode: enforce, shadow or canary
    #[arg(long)]
    pub rollout: Option<String>,

    /// Share of runs enforced in canary mode
    #[arg(long = "canary-percent")]
    pub canary_percent: Option<u8>,

    /// Never kill or restart; escalate watchdog alerts instead
    #[arg(long = "no-kill")]
    pub no_kill: bool,

    /// Also watch descriptor and socket counts for probing
    #[arg(long)]
    pub deep: bool,

    /// File fed once to the command's stdin
    #[arg(long = "inject-feedback")]
    pub inject_feedback: Option<PathBuf>,

    /// Keep running after the command stops so it can be restarted
    #[arg(long)]
    pub linger: bool,

    /// Do not serve the control socket
    #[arg(long = "no-control")]
    pub no_control: bool,

    /// Command and arguments to supervise
    #[arg(
        value_name = "COMMAND",
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

#[derive(Subcommand, Debug)]
pub enum EvidenceCommand {
    /// Write a signed bundle of incidents and events
    Export {
        /// Output directory (defaults to ./evidence-<timestamp>)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Include the full event chain for this incident
        #[arg(long = "incident-id")]
        incident_id: Option<String>,

        /// Signing key (hex:, base64:, bare hex or raw text)
        #[arg(long = "signing-key")]
        signing_key: Option<String>,

        /// Row limit applied to each exported view
        #[arg(long, default_value_t = flowforge_core::evidence::DEFAULT_EXPORT_LIMIT)]
        limit: usize,
    },

    /// Check a bundle's signature and file digests
    Verify {
        /// Bundle directory
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Signing key (hex:, base64:, bare hex or raw text)
        #[arg(long = "signing-key")]
        signing_key: Option<String>,
    },
}

#[derive(Args, Debug)]
pub struct CtlArgs {
    /// Control socket (defaults to <daemon dir>/control.sock)
    #[arg(long)]
    pub socket: Option<PathBuf>,

    /// Idempotency key for kill and restart
    #[arg(long = "idempotency-key")]
    pub idempotency_key: Option<String>,

    #[command(subcommand)]
    pub command: CtlCommand,
}

#[derive(Subcommand, Debug)]
pub enum CtlCommand {
    /// Stop the supervised process
    Kill {
        /// Reason recorded with the request
        #[arg(long)]
        reason: Option<String>,
    },
    /// Restart the supervised process
    Restart {
        /// Reason recorded with the request
        #[arg(long)]
        reason: Option<String>,
    },
    /// Lifecycle snapshot
    Status,
    /// Recent events, or one incident's chain
    Timeline {
        #[arg(long = "incident-id")]
        incident_id: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Liveness check
    Health,
    /// Lifecycle counters and SLO latencies
    Metrics {
        /// Print the full JSON response instead of Prometheus text
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ReplaysCommand {
    /// Show stored replies and table statistics
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Delete old rows; zero disables a bound
    Purge {
        #[arg(long = "retention-days", default_value_t = 30)]
        retention_days: u32,
        #[arg(long = "max-rows", default_value_t = 10_000)]
        max_rows: usize,
    },
}

fn main() {
    let cli = Cli::parse();
    let log_dir = flowforge_core::daemon_dir().ok();
    let logging_guard = logging::init(log_dir.as_deref());

    let result = match cli.command {
        Commands::Run(args) => run::run(args),
        Commands::Evidence { command } => evidence::run(command),
        Commands::Ctl(args) => ctl::run(args),
        Commands::Replays { command } => replays::run(command),
        Commands::Clean(args) => clean::run(args),
    };

    let code = match result {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "flowforge failed");
            1
        }
    };
    drop(logging_guard);
    std::process::exit(code);
}
