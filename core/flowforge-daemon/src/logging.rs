//! Logging setup for the flowforge binary.
//!
//! Stdout belongs to the supervised child, so console logs go to stderr.
//! A daily-rolling file under the daemon directory keeps a copy.

use std::env;
use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use flowforge_core::config::DEBUG_LOG_ENV;

const LOG_FILE_NAME: &str = "flowforge.log";

/// Installs the global subscriber. Keep the returned guard alive until exit
/// or buffered file lines are lost.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let console = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let (file_layer, guard) = match log_dir.map(prepare_dir) {
        Some(Ok(dir)) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        Some(Err(err)) => {
            eprintln!("flowforge: file logging disabled: {}", err);
            (None, None)
        }
        None => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(filter())
        .with(console)
        .with(file_layer)
        .try_init();
    if let Err(err) = installed {
        eprintln!("flowforge: logging already initialised: {}", err);
    }
    guard
}

fn filter() -> EnvFilter {
    if debug_enabled() {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn debug_enabled() -> bool {
    env::var(DEBUG_LOG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false)
}

fn prepare_dir(dir: &Path) -> Result<&Path, String> {
    fs_err::create_dir_all(dir)
        .map_err(|err| format!("Failed to create log directory: {}", err))?;
    Ok(dir)
}
