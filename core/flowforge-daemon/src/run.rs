//! `flowforge run`: supervise one command until it finishes.

use std::sync::Arc;
use tracing::{info, warn};

use flowforge_core::{
    control_socket_path, db_path, load_config, Controller, ControllerOptions, Db, EncoderCache,
    FieldCipher, RunOverrides, TokenCounter,
};

use crate::{server, signals, RunArgs};

pub fn run(args: RunArgs) -> Result<i32, String> {
    let config = load_config(args.config.clone()).map_err(|err| err.to_string())?;
    let overrides = RunOverrides {
        profile: args.profile,
        cwd: args.cwd,
        max_cpu_pct: args.max_cpu,
        poll_interval_ms: args.poll_interval,
        log_window: args.log_window,
        model_id: args.model,
        rollout_mode: args.rollout,
        canary_percent: args.canary_percent,
        no_kill: args.no_kill,
        deep_watch: args.deep,
        inject_feedback: args.inject_feedback,
        linger: args.linger,
    };
    let spec = config
        .run_spec(args.command, overrides)
        .map_err(|err| err.to_string())?;

    let cipher = FieldCipher::from_env().map_err(|err| err.to_string())?;
    let db_path = db_path().map_err(|err| err.to_string())?;
    let db = Db::open(db_path, cipher).map_err(|err| err.to_string())?;

    let encoders = EncoderCache::new();
    let counter = TokenCounter::new(&spec.model_id, &encoders);
    let options = ControllerOptions::from_config(&config, spec);
    let controller = Controller::new(options, Arc::new(db), counter);

    let _signals = signals::forward_to(controller.shutdown_handle());

    let _server = if args.no_control {
        None
    } else {
        start_control_server(&controller)
    };

    let outcome = controller.run().map_err(|err| err.to_string())?;
    info!(
        run_id = %outcome.run_id,
        exit_code = outcome.exit_code,
        incidents = outcome.incident_ids.len(),
        total_tokens = outcome.total_tokens,
        cost_estimate = outcome.cost_estimate,
        max_cpu = outcome.max_cpu,
        "Supervision complete"
    );
    Ok(outcome.exit_code)
}

fn start_control_server(controller: &Controller) -> Option<server::ServerHandle> {
    let socket_path = match control_socket_path() {
        Ok(path) => path,
        Err(err) => {
            warn!(error = %err, "Failed to resolve control socket path; control disabled");
            return None;
        }
    };
    match server::start(socket_path, Arc::new(controller.control_plane())) {
        Ok(handle) => Some(handle),
        Err(err) => {
            warn!(error = %err, "Control socket unavailable; continuing without it");
            None
        }
    }
}
