//! `flowforge ctl`: one request against a running supervisor.

use serde_json::{json, Value};
use tracing::debug;

use flowforge_protocol::{Method, Response};

use crate::{client, CtlArgs, CtlCommand};

pub fn run(args: CtlArgs) -> Result<i32, String> {
    let socket = match args.socket {
        Some(path) => path,
        None => flowforge_core::control_socket_path().map_err(|err| err.to_string())?,
    };
    let raw_text = matches!(args.command, CtlCommand::Metrics { json: false });
    let (method, params) = method_and_params(args.command);
    let key = if method.is_mutation() {
        args.idempotency_key
    } else {
        None
    };

    let request = client::build_request(method, params, key);
    debug!(method = ?request.method, id = ?request.id, "Sending control request");
    let response = client::send_request(&socket, &request)?;
    match prometheus_text(&response) {
        Some(text) if raw_text => print!("{}", text),
        _ => print_response(&response)?,
    }
    Ok(if response.ok { 0 } else { 1 })
}

fn method_and_params(command: CtlCommand) -> (Method, Option<Value>) {
    let reason_params = |reason: Option<String>| reason.map(|reason| json!({ "reason": reason }));
    match command {
        CtlCommand::Kill { reason } => (Method::Kill, reason_params(reason)),
        CtlCommand::Restart { reason } => (Method::Restart, reason_params(reason)),
        CtlCommand::Status => (Method::Status, None),
        CtlCommand::Health => (Method::Health, None),
        CtlCommand::Metrics { .. } => (Method::Metrics, None),
        CtlCommand::Timeline { incident_id, limit } => {
            let mut params = serde_json::Map::new();
            if let Some(incident_id) = incident_id {
                params.insert("incident_id".to_string(), json!(incident_id));
            }
            if let Some(limit) = limit {
                params.insert("limit".to_string(), json!(limit));
            }
            let params = (!params.is_empty()).then_some(Value::Object(params));
            (Method::Timeline, params)
        }
    }
}

fn prometheus_text(response: &Response) -> Option<&str> {
    response.data.as_ref()?.get("prometheus")?.as_str()
}

fn print_response(response: &Response) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(response)
        .map_err(|err| format!("Failed to render response: {}", err))?;
    println!("{}", rendered);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeline_params_only_carry_given_fields() {
        let (method, params) = method_and_params(CtlCommand::Timeline {
            incident_id: Some("inc-1".to_string()),
            limit: None,
        });
        assert_eq!(method, Method::Timeline);
        assert_eq!(params, Some(json!({"incident_id": "inc-1"})));

        let (_, params) = method_and_params(CtlCommand::Timeline {
            incident_id: None,
            limit: None,
        });
        assert_eq!(params, None);
    }

    #[test]
    fn mutation_reason_becomes_params() {
        let (method, params) = method_and_params(CtlCommand::Restart {
            reason: Some("stuck".to_string()),
        });
        assert_eq!(method, Method::Restart);
        assert_eq!(params, Some(json!({"reason": "stuck"})));
        assert_eq!(method_and_params(CtlCommand::Kill { reason: None }).1, None);
    }

    #[test]
    fn metrics_text_is_taken_from_the_reply() {
        assert_eq!(
            method_and_params(CtlCommand::Metrics { json: false }),
            (Method::Metrics, None)
        );
        let reply = Response::ok(
            None,
            200,
            json!({"counters": {}, "prometheus": "flowforge_active_process 1\n"}),
        );
        assert_eq!(prometheus_text(&reply), Some("flowforge_active_process 1\n"));
        let failed = Response::error(None, 500, "internal_error", "boom");
        assert_eq!(prometheus_text(&failed), None);
    }
}
