//! Control-plane dispatch.
//!
//! Transport-independent: the socket server hands every decoded request to
//! [`ControlPlane::handle`] and writes back whatever it returns. Mutations
//! go through the lifecycle FSM; keyed mutations are made idempotent here.

use std::time::Instant;

use flowforge_protocol::{
    parse_timeline_params, validate_idempotency_key, ErrorInfo, Method, Request, Response,
    MAX_IDEMPOTENT_BODY_BYTES, PROTOCOL_VERSION,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::idempotency::{self, Admission, CONFLICT_MESSAGE};
use crate::journal::Journal;
use crate::lifecycle::{LifecycleAck, LifecycleError, Phase, WorkerLifecycle};

pub const DEFAULT_TIMELINE_LIMIT: usize = 100;
pub const MAX_TIMELINE_LIMIT: usize = 500;
const ACTOR: &str = "control-plane";

pub struct ControlPlane {
    lifecycle: WorkerLifecycle,
    journal: Journal,
    started_at: Instant,
}

impl ControlPlane {
    pub fn new(lifecycle: WorkerLifecycle, journal: Journal) -> Self {
        Self {
            lifecycle,
            journal,
            started_at: Instant::now(),
        }
    }

    pub fn handle(&self, request: Request) -> Response {
        let id = request.id.clone();
        if request.protocol_version != PROTOCOL_VERSION {
            return Response::error(
                id,
                400,
                "protocol_mismatch",
                format!(
                    "Unsupported protocol_version {} (expected {})",
                    request.protocol_version, PROTOCOL_VERSION
                ),
            );
        }

        let key = request
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        match key {
            Some(key) if request.method.is_mutation() => self.handle_keyed(request, &key),
            _ => self.dispatch(request.method, id, request.params),
        }
    }

    fn handle_keyed(&self, request: Request, key: &str) -> Response {
        let id = request.id.clone();
        if let Err(info) = validate_idempotency_key(key) {
            return Response::error_with_info(id, 400, info);
        }

        let body = match &request.params {
            None | Some(Value::Null) => String::new(),
            Some(params) => match serde_json::to_string(params) {
                Ok(body) => body,
                Err(err) => {
                    return Response::error(id, 400, "invalid_params", err.to_string());
                }
            },
        };
        if body.len() > MAX_IDEMPOTENT_BODY_BYTES {
            return Response::error(
                id,
                400,
                "invalid_params",
                format!(
                    "invalid request body for idempotency: body exceeds {} bytes",
                    MAX_IDEMPOTENT_BODY_BYTES
                ),
            );
        }

        let endpoint = request.method.endpoint();
        let hash = idempotency::request_hash(request.method.http_method(), endpoint, &body);
        let db = self.journal.db();
        let ticket = match idempotency::admit(db, key, endpoint, &hash) {
            Ok(Admission::Fresh(ticket)) => ticket,
            Ok(Admission::Conflict) => {
                self.lifecycle.metrics().record_idempotency_conflict();
                self.journal
                    .audit(ACTOR, "IDEMPOTENT_CONFLICT", CONFLICT_MESSAGE, endpoint, None);
                return Response::error(id, 409, "idempotency_conflict", CONFLICT_MESSAGE);
            }
            Ok(Admission::Replay(record)) => {
                self.lifecycle.metrics().record_idempotent_replay();
                self.journal.audit(
                    ACTOR,
                    "IDEMPOTENT_REPLAY",
                    "served cached control-plane mutation response",
                    endpoint,
                    None,
                );
                return match serde_json::from_str::<Response>(&record.response_body) {
                    Ok(mut stored) => {
                        stored.id = id;
                        stored.idempotent_replay = true;
                        stored
                    }
                    Err(err) => Response::error(
                        id,
                        500,
                        "idempotency_error",
                        format!("stored replay is unreadable: {}", err),
                    ),
                };
            }
            Err(err) => {
                return Response::error(
                    id,
                    500,
                    "idempotency_error",
                    format!("idempotency lookup failed: {}", err),
                );
            }
        };

        let response = self.dispatch(request.method, None, request.params);
        let persisted = serde_json::to_string(&response)
            .map_err(|err| err.to_string())
            .and_then(|body| {
                idempotency::persist(db, &ticket, response.status, &body)
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = persisted {
            warn!(endpoint, error = %err, "Failed to persist idempotent response");
            return Response::error(
                id,
                500,
                "idempotency_error",
                format!("idempotency persistence failed: {}", err),
            );
        }
        Response { id, ..response }
    }

    fn dispatch(&self, method: Method, id: Option<String>, params: Option<Value>) -> Response {
        match method {
            Method::Health => Response::ok(
                id,
                200,
                json!({
                    "status": "ok",
                    "run_id": self.journal.run_id(),
                    "uptime_secs": self.started_at.elapsed().as_secs(),
                    "lifecycle": self.lifecycle.snapshot().phase,
                }),
            ),
            Method::Status => {
                let snapshot = self.lifecycle.snapshot();
                match serde_json::to_value(&snapshot) {
                    Ok(mut value) => {
                        if let Value::Object(map) = &mut value {
                            map.insert("run_id".to_string(), json!(self.journal.run_id()));
                        }
                        Response::ok(id, 200, value)
                    }
                    Err(err) => Response::error(id, 500, "internal_error", err.to_string()),
                }
            }
            Method::Timeline => self.timeline(id, params),
            Method::Kill => {
                let result = self.lifecycle.request_kill();
                self.mutation_reply(id, "MANUAL_KILL", result)
            }
            Method::Restart => {
                let result = self.lifecycle.request_restart();
                self.mutation_reply(id, "MANUAL_RESTART", result)
            }
            Method::Metrics => {
                let metrics = self.lifecycle.metrics();
                let active = self.lifecycle.snapshot().phase == Phase::Running;
                Response::ok(
                    id,
                    200,
                    json!({
                        "counters": metrics.snapshot(),
                        "prometheus": metrics.render_prometheus(active),
                    }),
                )
            }
        }
    }

    fn timeline(&self, id: Option<String>, params: Option<Value>) -> Response {
        let params = match parse_timeline_params(params) {
            Ok(params) => params,
            Err(info) => return Response::error_with_info(id, 400, info),
        };
        let limit = params
            .limit
            .unwrap_or(DEFAULT_TIMELINE_LIMIT)
            .clamp(1, MAX_TIMELINE_LIMIT);
        let db = self.journal.db();
        let incident_id = params
            .incident_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let events = match incident_id {
            Some(incident_id) => db.incident_chain(incident_id, limit),
            None => db.timeline(limit),
        };
        match events {
            Ok(events) => Response::ok(
                id,
                200,
                json!({
                    "incident_id": incident_id,
                    "count": events.len(),
                    "events": events,
                }),
            ),
            Err(err) => Response::error(id, 500, "storage_error", err.to_string()),
        }
    }

    fn mutation_reply(
        &self,
        id: Option<String>,
        audit_title: &str,
        result: std::result::Result<LifecycleAck, LifecycleError>,
    ) -> Response {
        match result {
            Ok(ack) => {
                if ack.accepted_new {
                    info!(status = ack.status, pid = ?ack.pid, "Control-plane mutation accepted");
                    self.journal.audit(
                        ACTOR,
                        audit_title,
                        ack.status,
                        "requested via control socket",
                        ack.pid,
                    );
                }
                Response::ok(
                    id,
                    202,
                    json!({
                        "status": ack.status,
                        "lifecycle": ack.lifecycle,
                        "pid": ack.pid,
                    }),
                )
            }
            Err(err) => {
                let code = match err.status {
                    409 => "conflict",
                    429 => "restart_budget_exceeded",
                    _ => "invalid_state",
                };
                let mut info = ErrorInfo::new(code, err.message.clone());
                if let Some(secs) = err.retry_after_secs {
                    info = info.with_retry_after(secs);
                }
                Response::error_with_info(id, err.status, info)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;
    use crate::db::EVENT_AUDIT;
    use crate::error::Result;
    use crate::lifecycle::{LifecycleConfig, LifecycleHooks, Transition, WorkerLauncher};
    use crate::supervisor::{LaunchSpec, Supervisor};
    use std::io;
    use std::sync::Arc;
    use std::time::Duration;

    struct NoHooks;

    impl LifecycleHooks for NoHooks {
        fn on_transition(&self, _transition: &Transition) {}
    }

    struct ShellLauncher;

    impl WorkerLauncher for ShellLauncher {
        fn launch(&self, spec: &LaunchSpec) -> Result<Supervisor> {
            Supervisor::start(spec, Box::new(io::sink()), Box::new(io::sink()))
        }
    }

    fn sleeper() -> LaunchSpec {
        LaunchSpec {
            argv: vec!["sh".into(), "-c".into(), "sleep 30".into()],
            ..LaunchSpec::default()
        }
    }

    fn plane(dir: &std::path::Path) -> (ControlPlane, WorkerLifecycle) {
        let lifecycle = WorkerLifecycle::new(
            LifecycleConfig {
                stop_grace: Duration::from_millis(500),
                ..LifecycleConfig::default()
            },
            Arc::new(ShellLauncher),
            Arc::new(NoHooks),
        );
        let journal = Journal::new(Arc::new(test_db(dir)), "run-control");
        (ControlPlane::new(lifecycle.clone(), journal), lifecycle)
    }

    fn request(method: Method, key: Option<&str>, params: Option<Value>) -> Request {
        Request {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: Some("req".to_string()),
            idempotency_key: key.map(str::to_string),
            params,
        }
    }

    fn wait_idle(lifecycle: &WorkerLifecycle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !lifecycle.is_idle() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn rejects_protocol_mismatch() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (plane, _) = plane(temp_dir.path());
        let mut req = request(Method::Health, None, None);
        req.protocol_version = 99;
        let response = plane.handle(req);
        assert_eq!(response.status, 400);
        assert_eq!(response.error.expect("error").code, "protocol_mismatch");
    }

    #[test]
    fn kill_without_process_is_bad_request() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (plane, _) = plane(temp_dir.path());
        let response = plane.handle(request(Method::Kill, None, None));
        assert_eq!(response.status, 400);
        assert!(!response.ok);
    }

    #[test]
    fn idempotent_restart_replays_and_conflicts() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (plane, lifecycle) = plane(temp_dir.path());
        let supervisor =
            Supervisor::start(&sleeper(), Box::new(io::sink()), Box::new(io::sink()))
                .expect("start");
        lifecycle.register_external(sleeper(), Arc::new(supervisor));

        let killed = plane.handle(request(Method::Kill, None, None));
        assert_eq!(killed.status, 202);
        wait_idle(&lifecycle);

        let first = plane.handle(request(Method::Restart, Some("abc"), None));
        assert_eq!(first.status, 202);
        assert_eq!(first.data.as_ref().expect("data")["status"], "restart_requested");
        assert!(!first.idempotent_replay);

        let second = plane.handle(request(Method::Restart, Some("abc"), None));
        assert!(second.idempotent_replay);
        assert_eq!(second.status, first.status);
        assert_eq!(
            serde_json::to_string(&second.data).expect("encode"),
            serde_json::to_string(&first.data).expect("encode")
        );
        let third = plane.handle(request(Method::Restart, Some("abc"), None));
        assert_eq!(third.data, first.data);

        let conflict = plane.handle(request(
            Method::Restart,
            Some("abc"),
            Some(json!({"reason": "different"})),
        ));
        assert_eq!(conflict.status, 409);
        assert_eq!(conflict.error.expect("error").message, CONFLICT_MESSAGE);

        let audits = plane
            .journal
            .db()
            .events_of_type(EVENT_AUDIT, 50)
            .expect("audits");
        let titles: Vec<&str> = audits.iter().map(|e| e.title.as_str()).collect();
        assert!(titles.contains(&"IDEMPOTENT_REPLAY"));
        assert!(titles.contains(&"IDEMPOTENT_CONFLICT"));

        let metrics = plane.handle(request(Method::Metrics, None, None));
        let data = metrics.data.expect("metrics data");
        assert_eq!(data["counters"]["idempotent_replays"], 2);
        assert_eq!(data["counters"]["idempotency_conflicts"], 1);
        assert_eq!(data["counters"]["process_kills"], 1);
        assert_eq!(data["counters"]["process_restarts"], 1);
        let text = data["prometheus"].as_str().expect("prometheus text");
        assert!(text.contains("flowforge_controlplane_idempotent_replay_total 2"));

        if let Some(supervisor) = lifecycle.supervisor() {
            supervisor.stop(Duration::from_millis(200)).expect("cleanup");
        }
    }

    #[test]
    fn invalid_key_is_rejected_before_dispatch() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (plane, _) = plane(temp_dir.path());
        let response = plane.handle(request(Method::Kill, Some("bad key"), None));
        assert_eq!(response.status, 400);
        assert_eq!(response.error.expect("error").code, "invalid_idempotency_key");
    }

    #[test]
    fn status_and_timeline() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (plane, _) = plane(temp_dir.path());
        let status = plane.handle(request(Method::Status, None, None));
        let data = status.data.expect("data");
        assert_eq!(data["phase"], "STOPPED");
        assert_eq!(data["run_id"], "run-control");

        plane.journal.audit(ACTOR, "HELLO", "", "", None);
        let timeline = plane.handle(request(Method::Timeline, None, Some(json!({"limit": 5}))));
        assert_eq!(timeline.data.expect("data")["count"], 1);

        let bad = plane.handle(request(Method::Timeline, None, Some(json!({"nope": 1}))));
        assert_eq!(bad.status, 400);
    }
}
