//! Control-surface protocol types for the flowforge supervisor.
//!
//! Shared by the controller's socket server and its clients so both sides
//! agree on the envelope. The controller remains the authority on validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;
pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;
pub const MAX_IDEMPOTENT_BODY_BYTES: usize = 32 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    Health,
    Status,
    Timeline,
    Kill,
    Restart,
    Metrics,
}

impl Method {
    /// Logical endpoint used for idempotency bookkeeping.
    pub fn endpoint(self) -> &'static str {
        match self {
            Method::Health => "/healthz",
            Method::Status => "/process/status",
            Method::Timeline => "/timeline",
            Method::Kill => "/process/kill",
            Method::Restart => "/process/restart",
            Method::Metrics => "/metrics",
        }
    }

    pub fn http_method(self) -> &'static str {
        match self {
            Method::Kill | Method::Restart => "POST",
            Method::Health | Method::Status | Method::Timeline | Method::Metrics => "GET",
        }
    }

    pub fn is_mutation(self) -> bool {
        matches!(self, Method::Kill | Method::Restart)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub idempotent_replay: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    /// Set when the request may succeed if retried later.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            retry_after_secs: None,
        }
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }
}

impl Response {
    pub fn ok(id: Option<String>, status: u16, data: Value) -> Self {
        Self {
            ok: true,
            status,
            id,
            data: Some(data),
            error: None,
            idempotent_replay: false,
        }
    }

    pub fn error(id: Option<String>, status: u16, code: &str, message: impl Into<String>) -> Self {
        Self::error_with_info(id, status, ErrorInfo::new(code, message))
    }

    pub fn error_with_info(id: Option<String>, status: u16, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            status,
            id,
            data: None,
            error: Some(error),
            idempotent_replay: false,
        }
    }
}

/// Parameters accepted by [`Method::Timeline`].
#[derive(Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TimelineParams {
    #[serde(default)]
    pub incident_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

pub fn parse_timeline_params(params: Option<Value>) -> Result<TimelineParams, ErrorInfo> {
    match params {
        None | Some(Value::Null) => Ok(TimelineParams::default()),
        Some(value) if value.is_object() => serde_json::from_value(value).map_err(|err| {
            ErrorInfo::new(
                "invalid_params",
                format!("timeline params are invalid: {}", err),
            )
        }),
        Some(_) => Err(ErrorInfo::new("invalid_params", "params must be an object")),
    }
}

/// Checks an idempotency key: non-empty, at most 128 characters, visible ASCII only.
pub fn validate_idempotency_key(key: &str) -> Result<(), ErrorInfo> {
    if key.is_empty() {
        return Err(ErrorInfo::new(
            "invalid_idempotency_key",
            "idempotency key must not be empty",
        ));
    }
    if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
        return Err(ErrorInfo::new(
            "invalid_idempotency_key",
            "idempotency key must be 128 characters or fewer",
        ));
    }
    if !key.bytes().all(|b| (33..=126).contains(&b)) {
        return Err(ErrorInfo::new(
            "invalid_idempotency_key",
            "idempotency key must contain visible ASCII characters only",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_rejects_unknown_fields() {
        let raw = json!({
            "protocol_version": 1,
            "method": "kill",
            "extra": true,
        });
        assert!(serde_json::from_value::<Request>(raw).is_err());
    }

    #[test]
    fn method_maps_to_endpoints() {
        assert_eq!(Method::Restart.endpoint(), "/process/restart");
        assert_eq!(Method::Kill.http_method(), "POST");
        assert!(!Method::Status.is_mutation());
        assert_eq!(Method::Metrics.endpoint(), "/metrics");
        assert!(!Method::Metrics.is_mutation());
    }

    #[test]
    fn replay_flag_is_omitted_when_false() {
        let response = Response::ok(None, 200, json!({"status": "ok"}));
        let encoded = serde_json::to_string(&response).expect("serialize");
        assert!(!encoded.contains("idempotent_replay"));
    }

    #[test]
    fn idempotency_key_validation() {
        assert!(validate_idempotency_key("abc-123").is_ok());
        assert!(validate_idempotency_key("").is_err());
        assert!(validate_idempotency_key("has space").is_err());
        assert!(validate_idempotency_key(&"k".repeat(129)).is_err());
        assert!(validate_idempotency_key(&"k".repeat(128)).is_ok());
    }

    #[test]
    fn timeline_params_default_when_absent() {
        let parsed = parse_timeline_params(None).expect("params");
        assert_eq!(parsed, TimelineParams::default());

        let parsed = parse_timeline_params(Some(json!({"incident_id": "inc-1"})))
            .expect("params");
        assert_eq!(parsed.incident_id.as_deref(), Some("inc-1"));

        assert!(parse_timeline_params(Some(json!([1, 2]))).is_err());
    }
}
