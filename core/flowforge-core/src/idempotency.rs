//! Idempotent mutation bookkeeping.
//!
//! A mutation carrying an idempotency key is fingerprinted as
//! `sha256(method "\n" endpoint "\n" canonical_body)`. The first reply with a
//! status below 500 is persisted; identical repeats are served that reply
//! verbatim, and a different fingerprint under the same key is a conflict.

use sha2::{Digest, Sha256};

use crate::db::{Db, ReplayRecord};
use crate::error::Result;

pub const CONFLICT_MESSAGE: &str = "idempotency key reused with different request payload";

/// Re-serialised JSON when the body parses, otherwise the trimmed text.
/// An empty body canonicalises to `{}`.
pub fn canonical_body(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "{}".to_string();
    }
    match serde_json::from_str::<serde_json::Value>(trimmed) {
        Ok(value) => serde_json::to_string(&value).unwrap_or_else(|_| trimmed.to_string()),
        Err(_) => trimmed.to_string(),
    }
}

pub fn request_hash(method: &str, endpoint: &str, body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_body(body).as_bytes());
    hex::encode(hasher.finalize())
}

/// A fresh keyed mutation whose reply should be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub key: String,
    pub endpoint: String,
    pub request_hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Fresh(Ticket),
    Replay(ReplayRecord),
    Conflict,
}

/// Looks up `key` for `endpoint`. A replay hit is touched before returning.
pub fn admit(db: &Db, key: &str, endpoint: &str, request_hash: &str) -> Result<Admission> {
    match db.get_replay(key, endpoint)? {
        None => Ok(Admission::Fresh(Ticket {
            key: key.to_string(),
            endpoint: endpoint.to_string(),
            request_hash: request_hash.to_string(),
        })),
        Some(record) if record.request_hash.trim() != request_hash => Ok(Admission::Conflict),
        Some(record) => {
            db.touch_replay(key, endpoint)?;
            Ok(Admission::Replay(record))
        }
    }
}

/// Persists the first reply. Server errors are never stored so a retry can
/// succeed.
pub fn persist(db: &Db, ticket: &Ticket, status: u16, body: &str) -> Result<()> {
    if status >= 500 {
        return Ok(());
    }
    db.insert_replay(
        &ticket.key,
        &ticket.endpoint,
        &ticket.request_hash,
        status,
        body,
    )?;
    Ok(())
}
