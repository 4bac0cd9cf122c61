//! SQLite persistence for flowforge.
//!
//! The controller is the single writer. Three tables back the store: an
//! append-only `events` log (updates and deletes are rejected by triggers),
//! `incidents` with the sensitive columns encrypted, and
//! `control_plane_replays` holding first-write-wins idempotent replies.

use chrono::{Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::crypto::FieldCipher;
use crate::error::{FlowforgeError, Result};

pub const EVENT_DECISION: &str = "decision_trace";
pub const EVENT_AUDIT: &str = "audit";
pub const EVENT_INCIDENT: &str = "incident";
pub const EVENT_LIFECYCLE: &str = "lifecycle";
pub const EVENT_RUN: &str = "run";

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn new_id(prefix: &str) -> String {
    format!("{}-{}", prefix, ulid::Ulid::new().to_string().to_lowercase())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub ts: String,
    pub run_id: String,
    pub incident_id: Option<String>,
    pub event_type: String,
    pub actor: String,
    pub title: String,
    pub summary: String,
    pub reason: String,
    pub pid: Option<i32>,
    pub cpu_score: f64,
    pub entropy_score: f64,
    pub confidence_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub created_at: String,
}

impl Event {
    pub fn new(run_id: &str, event_type: &str, actor: &str, title: &str) -> Self {
        let now = now_rfc3339();
        Self {
            event_id: new_id("evt"),
            ts: now.clone(),
            run_id: run_id.to_string(),
            incident_id: None,
            event_type: event_type.to_string(),
            actor: actor.to_string(),
            title: title.to_string(),
            summary: String::new(),
            reason: String::new(),
            pid: None,
            cpu_score: 0.0,
            entropy_score: 0.0,
            confidence_score: 0.0,
            payload: None,
            created_at: now,
        }
    }

    pub fn incident(mut self, incident_id: &str) -> Self {
        self.incident_id = Some(incident_id.to_string());
        self
    }

    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn pid(mut self, pid: Option<i32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn scores(mut self, cpu: f64, entropy: f64, confidence: f64) -> Self {
        self.cpu_score = cpu;
        self.entropy_score = entropy;
        self.confidence_score = confidence;
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: String,
    pub ts: String,
    pub run_id: String,
    pub command: String,
    pub model: String,
    pub exit_reason: String,
    pub max_cpu: f64,
    pub pattern: String,
    pub tokens: u64,
    pub cost_estimate: f64,
    pub agent_id: String,
    pub reason: String,
    pub action: String,
    pub intended_action: String,
    pub cpu_score: f64,
    pub entropy_score: f64,
    pub confidence_score: f64,
    pub recovery_status: String,
    pub restart_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayRecord {
    pub idempotency_key: String,
    pub endpoint: String,
    pub request_hash: String,
    pub response_status: u16,
    pub response_body: String,
    pub replay_count: u64,
    pub created_at: String,
    pub last_seen_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub row_count: u64,
    pub oldest_created_at: Option<String>,
    pub newest_created_at: Option<String>,
}

pub struct Db {
    path: PathBuf,
    cipher: FieldCipher,
}

const EVENT_COLUMNS: &str = "id, ts, run_id, incident_id, event_type, actor, title, summary, reason, \
     pid, cpu_score, entropy_score, confidence_score, payload, created_at";

const INCIDENT_COLUMNS: &str = "id, ts, run_id, command, model, exit_reason, max_cpu, pattern, \
     tokens, cost, agent_id, reason, action, intended_action, cpu_score, entropy_score, \
     confidence_score, recovery_status, restart_count";

impl Db {
    pub fn open(path: PathBuf, cipher: FieldCipher) -> Result<Self> {
        let db = Self { path, cipher };
        db.init_schema()?;
        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn insert_event(&self, event: &Event) -> Result<()> {
        let payload = match &event.payload {
            Some(value) => Some(serde_json::to_string(value)?),
            None => None,
        };
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO events (id, ts, run_id, incident_id, event_type, actor, title, summary, \
                    reason, pid, cpu_score, entropy_score, confidence_score, payload, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    event.event_id,
                    event.ts,
                    event.run_id,
                    event.incident_id,
                    event.event_type,
                    event.actor,
                    event.title,
                    event.summary,
                    event.reason,
                    event.pid,
                    event.cpu_score,
                    event.entropy_score,
                    event.confidence_score,
                    payload,
                    event.created_at,
                ],
            )
            .map_err(|err| FlowforgeError::Storage(format!("Failed to insert event: {}", err)))?;
            Ok(())
        })
    }

    /// Most recent first.
    pub fn timeline(&self, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY seq DESC LIMIT ?1"),
            params![clamp_limit(limit)],
        )
    }

    /// Every event correlated with `incident_id`, oldest first.
    pub fn incident_chain(&self, incident_id: &str, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE incident_id = ?1 \
                 ORDER BY seq ASC LIMIT ?2"
            ),
            params![incident_id, clamp_limit(limit)],
        )
    }

    /// Most recent first.
    pub fn events_of_type(&self, event_type: &str, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE event_type = ?1 \
                 ORDER BY seq DESC LIMIT ?2"
            ),
            params![event_type, clamp_limit(limit)],
        )
    }

    pub fn run_events(&self, run_id: &str, limit: usize) -> Result<Vec<Event>> {
        self.query_events(
            &format!(
                "SELECT {EVENT_COLUMNS} FROM events WHERE run_id = ?1 \
                 ORDER BY seq ASC LIMIT ?2"
            ),
            params![run_id, clamp_limit(limit)],
        )
    }

    fn query_events(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Event>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(sql)
                .map_err(|err| FlowforgeError::Storage(format!("Failed to prepare events query: {}", err)))?;
            let rows = stmt
                .query_map(params, event_from_row)
                .map_err(|err| FlowforgeError::Storage(format!("Failed to read event rows: {}", err)))?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row.map_err(|err| {
                    FlowforgeError::Storage(format!("Failed to decode event row: {}", err))
                })?);
            }
            Ok(events)
        })
    }

    pub fn insert_incident(&self, incident: &Incident) -> Result<()> {
        let command = self.cipher.encrypt(&incident.command)?;
        let pattern = self.cipher.encrypt(&incident.pattern)?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO incidents (id, ts, run_id, command, model, exit_reason, max_cpu, pattern, \
                    tokens, cost, agent_id, reason, action, intended_action, cpu_score, entropy_score, \
                    confidence_score, recovery_status, restart_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    incident.incident_id,
                    incident.ts,
                    incident.run_id,
                    command,
                    incident.model,
                    incident.exit_reason,
                    incident.max_cpu,
                    pattern,
                    incident.tokens as i64,
                    incident.cost_estimate,
                    incident.agent_id,
                    incident.reason,
                    incident.action,
                    incident.intended_action,
                    incident.cpu_score,
                    incident.entropy_score,
                    incident.confidence_score,
                    incident.recovery_status,
                    incident.restart_count,
                ],
            )
            .map_err(|err| FlowforgeError::Storage(format!("Failed to insert incident: {}", err)))?;
            Ok(())
        })
    }

    /// All incidents, newest first, with sensitive columns decrypted.
    pub fn list_incidents(&self) -> Result<Vec<Incident>> {
        let rows = self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY ts DESC, id DESC"
                ))
                .map_err(|err| FlowforgeError::Storage(format!("Failed to prepare incidents query: {}", err)))?;
            let rows = stmt
                .query_map([], incident_from_row)
                .map_err(|err| FlowforgeError::Storage(format!("Failed to read incident rows: {}", err)))?;
            let mut incidents = Vec::new();
            for row in rows {
                incidents.push(row.map_err(|err| {
                    FlowforgeError::Storage(format!("Failed to decode incident row: {}", err))
                })?);
            }
            Ok(incidents)
        })?;

        rows.into_iter()
            .map(|incident| self.decrypt_incident(incident))
            .collect()
    }

    pub fn get_incident(&self, incident_id: &str) -> Result<Option<Incident>> {
        let row = self.with_connection(|conn| {
            conn.query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
                params![incident_id],
                incident_from_row,
            )
            .optional()
            .map_err(|err| FlowforgeError::Storage(format!("Failed to query incident: {}", err)))
        })?;
        row.map(|incident| self.decrypt_incident(incident)).transpose()
    }

    /// Deletes incidents recorded more than `days` days ago and compacts the
    /// file. Zero removes every incident. Events are append-only and stay.
    pub fn prune_incidents(&self, days: u32) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(i64::from(days)))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        self.with_connection(|conn| {
            let removed = conn
                .execute("DELETE FROM incidents WHERE ts < ?1", params![cutoff])
                .map_err(|err| FlowforgeError::Storage(format!("Failed to prune incidents: {}", err)))?;
            conn.execute_batch("VACUUM")
                .map_err(|err| FlowforgeError::Storage(format!("Failed to vacuum database: {}", err)))?;
            Ok(removed)
        })
    }

    fn decrypt_incident(&self, mut incident: Incident) -> Result<Incident> {
        incident.command = self.cipher.decrypt(&incident.command)?;
        incident.pattern = self.cipher.decrypt(&incident.pattern)?;
        Ok(incident)
    }

    pub fn get_replay(&self, key: &str, endpoint: &str) -> Result<Option<ReplayRecord>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT idempotency_key, endpoint, request_hash, response_status, response_body, \
                    replay_count, created_at, last_seen_at \
                 FROM control_plane_replays WHERE idempotency_key = ?1 AND endpoint = ?2",
                params![key, endpoint],
                replay_from_row,
            )
            .optional()
            .map_err(|err| FlowforgeError::Storage(format!("Failed to query replay: {}", err)))
        })
    }

    /// First write wins. Returns `false` when a row already existed.
    pub fn insert_replay(
        &self,
        key: &str,
        endpoint: &str,
        request_hash: &str,
        status: u16,
        body: &str,
    ) -> Result<bool> {
        let body = if body.trim().is_empty() { "{}" } else { body };
        let now = now_rfc3339();
        self.with_connection(|conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO control_plane_replays \
                        (idempotency_key, endpoint, request_hash, response_status, response_body, \
                         replay_count, created_at, last_seen_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6) \
                     ON CONFLICT(idempotency_key, endpoint) DO NOTHING",
                    params![key, endpoint, request_hash, status, body, now],
                )
                .map_err(|err| FlowforgeError::Storage(format!("Failed to insert replay: {}", err)))?;
            Ok(inserted > 0)
        })
    }

    pub fn touch_replay(&self, key: &str, endpoint: &str) -> Result<()> {
        let now = now_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE control_plane_replays \
                 SET replay_count = replay_count + 1, last_seen_at = ?3 \
                 WHERE idempotency_key = ?1 AND endpoint = ?2",
                params![key, endpoint, now],
            )
            .map_err(|err| FlowforgeError::Storage(format!("Failed to touch replay: {}", err)))?;
            Ok(())
        })
    }

    pub fn list_replays(&self, limit: usize) -> Result<Vec<ReplayRecord>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT idempotency_key, endpoint, request_hash, response_status, response_body, \
                        replay_count, created_at, last_seen_at \
                     FROM control_plane_replays ORDER BY last_seen_at DESC, id DESC LIMIT ?1",
                )
                .map_err(|err| FlowforgeError::Storage(format!("Failed to prepare replay query: {}", err)))?;
            let rows = stmt
                .query_map(params![clamp_limit(limit)], replay_from_row)
                .map_err(|err| FlowforgeError::Storage(format!("Failed to read replay rows: {}", err)))?;
            let mut records = Vec::new();
            for row in rows {
                records.push(row.map_err(|err| {
                    FlowforgeError::Storage(format!("Failed to decode replay row: {}", err))
                })?);
            }
            Ok(records)
        })
    }

    pub fn replay_stats(&self) -> Result<ReplayStats> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT COUNT(*), MIN(created_at), MAX(created_at) FROM control_plane_replays",
                [],
                |row| {
                    Ok(ReplayStats {
                        row_count: row.get::<_, i64>(0)? as u64,
                        oldest_created_at: row.get(1)?,
                        newest_created_at: row.get(2)?,
                    })
                },
            )
            .map_err(|err| FlowforgeError::Storage(format!("Failed to read replay stats: {}", err)))
        })
    }

    /// Deletes replay rows not seen for `retention_days`, then trims to the
    /// `max_rows` most recently seen. Zero disables either bound.
    pub fn purge_replays(&self, retention_days: u32, max_rows: usize) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::days(i64::from(retention_days)))
            .to_rfc3339_opts(SecondsFormat::Millis, true);
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| FlowforgeError::Storage(format!("Failed to begin purge: {}", err)))?;
            let mut removed = 0usize;
            if retention_days > 0 {
                removed += tx
                    .execute(
                        "DELETE FROM control_plane_replays WHERE last_seen_at < ?1",
                        params![cutoff],
                    )
                    .map_err(|err| FlowforgeError::Storage(format!("Failed to purge replays: {}", err)))?;
            }
            if max_rows > 0 {
                removed += tx
                    .execute(
                        "DELETE FROM control_plane_replays WHERE id NOT IN ( \
                            SELECT id FROM control_plane_replays \
                            ORDER BY last_seen_at DESC, id DESC LIMIT ?1)",
                        params![max_rows as i64],
                    )
                    .map_err(|err| FlowforgeError::Storage(format!("Failed to trim replays: {}", err)))?;
            }
            tx.commit()
                .map_err(|err| FlowforgeError::Storage(format!("Failed to commit purge: {}", err)))?;
            Ok(removed)
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS events (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    id TEXT NOT NULL UNIQUE,
                    ts TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    incident_id TEXT,
                    event_type TEXT NOT NULL,
                    actor TEXT NOT NULL,
                    title TEXT NOT NULL,
                    summary TEXT NOT NULL DEFAULT '',
                    reason TEXT NOT NULL DEFAULT '',
                    pid INTEGER,
                    cpu_score REAL NOT NULL DEFAULT 0,
                    entropy_score REAL NOT NULL DEFAULT 0,
                    confidence_score REAL NOT NULL DEFAULT 0,
                    payload TEXT,
                    created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_events_incident ON events(incident_id, created_at);
                 CREATE INDEX IF NOT EXISTS idx_events_run ON events(run_id, created_at);
                 CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type, created_at);
                 CREATE TRIGGER IF NOT EXISTS events_no_update BEFORE UPDATE ON events
                 BEGIN
                    SELECT RAISE(ABORT, 'events table is append-only');
                 END;
                 CREATE TRIGGER IF NOT EXISTS events_no_delete BEFORE DELETE ON events
                 BEGIN
                    SELECT RAISE(ABORT, 'events table is append-only');
                 END;
                 CREATE TABLE IF NOT EXISTS incidents (
                    id TEXT PRIMARY KEY,
                    ts TEXT NOT NULL,
                    run_id TEXT NOT NULL,
                    command TEXT NOT NULL,
                    model TEXT NOT NULL,
                    exit_reason TEXT NOT NULL,
                    max_cpu REAL NOT NULL DEFAULT 0,
                    pattern TEXT NOT NULL,
                    tokens INTEGER NOT NULL DEFAULT 0,
                    cost REAL NOT NULL DEFAULT 0,
                    agent_id TEXT NOT NULL DEFAULT '',
                    reason TEXT NOT NULL DEFAULT '',
                    action TEXT NOT NULL DEFAULT '',
                    intended_action TEXT NOT NULL DEFAULT '',
                    cpu_score REAL NOT NULL DEFAULT 0,
                    entropy_score REAL NOT NULL DEFAULT 0,
                    confidence_score REAL NOT NULL DEFAULT 0,
                    recovery_status TEXT NOT NULL DEFAULT '',
                    restart_count INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS idx_incidents_run ON incidents(run_id, ts);
                 CREATE TABLE IF NOT EXISTS control_plane_replays (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    idempotency_key TEXT NOT NULL,
                    endpoint TEXT NOT NULL,
                    request_hash TEXT NOT NULL,
                    response_status INTEGER NOT NULL,
                    response_body TEXT NOT NULL,
                    replay_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    last_seen_at TEXT NOT NULL,
                    UNIQUE(idempotency_key, endpoint)
                 );
                 CREATE INDEX IF NOT EXISTS idx_replays_last_seen ON control_plane_replays(last_seen_at);
                 COMMIT;",
            )
            .map_err(|err| FlowforgeError::Storage(format!("Failed to initialize schema: {}", err)))?;
            Ok(())
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut conn = self.connect()?;
        op(&mut conn)
    }

    fn connect(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent)?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| FlowforgeError::Storage(format!("Failed to open sqlite db: {}", err)))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| FlowforgeError::Storage(format!("Failed to enable WAL: {}", err)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| FlowforgeError::Storage(format!("Failed to set synchronous: {}", err)))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| FlowforgeError::Storage(format!("Failed to set busy_timeout: {}", err)))?;

        Ok(conn)
    }
}

fn clamp_limit(limit: usize) -> i64 {
    limit.clamp(1, 10_000) as i64
}

fn event_from_row(row: &Row<'_>) -> rusqlite::Result<Event> {
    let payload: Option<String> = row.get(13)?;
    Ok(Event {
        event_id: row.get(0)?,
        ts: row.get(1)?,
        run_id: row.get(2)?,
        incident_id: row.get(3)?,
        event_type: row.get(4)?,
        actor: row.get(5)?,
        title: row.get(6)?,
        summary: row.get(7)?,
        reason: row.get(8)?,
        pid: row.get(9)?,
        cpu_score: row.get(10)?,
        entropy_score: row.get(11)?,
        confidence_score: row.get(12)?,
        payload: payload.and_then(|raw| serde_json::from_str(&raw).ok()),
        created_at: row.get(14)?,
    })
}

fn incident_from_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        incident_id: row.get(0)?,
        ts: row.get(1)?,
        run_id: row.get(2)?,
        command: row.get(3)?,
        model: row.get(4)?,
        exit_reason: row.get(5)?,
        max_cpu: row.get(6)?,
        pattern: row.get(7)?,
        tokens: row.get::<_, i64>(8)?.max(0) as u64,
        cost_estimate: row.get(9)?,
        agent_id: row.get(10)?,
        reason: row.get(11)?,
        action: row.get(12)?,
        intended_action: row.get(13)?,
        cpu_score: row.get(14)?,
        entropy_score: row.get(15)?,
        confidence_score: row.get(16)?,
        recovery_status: row.get(17)?,
        restart_count: row.get(18)?,
    })
}

fn replay_from_row(row: &Row<'_>) -> rusqlite::Result<ReplayRecord> {
    Ok(ReplayRecord {
        idempotency_key: row.get(0)?,
        endpoint: row.get(1)?,
        request_hash: row.get(2)?,
        response_status: row.get(3)?,
        response_body: row.get(4)?,
        replay_count: row.get::<_, i64>(5)?.max(0) as u64,
        created_at: row.get(6)?,
        last_seen_at: row.get(7)?,
    })
}
