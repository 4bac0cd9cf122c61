//! Run-scoped event writer.
//!
//! Stamps every event with the run id and writes it best-effort: a storage
//! failure is logged and swallowed so breadcrumbs never take the controller
//! down. Callers that need a hard guarantee use the [`Db`] directly.

use std::sync::Arc;

use tracing::warn;

use crate::db::{Db, Event, EVENT_AUDIT};

#[derive(Clone)]
pub struct Journal {
    db: Arc<Db>,
    run_id: String,
}

impl Journal {
    pub fn new(db: Arc<Db>, run_id: impl Into<String>) -> Self {
        Self {
            db,
            run_id: run_id.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    pub fn event(&self, event_type: &str, actor: &str, title: &str) -> Event {
        Event::new(&self.run_id, event_type, actor, title)
    }

    /// Returns `false` if the write failed.
    pub fn append(&self, event: Event) -> bool {
        match self.db.insert_event(&event) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    run_id = %self.run_id,
                    event_type = %event.event_type,
                    title = %event.title,
                    error = %err,
                    "Failed to record event"
                );
                false
            }
        }
    }

    pub fn audit(&self, actor: &str, title: &str, summary: &str, reason: &str, pid: Option<i32>) {
        self.append(
            self.event(EVENT_AUDIT, actor, title)
                .summary(summary)
                .reason(reason)
                .pid(pid),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::test_db;

    #[test]
    fn stamps_run_id() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let journal = Journal::new(Arc::new(test_db(temp_dir.path())), "run-xyz");
        journal.audit("control-plane", "IDEMPOTENT_REPLAY", "served", "/process/kill", None);

        let events = journal.db().run_events("run-xyz", 10).expect("events");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_AUDIT);
        assert_eq!(events[0].reason, "/process/kill");
    }
}
