//! `flowforge replays`: housekeeping for stored idempotent replies.

use serde_json::json;
use tracing::info;

use flowforge_core::{db_path, Db, FieldCipher};

use crate::ReplaysCommand;

pub fn run(command: ReplaysCommand) -> Result<i32, String> {
    let cipher = FieldCipher::from_env().map_err(|err| err.to_string())?;
    let db = Db::open(db_path().map_err(|err| err.to_string())?, cipher)
        .map_err(|err| err.to_string())?;

    match command {
        ReplaysCommand::List { limit } => {
            let stats = db.replay_stats().map_err(|err| err.to_string())?;
            let rows = db.list_replays(limit).map_err(|err| err.to_string())?;
            let rendered = serde_json::to_string_pretty(&json!({
                "stats": stats,
                "replays": rows,
            }))
            .map_err(|err| format!("Failed to render replays: {}", err))?;
            println!("{}", rendered);
        }
        ReplaysCommand::Purge {
            retention_days,
            max_rows,
        } => {
            let removed = db
                .purge_replays(retention_days, max_rows)
                .map_err(|err| err.to_string())?;
            info!(removed, retention_days, max_rows, "Purged idempotent replies");
            println!("removed {} rows", removed);
        }
    }
    Ok(0)
}
