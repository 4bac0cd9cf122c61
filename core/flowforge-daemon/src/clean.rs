//! `flowforge clean`: retention for recorded incidents.

use tracing::info;

use flowforge_core::{db_path, Db, FieldCipher};

use crate::CleanArgs;

pub fn run(args: CleanArgs) -> Result<i32, String> {
    let days = retention_days(args.days, args.force)?;
    let cipher = FieldCipher::from_env().map_err(|err| err.to_string())?;
    let db = Db::open(db_path().map_err(|err| err.to_string())?, cipher)
        .map_err(|err| err.to_string())?;

    let removed = db.prune_incidents(days).map_err(|err| err.to_string())?;
    info!(removed, days, "Pruned incidents");
    println!("removed {} incidents older than {} days", removed, days);
    Ok(0)
}

/// Zero wipes every incident, so it only passes with `force`.
fn retention_days(days: i64, force: bool) -> Result<u32, String> {
    if days < 0 {
        return Err("--days must be zero or greater".to_string());
    }
    if days == 0 && !force {
        return Err("--days 0 deletes every incident; pass --force to confirm".to_string());
    }
    u32::try_from(days).map_err(|_| format!("--days {} is too large", days))
}
