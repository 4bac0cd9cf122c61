//! `flowforge evidence`: export and verify signed bundles.

use std::path::PathBuf;
use tracing::info;

use flowforge_core::evidence::{self, ExportOptions};
use flowforge_core::{db_path, Db, FieldCipher};

use crate::EvidenceCommand;

pub fn run(command: EvidenceCommand) -> Result<i32, String> {
    match command {
        EvidenceCommand::Export {
            out,
            incident_id,
            signing_key,
            limit,
        } => export(out, incident_id, signing_key, limit),
        EvidenceCommand::Verify { dir, signing_key } => {
            let key = evidence::resolve_signing_key(signing_key.as_deref())
                .map_err(|err| err.to_string())?;
            let result = evidence::verify(&dir, &key).map_err(|err| err.to_string())?;
            info!(bundle = %result.bundle_dir.display(), files = result.file_count, "Bundle verified");
            println!(
                "verified {} ({} files)",
                result.bundle_dir.display(),
                result.file_count
            );
            Ok(0)
        }
    }
}

fn export(
    out: Option<PathBuf>,
    incident_id: Option<String>,
    signing_key: Option<String>,
    limit: usize,
) -> Result<i32, String> {
    let key = evidence::resolve_signing_key(signing_key.as_deref()).map_err(|err| err.to_string())?;
    let cipher = FieldCipher::from_env().map_err(|err| err.to_string())?;
    let db = Db::open(db_path().map_err(|err| err.to_string())?, cipher)
        .map_err(|err| err.to_string())?;

    let out_dir = out.unwrap_or_else(|| PathBuf::from(evidence::default_bundle_name()));
    let options = ExportOptions {
        incident_id: incident_id.filter(|id| !id.trim().is_empty()),
        timeline_limit: limit,
        audit_limit: limit,
        decision_limit: limit,
        chain_limit: limit,
        ..ExportOptions::new(out_dir)
    };
    let result = evidence::export(&db, &options, &key).map_err(|err| err.to_string())?;
    info!(
        bundle = %result.bundle_dir.display(),
        bundle_id = %result.manifest.bundle_id,
        files = result.manifest.files.len(),
        key_id = %result.signature.key_id,
        "Evidence bundle exported"
    );
    println!("{}", result.bundle_dir.display());
    Ok(0)
}
