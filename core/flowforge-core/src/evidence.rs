//! Signed evidence bundles.
//!
//! An export snapshots the store into a directory of pretty-printed JSON
//! files, lists each file's SHA-256 and size in `manifest.json`, and signs
//! the manifest bytes with HMAC-SHA256 into `signature.json`. Verification
//! checks the manifest digest, then the signature, then every listed file.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{Local, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::info;

use crate::crypto::MASTER_KEY_ENV;
use crate::db::{Db, EVENT_AUDIT, EVENT_DECISION};
use crate::error::{EvidenceError, FlowforgeError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const MANIFEST_FILENAME: &str = "manifest.json";
pub const SIGNATURE_FILENAME: &str = "signature.json";
pub const MANIFEST_VERSION: &str = "v1";
pub const SIGNATURE_ALGORITHM: &str = "HMAC-SHA256";
pub const SIGNING_KEY_ENV: &str = "FLOWFORGE_EVIDENCE_SIGNING_KEY";
pub const MIN_SIGNING_KEY_BYTES: usize = 16;
pub const DEFAULT_EXPORT_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct ExportOptions {
    pub out_dir: PathBuf,
    pub incident_id: Option<String>,
    pub timeline_limit: usize,
    pub audit_limit: usize,
    pub decision_limit: usize,
    pub chain_limit: usize,
}

impl ExportOptions {
    pub fn new(out_dir: PathBuf) -> Self {
        Self {
            out_dir,
            incident_id: None,
            timeline_limit: DEFAULT_EXPORT_LIMIT,
            audit_limit: DEFAULT_EXPORT_LIMIT,
            decision_limit: DEFAULT_EXPORT_LIMIT,
            chain_limit: DEFAULT_EXPORT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleFile {
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub bundle_id: String,
    pub generated_at: String,
    pub source_db_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_incident_id: Option<String>,
    pub files: Vec<BundleFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub algorithm: String,
    pub key_id: String,
    pub manifest_sha256: String,
    pub signature: String,
}

#[derive(Debug, Serialize)]
struct Summary {
    generated_at: String,
    incident_count: usize,
    timeline_event_count: usize,
    audit_event_count: usize,
    decision_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    incident_chain_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    selected_incident_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExportResult {
    pub bundle_dir: PathBuf,
    pub manifest: Manifest,
    pub signature: Signature,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    pub bundle_dir: PathBuf,
    pub file_count: usize,
}

/// Default bundle directory name, e.g. `evidence-20260101-120000`.
pub fn default_bundle_name() -> String {
    format!("evidence-{}", Local::now().format("%Y%m%d-%H%M%S"))
}

pub fn export(db: &Db, options: &ExportOptions, key: &[u8]) -> Result<ExportResult> {
    if key.is_empty() {
        return Err(EvidenceError::MissingSigningKey.into());
    }
    let out_dir = &options.out_dir;
    fs_err::create_dir_all(out_dir)?;

    let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let incident_id = options
        .incident_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let incidents = db.list_incidents()?;
    let timeline = db.timeline(options.timeline_limit)?;
    let audits = db.events_of_type(EVENT_AUDIT, options.audit_limit)?;
    let decisions = db.events_of_type(EVENT_DECISION, options.decision_limit)?;

    let mut files = vec![
        write_json(out_dir, "incidents.json", &incidents)?,
        write_json(out_dir, "timeline.json", &timeline)?,
        write_json(out_dir, "audit_events.json", &audits)?,
        write_json(out_dir, "decision_traces.json", &decisions)?,
    ];

    let mut chain_count = None;
    if let Some(id) = &incident_id {
        let chain = db.incident_chain(id, options.chain_limit)?;
        chain_count = Some(chain.len());
        files.push(write_json(out_dir, "incident_chain.json", &chain)?);
    }

    let summary = Summary {
        generated_at: generated_at.clone(),
        incident_count: incidents.len(),
        timeline_event_count: timeline.len(),
        audit_event_count: audits.len(),
        decision_count: decisions.len(),
        incident_chain_count: chain_count,
        selected_incident_id: incident_id.clone(),
    };
    files.push(write_json(out_dir, "summary.json", &summary)?);
    files.sort_by(|a, b| a.path.cmp(&b.path));

    let manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        bundle_id: default_bundle_name(),
        generated_at,
        source_db_path: db.path().display().to_string(),
        selected_incident_id: incident_id,
        files,
    };
    let manifest_bytes = pretty_bytes(&manifest)?;
    fs_err::write(out_dir.join(MANIFEST_FILENAME), &manifest_bytes)?;

    let signature = Signature {
        algorithm: SIGNATURE_ALGORITHM.to_string(),
        key_id: key_id(key),
        manifest_sha256: sha256_hex(&manifest_bytes),
        signature: sign(&manifest_bytes, key)?,
    };
    fs_err::write(out_dir.join(SIGNATURE_FILENAME), pretty_bytes(&signature)?)?;

    info!(
        bundle_dir = %out_dir.display(),
        files = manifest.files.len(),
        key_id = %signature.key_id,
        "Evidence bundle exported"
    );
    Ok(ExportResult {
        bundle_dir: out_dir.clone(),
        manifest,
        signature,
    })
}

pub fn verify(bundle_dir: &Path, key: &[u8]) -> Result<VerifyResult> {
    if key.is_empty() {
        return Err(EvidenceError::MissingSigningKey.into());
    }
    let manifest_bytes = fs_err::read(bundle_dir.join(MANIFEST_FILENAME))?;
    let signature_bytes = fs_err::read(bundle_dir.join(SIGNATURE_FILENAME))?;

    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|err| EvidenceError::Malformed(format!("decode manifest: {}", err)))?;
    let signature: Signature = serde_json::from_slice(&signature_bytes)
        .map_err(|err| EvidenceError::Malformed(format!("decode signature: {}", err)))?;

    if !signature.algorithm.eq_ignore_ascii_case(SIGNATURE_ALGORITHM) {
        return Err(EvidenceError::UnsupportedAlgorithm(signature.algorithm).into());
    }
    if !hex_eq(&sha256_hex(&manifest_bytes), &signature.manifest_sha256) {
        return Err(EvidenceError::ManifestDigestMismatch.into());
    }
    if !hex_eq(&sign(&manifest_bytes, key)?, &signature.signature) {
        return Err(EvidenceError::SignatureMismatch.into());
    }

    for file in &manifest.files {
        let name = file.path.trim();
        if name.is_empty() {
            return Err(EvidenceError::InvalidPath("manifest file entry has empty path".into()).into());
        }
        if Path::new(name).file_name().and_then(|n| n.to_str()) != Some(name) {
            return Err(EvidenceError::InvalidPath(name.to_string()).into());
        }
        let actual = file_digest(&bundle_dir.join(name))?;
        if !hex_eq(&actual.sha256, &file.sha256) {
            return Err(EvidenceError::FileDigestMismatch(name.to_string()).into());
        }
        if actual.bytes != file.bytes {
            return Err(EvidenceError::FileSizeMismatch {
                path: name.to_string(),
                expected: file.bytes,
                actual: actual.bytes,
            }
            .into());
        }
    }

    Ok(VerifyResult {
        bundle_dir: bundle_dir.to_path_buf(),
        file_count: manifest.files.len(),
    })
}

/// Decodes a signing key given as `hex:…`, `base64:…`, bare hex, or raw text.
pub fn decode_signing_key(raw: &str) -> Result<Vec<u8>> {
    let raw = raw.trim();
    let key = if let Some(encoded) = raw.strip_prefix("hex:") {
        hex::decode(encoded.trim()).map_err(|err| {
            EvidenceError::InvalidSigningKey(format!("invalid hex signing key: {}", err))
        })?
    } else if let Some(encoded) = raw.strip_prefix("base64:") {
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| {
                EvidenceError::InvalidSigningKey(format!("invalid base64 signing key: {}", err))
            })?
    } else if looks_like_hex(raw) {
        hex::decode(raw).unwrap_or_else(|_| raw.as_bytes().to_vec())
    } else {
        raw.as_bytes().to_vec()
    };

    if key.len() < MIN_SIGNING_KEY_BYTES {
        return Err(EvidenceError::InvalidSigningKey(format!(
            "signing key must be at least {} bytes after decoding",
            MIN_SIGNING_KEY_BYTES
        ))
        .into());
    }
    Ok(key)
}

/// Resolves the signing key: explicit flag, then the signing-key env var,
/// then the master key.
pub fn resolve_signing_key(flag: Option<&str>) -> Result<Vec<u8>> {
    let from_env = |name: &str| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    };
    let raw = flag
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| from_env(SIGNING_KEY_ENV))
        .or_else(|| from_env(MASTER_KEY_ENV))
        .ok_or(EvidenceError::MissingSigningKey)?;
    decode_signing_key(&raw)
}

fn looks_like_hex(value: &str) -> bool {
    !value.is_empty() && value.len() % 2 == 0 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn write_json<T: Serialize + ?Sized>(dir: &Path, name: &str, payload: &T) -> Result<BundleFile> {
    let bytes = pretty_bytes(payload)?;
    fs_err::write(dir.join(name), &bytes)?;
    Ok(BundleFile {
        path: name.to_string(),
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

fn pretty_bytes<T: Serialize + ?Sized>(payload: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(payload)?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn file_digest(path: &Path) -> Result<BundleFile> {
    let bytes = fs_err::read(path)?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(BundleFile {
        path: name,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn key_id(key: &[u8]) -> String {
    hex::encode(&Sha256::digest(key)[..8])
}

fn sign(payload: &[u8], key: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| FlowforgeError::Crypto(format!("HMAC key rejected: {}", err)))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn hex_eq(a: &str, b: &str) -> bool {
    let a = a.trim().to_ascii_lowercase();
    let b = b.trim().to_ascii_lowercase();
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{sample_incident, test_db};
    use crate::db::{Event, EVENT_INCIDENT};

    const KEY: &[u8] = b"0123456789abcdef-evidence";

    fn seeded(dir: &Path) -> Db {
        let db = test_db(dir);
        db.insert_event(&Event::new("run-1", EVENT_DECISION, "policy", "KILL").incident("inc-1"))
            .expect("decision");
        db.insert_event(&Event::new("run-1", EVENT_AUDIT, "flowforge", "AUTO_KILL").incident("inc-1"))
            .expect("audit");
        db.insert_incident(&sample_incident("run-1", "inc-1"))
            .expect("incident");
        db.insert_event(
            &Event::new("run-1", EVENT_INCIDENT, "flowforge", "LOOP_DETECTED").incident("inc-1"),
        )
        .expect("incident event");
        db
    }

    #[test]
    fn export_then_verify() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = seeded(temp_dir.path());
        let mut options = ExportOptions::new(temp_dir.path().join("bundle"));
        options.incident_id = Some("inc-1".to_string());

        let exported = export(&db, &options, KEY).expect("export");
        let names: Vec<&str> = exported.manifest.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "audit_events.json",
                "decision_traces.json",
                "incident_chain.json",
                "incidents.json",
                "summary.json",
                "timeline.json",
            ]
        );
        assert_eq!(exported.signature.algorithm, "HMAC-SHA256");
        assert_eq!(exported.signature.key_id.len(), 16);

        let verified = verify(&exported.bundle_dir, KEY).expect("verify");
        assert_eq!(verified.file_count, exported.manifest.files.len());

        let chain = fs_err::read_to_string(exported.bundle_dir.join("incident_chain.json"))
            .expect("chain");
        let chain: Vec<Event> = serde_json::from_str(&chain).expect("chain json");
        let titles: Vec<&str> = chain.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["KILL", "AUTO_KILL", "LOOP_DETECTED"]);
    }

    #[test]
    fn chain_file_only_with_incident() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = seeded(temp_dir.path());
        let exported = export(&db, &ExportOptions::new(temp_dir.path().join("b")), KEY)
            .expect("export");
        assert_eq!(exported.manifest.files.len(), 5);
        assert!(exported.manifest.selected_incident_id.is_none());
    }

    #[test]
    fn tampered_file_fails() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = seeded(temp_dir.path());
        let exported = export(&db, &ExportOptions::new(temp_dir.path().join("b")), KEY)
            .expect("export");

        let target = exported.bundle_dir.join("timeline.json");
        let mut bytes = fs_err::read(&target).expect("read");
        bytes[3] ^= 0x01;
        fs_err::write(&target, bytes).expect("write");

        let err = verify(&exported.bundle_dir, KEY).expect_err("tamper detected");
        assert!(matches!(
            err,
            FlowforgeError::Evidence(EvidenceError::FileDigestMismatch(ref path)) if path == "timeline.json"
        ));
    }

    #[test]
    fn tampered_manifest_and_wrong_key_fail_distinctly() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let db = seeded(temp_dir.path());
        let exported = export(&db, &ExportOptions::new(temp_dir.path().join("b")), KEY)
            .expect("export");

        let err = verify(&exported.bundle_dir, b"another-key-of-16-bytes").expect_err("wrong key");
        assert!(matches!(err, FlowforgeError::Evidence(EvidenceError::SignatureMismatch)));

        let manifest = exported.bundle_dir.join(MANIFEST_FILENAME);
        let mut text = fs_err::read_to_string(&manifest).expect("read");
        text.push(' ');
        fs_err::write(&manifest, text).expect("write");
        let err = verify(&exported.bundle_dir, KEY).expect_err("manifest tamper");
        assert!(matches!(err, FlowforgeError::Evidence(EvidenceError::ManifestDigestMismatch)));
    }

    #[test]
    fn signing_key_formats() {
        assert_eq!(
            decode_signing_key("hex:000102030405060708090a0b0c0d0e0f").expect("hex"),
            (0u8..16).collect::<Vec<_>>()
        );
        assert_eq!(
            decode_signing_key("base64:AAECAwQFBgcICQoLDA0ODw==").expect("b64"),
            (0u8..16).collect::<Vec<_>>()
        );
        assert_eq!(
            decode_signing_key("000102030405060708090a0b0c0d0e0f").expect("auto hex"),
            (0u8..16).collect::<Vec<_>>()
        );
        assert_eq!(
            decode_signing_key("plain-text-signing-key").expect("raw"),
            b"plain-text-signing-key".to_vec()
        );
        assert!(decode_signing_key("short").is_err());
        assert!(decode_signing_key("hex:zz").is_err());
        assert!(resolve_signing_key(Some("  an-explicit-flag-key  ")).is_ok());
    }
}
