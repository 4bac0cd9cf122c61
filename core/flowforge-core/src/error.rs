//! Error types for flowforge-core operations.

use std::path::PathBuf;

pub type Result<T> = std::result::Result<T, FlowforgeError>;

/// All errors surfaced by the supervision pipeline.
///
/// Policy evaluation never fails, and lifecycle refusals are reported as
/// [`crate::lifecycle::LifecycleError`] values, so neither appears here.
#[derive(Debug, thiserror::Error)]
pub enum FlowforgeError {
    // ─────────────────────────────────────────────────────────────────────
    // Process Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("failed to start process: {cause}")]
    StartFailure { cause: String },

    #[error("process group {pgid} still alive after SIGKILL")]
    TeardownFailure { pgid: i32 },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("invalid run spec: {0}")]
    InvalidRunSpec(String),

    #[error("configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────────────
    // Storage & Crypto Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("storage error: {0}")]
    Storage(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error(transparent)]
    Evidence(#[from] EvidenceError),

    // ─────────────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for FlowforgeError {
    fn from(err: rusqlite::Error) -> Self {
        FlowforgeError::Storage(err.to_string())
    }
}

/// Evidence bundle verification failures. Each mismatch kind is distinct.
#[derive(Debug, thiserror::Error)]
pub enum EvidenceError {
    #[error("signing key is missing: pass --signing-key or set FLOWFORGE_EVIDENCE_SIGNING_KEY or FLOWFORGE_MASTER_KEY")]
    MissingSigningKey,

    #[error("invalid signing key: {0}")]
    InvalidSigningKey(String),

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("manifest digest mismatch")]
    ManifestDigestMismatch,

    #[error("signature mismatch")]
    SignatureMismatch,

    #[error("file digest mismatch: {0}")]
    FileDigestMismatch(String),

    #[error("file size mismatch: {path}: expected {expected} bytes, found {actual}")]
    FileSizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("invalid manifest file path: {0}")]
    InvalidPath(String),

    #[error("malformed bundle: {0}")]
    Malformed(String),
}
