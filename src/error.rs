use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy. Tool failures and detected corruption are
/// deliberately *not* errors: they are per-file outcomes (`RepairOutcome`,
/// `ExtractionOutcome`, `ValidationDecision`) that feed folder-level
/// partial-success semantics instead of aborting a run.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("State serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("safety invariant {invariant} violated: {detail}")]
    SafetyViolation {
        invariant: &'static str,
        detail: String,
    },

    #[error("file still locked after {attempts} attempts: {path:?}")]
    TransientLock { path: PathBuf, attempts: u32 },

    #[error(
        "insufficient disk space: {required} bytes required (before buffer), {available} available"
    )]
    DiskExhaustion { required: u64, available: u64 },

    #[error("invalid configuration for '{field}': {message}")]
    ConfigValidation { field: &'static str, message: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}
