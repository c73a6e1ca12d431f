use std::path::PathBuf;

use thiserror::Error;

/// Failures talking to the tabular source (listing or patching).
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source request failed (status={status}): {body}")]
    Status { status: u16, body: String },

    /// The record no longer accepts the update: removed, renamed field, or
    /// otherwise changed shape since it was listed.
    #[error("record {record_id} rejected update (status={status}): {body}")]
    Conflict {
        record_id: String,
        status: u16,
        body: String,
    },

    #[error("source transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed source response: {0}")]
    Malformed(String),

    #[error("source listing cancelled")]
    Cancelled,
}

impl SourceError {
    /// Network errors, throttling and 5xx responses are worth another listing attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            SourceError::Status { status, .. } => *status == 429 || *status >= 500,
            SourceError::Transport(_) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("image host still throttling after {attempts} attempts")]
    RateLimitExceeded { attempts: u32 },

    #[error("image host rejected upload: {0}")]
    Rejected(String),

    #[error("image host transport error: {0}")]
    Transport(String),

    #[error("malformed image host response: {0}")]
    MalformedResponse(String),

    #[error("upload cancelled")]
    Cancelled,

    /// The upload went through but the quota ledger could not be persisted.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint at {} is not valid JSON: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing env var {0}")]
    Missing(String),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            reason: reason.into(),
        }
    }
}

/// Run-level failures. Anything that reaches this type aborts the run; per-record
/// problems are recorded in the checkpoint instead.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
