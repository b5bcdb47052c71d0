//! LD-002: Typed errors for the collaborators, the checkpoint store, and the
//! pipeline. The CLI flattens all of these to `String` at its boundary.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failure reported by a recipe platform call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Network hiccup, rate limit, 5xx. Worth retrying.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// The mutation is already in effect (duplicate member, collection exists, ...)
    #[error("already satisfied: {message}")]
    Conflict {
        message: String,
        /// Id of the existing collection, when the platform reports it
        existing_id: Option<String>,
    },

    /// Authentication, validation, not-found. Retrying will not help.
    #[error("remote error: {0}")]
    NonRetryable(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failure reported by the external classification service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Failure of the classifier adapter for one recipe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    /// Service down or timing out
    #[error("classification unavailable for {recipe_id}: {reason}")]
    Unavailable { recipe_id: String, reason: String },

    /// Response outside the controlled vocabulary
    #[error("classification invalid for {recipe_id}: {reason}")]
    Invalid { recipe_id: String, reason: String },
}

impl ClassifyError {
    pub fn recipe_id(&self) -> &str {
        match self {
            Self::Unavailable { recipe_id, .. } | Self::Invalid { recipe_id, .. } => recipe_id,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Checkpoint store failure.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint {} is corrupt: {reason} (inspect it, or run `larder reset` to discard it)", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("run {run_key} is already in progress (lock file {})", path.display())]
    RunLocked { run_key: String, path: PathBuf },

    #[error("checkpoint I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot serialize checkpoint: {0}")]
    Serialize(String),
}

/// A single action gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionFailed {
    pub action_id: String,
    /// True when the last error was transient (retries exhausted)
    pub retryable: bool,
    pub attempts: u32,
    pub message: String,
}

impl fmt::Display for ActionFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.retryable {
            "retryable"
        } else {
            "non-retryable"
        };
        write!(
            f,
            "action {} failed after {} attempt(s) ({}): {}",
            self.action_id, self.attempts, kind, self.message
        )
    }
}

impl std::error::Error for ActionFailed {}

/// Errors that stop a pipeline run before or between actions.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error("cannot fetch remote state: {0}")]
    Remote(RemoteError),

    #[error("invalid export file: {0}")]
    Export(String),

    #[error("import requires a classification service")]
    NoClassifier,
}
