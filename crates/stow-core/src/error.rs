use std::path::PathBuf;

use thiserror::Error;

use crate::types::HookStage;

pub type StowResult<T> = Result<T, StowError>;

#[derive(Debug, Error)]
pub enum StowError {
    /// A hook vetoed the operation. Displays the hook's own message.
    #[error("{source}")]
    HookAborted {
        stage: HookStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("storage write failed for {path}: {source}")]
    BackendWrite {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// Partial or total delete failure. `deleted` lists what did go away.
    #[error("storage delete failed for {} of {} paths: {reason}", .failed.len(), .failed.len() + .deleted.len())]
    BackendDelete {
        deleted: Vec<String>,
        failed: Vec<String>,
        reason: String,
    },

    /// A file name or derived destination that would leave the user's directory
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("walking {}: {source}", path.display())]
    Traversal {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StowError {
    pub fn hook(stage: HookStage, source: anyhow::Error) -> Self {
        StowError::HookAborted { stage, source }
    }

    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        StowError::InvalidPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, StowError::Cancelled)
    }
}
