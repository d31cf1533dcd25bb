use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::config::ConfigError;
use crate::source::SourceError;

/// Where a failure belongs in the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// 5xx, rate limited, network. Retried.
    TransientRemote,
    /// Duplicate external id or membership. Recorded, not retried.
    Conflict,
    /// User-fixable data error.
    Validation,
    /// Checkpoint, credentials, rate grant timeouts.
    LocalInfrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TransientRemote => "transient_remote",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Validation => "validation",
            ErrorCategory::LocalInfrastructure => "local_infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-level failures. Anything here aborts the whole run.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ImportError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("input error: {0}")]
    Source(#[from] SourceError),

    #[error("all workers exited with {outstanding} chunk(s) outstanding")]
    WorkersLost { outstanding: usize },
}

impl ImportError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ImportError::Config(_) | ImportError::Source(_) => ErrorCategory::Validation,
            ImportError::Checkpoint(_) | ImportError::WorkersLost { .. } => ErrorCategory::LocalInfrastructure,
        }
    }
}

pub type ImportResult<T> = Result<T, ImportError>;
