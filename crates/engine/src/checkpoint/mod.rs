//! Durable job progress at chunk granularity.

mod store;
mod types;

pub use store::{Checkpoint, CheckpointListing, CheckpointStore, NewCheckpoint, credential_hash};
pub use types::{ChunkRecord, ChunkStatus, CheckpointRecord, JobStatus, SCHEMA_VERSION};

use std::path::Path;

use thiserror::Error;

use crate::chunk::ChunkId;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("checkpoint for job {job_id} already exists")]
    AlreadyExists { job_id: String },

    #[error("no checkpoint for job {job_id}")]
    NotFound { job_id: String },

    #[error("credentials do not match the ones job {job_id} was started with")]
    CredentialMismatch { job_id: String },

    #[error("job {job_id} targets {expected}, not {actual}")]
    DomainMismatch {
        job_id: String,
        expected: String,
        actual: String,
    },

    #[error("checkpoint {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },

    #[error("checkpoint I/O on {path} failed: {message}")]
    Io { path: String, message: String },

    #[error("chunk {0} is not part of this job")]
    UnknownChunk(ChunkId),

    #[error("chunk {chunk_id} cannot go from {from} to {to}")]
    InvalidTransition {
        chunk_id: ChunkId,
        from: ChunkStatus,
        to: ChunkStatus,
    },
}

impl CheckpointError {
    fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }

    /// Credential or domain mismatch on resume.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CheckpointError::CredentialMismatch { .. } | CheckpointError::DomainMismatch { .. }
        )
    }
}
