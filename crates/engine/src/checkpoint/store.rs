//! File-backed checkpoint store.
//!
//! One JSON file per job under the store directory. Every mutation rewrites
//! the whole record to `<job>.json.tmp` and renames it over `<job>.json`, so
//! a reader sees either the previous or the next state, never a torn one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use idmigrate_core::JobId;

use super::types::{ChunkRecord, ChunkStatus, CheckpointRecord, JobStatus, SCHEMA_VERSION};
use super::CheckpointError;
use crate::chunk::{ChunkId, RowRange};
use crate::config::Credentials;
use crate::org_cache::CacheEntry;
use crate::protocol::ChunkCounts;

const EXTENSION: &str = "json";
const TMP_SUFFIX: &str = ".tmp";

/// One-way hash of the destination credentials.
pub fn credential_hash(credentials: &Credentials) -> String {
    let mut hasher = Sha256::new();
    hasher.update(credentials.domain.as_bytes());
    hasher.update([0u8]);
    hasher.update(credentials.api_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// What a new checkpoint is created from.
#[derive(Debug, Clone)]
pub struct NewCheckpoint<'a> {
    pub job_id: JobId,
    pub input_path: String,
    pub total_rows: u64,
    pub chunk_size: u64,
    pub chunks: &'a [(ChunkId, RowRange)],
    pub credentials: &'a Credentials,
}

/// Summary line for [`CheckpointStore::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckpointListing {
    pub job_id: JobId,
    pub status: JobStatus,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, job_id: &JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.{EXTENSION}"))
    }

    pub fn exists(&self, job_id: &JobId) -> bool {
        self.path_for(job_id).is_file()
    }

    /// Start a job: every chunk `pending`. Fails if the job already has a
    /// checkpoint.
    pub fn create(&self, new: NewCheckpoint<'_>) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(&new.job_id);
        if path.exists() {
            return Err(CheckpointError::AlreadyExists {
                job_id: new.job_id.to_string(),
            });
        }
        fs::create_dir_all(&self.dir).map_err(|e| CheckpointError::io(&self.dir, e))?;

        let now = Utc::now();
        let record = CheckpointRecord {
            schema_version: SCHEMA_VERSION,
            job_id: new.job_id,
            input_path: new.input_path,
            domain: new.credentials.domain.clone(),
            credential_hash: credential_hash(new.credentials),
            status: JobStatus::InProgress,
            created_at: now,
            updated_at: now,
            finished_at: None,
            total_rows: new.total_rows,
            chunk_size: new.chunk_size,
            counts: ChunkCounts::default(),
            error: None,
            warnings: Vec::new(),
            chunks: new
                .chunks
                .iter()
                .map(|(id, range)| ChunkRecord::new(*id, *range))
                .collect(),
            org_cache: Vec::new(),
        };

        let checkpoint = Checkpoint { path, record };
        checkpoint.persist()?;
        info!(
            job_id = %checkpoint.record.job_id,
            chunks = checkpoint.record.chunks.len(),
            path = %checkpoint.path.display(),
            "checkpoint created"
        );
        Ok(checkpoint)
    }

    /// Reopen a job. The supplied credentials must hash to the stored value
    /// and name the same domain; a mismatch leaves the file untouched.
    pub fn resume(&self, job_id: &JobId, credentials: &Credentials) -> Result<Checkpoint, CheckpointError> {
        let path = self.path_for(job_id);
        let record = self.load(job_id)?;

        if record.domain != credentials.domain {
            return Err(CheckpointError::DomainMismatch {
                job_id: job_id.to_string(),
                expected: record.domain,
                actual: credentials.domain.clone(),
            });
        }
        if record.credential_hash != credential_hash(credentials) {
            return Err(CheckpointError::CredentialMismatch {
                job_id: job_id.to_string(),
            });
        }

        debug!(
            %job_id,
            pending = record.chunks_with(ChunkStatus::Pending).len(),
            in_progress = record.chunks_with(ChunkStatus::InProgress).len(),
            completed = record.chunks_with(ChunkStatus::Completed).len(),
            "checkpoint resumed"
        );
        Ok(Checkpoint { path, record })
    }

    /// Read a checkpoint without credential checks (inspection only).
    pub fn load(&self, job_id: &JobId) -> Result<CheckpointRecord, CheckpointError> {
        let path = self.path_for(job_id);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CheckpointError::NotFound {
                    job_id: job_id.to_string(),
                });
            }
            Err(e) => return Err(CheckpointError::io(&path, e)),
        };
        parse_record(&path, &raw)
    }

    /// Every checkpoint in the store, sorted by job id. Leftover temp files
    /// from interrupted writes are skipped.
    pub fn list(&self) -> Result<Vec<CheckpointListing>, CheckpointError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CheckpointError::io(&self.dir, e)),
        };

        let mut listings = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| CheckpointError::io(&self.dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|e| CheckpointError::io(&path, e))?;
            let record = parse_record(&path, &raw)?;
            listings.push(CheckpointListing {
                job_id: record.job_id,
                status: record.status,
                updated_at: record.updated_at,
            });
        }
        listings.sort_by(|a, b| a.job_id.cmp(&b.job_id));
        Ok(listings)
    }

    /// Remove a job's checkpoint. Returns whether one existed.
    pub fn delete(&self, job_id: &JobId) -> Result<bool, CheckpointError> {
        let path = self.path_for(job_id);
        let _ = fs::remove_file(tmp_path(&path));
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CheckpointError::io(&path, e)),
        }
    }
}

fn parse_record(path: &Path, raw: &str) -> Result<CheckpointRecord, CheckpointError> {
    let record: CheckpointRecord = serde_json::from_str(raw).map_err(|e| CheckpointError::Corrupt {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    if record.schema_version != SCHEMA_VERSION {
        return Err(CheckpointError::Corrupt {
            path: path.display().to_string(),
            message: format!("unsupported schema version {}", record.schema_version),
        });
    }
    Ok(record)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// An open checkpoint. The coordinator is its only writer.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    path: PathBuf,
    record: CheckpointRecord,
}

impl Checkpoint {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> &CheckpointRecord {
        &self.record
    }

    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.record.status
    }

    /// Only `completed` is final: a `failed` chunk may be started again
    /// and its earlier counts drop out of the job totals.
    pub fn start_chunk(&mut self, chunk_id: ChunkId) -> Result<(), CheckpointError> {
        let chunk = self.transition(chunk_id, ChunkStatus::InProgress, |s| s != ChunkStatus::Completed)?;
        chunk.mark_started();
        self.record.recount();
        self.commit()
    }

    pub fn complete_chunk(
        &mut self,
        chunk_id: ChunkId,
        counts: ChunkCounts,
        duration_ms: u64,
    ) -> Result<(), CheckpointError> {
        let chunk = self.transition(chunk_id, ChunkStatus::Completed, |s| s == ChunkStatus::InProgress)?;
        chunk.mark_completed(counts, duration_ms);
        self.record.recount();
        self.commit()
    }

    pub fn fail_chunk(
        &mut self,
        chunk_id: ChunkId,
        error: impl Into<String>,
        counts: ChunkCounts,
    ) -> Result<(), CheckpointError> {
        let chunk = self.transition(chunk_id, ChunkStatus::Failed, |s| s == ChunkStatus::InProgress)?;
        chunk.mark_failed(error.into(), counts);
        self.record.recount();
        self.commit()
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) -> Result<(), CheckpointError> {
        self.record.warnings.push(warning.into());
        self.commit()
    }

    /// Replace the stored organization cache. Written with the next mutation.
    pub fn set_org_cache(&mut self, entries: Vec<CacheEntry>) {
        self.record.org_cache = entries;
    }

    pub fn complete(&mut self) -> Result<(), CheckpointError> {
        self.record.status = JobStatus::Completed;
        self.record.finished_at = Some(Utc::now());
        self.commit()
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CheckpointError> {
        self.record.status = JobStatus::Failed;
        self.record.error = Some(error.into());
        self.record.finished_at = Some(Utc::now());
        self.commit()
    }

    /// Put a finished job back in progress so it can be resumed.
    pub fn reopen(&mut self) -> Result<(), CheckpointError> {
        self.record.status = JobStatus::InProgress;
        self.record.error = None;
        self.record.finished_at = None;
        self.commit()
    }

    pub fn pending(&self) -> Vec<ChunkId> {
        self.record.chunks_with(ChunkStatus::Pending)
    }

    pub fn in_progress(&self) -> Vec<ChunkId> {
        self.record.chunks_with(ChunkStatus::InProgress)
    }

    pub fn completed(&self) -> Vec<ChunkId> {
        self.record.chunks_with(ChunkStatus::Completed)
    }

    pub fn failed(&self) -> Vec<ChunkId> {
        self.record.chunks_with(ChunkStatus::Failed)
    }

    pub fn chunk(&self, chunk_id: ChunkId) -> Option<&ChunkRecord> {
        self.record.chunk(chunk_id)
    }

    fn transition(
        &mut self,
        chunk_id: ChunkId,
        to: ChunkStatus,
        allowed_from: impl Fn(ChunkStatus) -> bool,
    ) -> Result<&mut ChunkRecord, CheckpointError> {
        let chunk = self
            .record
            .chunk_mut(chunk_id)
            .ok_or(CheckpointError::UnknownChunk(chunk_id))?;
        if !allowed_from(chunk.status) {
            return Err(CheckpointError::InvalidTransition {
                chunk_id,
                from: chunk.status,
                to,
            });
        }
        Ok(chunk)
    }

    fn commit(&mut self) -> Result<(), CheckpointError> {
        self.record.touch();
        self.persist()
    }

    fn persist(&self) -> Result<(), CheckpointError> {
        let json = serde_json::to_vec_pretty(&self.record).map_err(|e| CheckpointError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;

        let tmp = tmp_path(&self.path);
        let mut file = fs::File::create(&tmp).map_err(|e| CheckpointError::io(&tmp, e))?;
        file.write_all(&json).map_err(|e| CheckpointError::io(&tmp, e))?;
        file.sync_all().map_err(|e| CheckpointError::io(&tmp, e))?;
        drop(file);

        fs::rename(&tmp, &self.path).map_err(|e| CheckpointError::io(&self.path, e))
    }
}
