//! Persisted job and chunk state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use idmigrate_core::JobId;

use crate::chunk::{ChunkId, RowRange};
use crate::org_cache::CacheEntry;
use crate::protocol::ChunkCounts;

/// Version of the on-disk layout. Anything else is rejected as corrupt.
pub const SCHEMA_VERSION: u32 = 1;

/// Job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        })
    }
}

/// Chunk status. `completed` and `failed` end an attempt; a `failed` chunk
/// is queued again on resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl ChunkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkStatus::Completed | ChunkStatus::Failed)
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::InProgress => "in_progress",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One chunk of the plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub chunk_id: ChunkId,
    pub start_row: u64,
    pub end_row: u64,
    pub status: ChunkStatus,
    pub counts: ChunkCounts,
    /// Times this chunk has been started, across runs.
    pub attempts: u32,
    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl ChunkRecord {
    pub fn new(chunk_id: ChunkId, range: RowRange) -> Self {
        Self {
            chunk_id,
            start_row: range.start_row,
            end_row: range.end_row,
            status: ChunkStatus::Pending,
            counts: ChunkCounts::default(),
            attempts: 0,
            error: None,
            started_at: None,
            finished_at: None,
            duration_ms: None,
        }
    }

    pub fn range(&self) -> RowRange {
        RowRange::new(self.start_row, self.end_row)
    }

    /// Mark chunk as in progress. Re-entry after a crash keeps prior counts
    /// out: the chunk is processed again from its first row.
    pub fn mark_started(&mut self) {
        self.status = ChunkStatus::InProgress;
        self.attempts += 1;
        self.counts = ChunkCounts::default();
        self.error = None;
        self.started_at = Some(Utc::now());
        self.finished_at = None;
        self.duration_ms = None;
    }

    pub fn mark_completed(&mut self, counts: ChunkCounts, duration_ms: u64) {
        self.status = ChunkStatus::Completed;
        self.counts = counts;
        self.finished_at = Some(Utc::now());
        self.duration_ms = Some(duration_ms);
    }

    pub fn mark_failed(&mut self, error: String, counts: ChunkCounts) {
        let now = Utc::now();
        self.status = ChunkStatus::Failed;
        self.counts = counts;
        self.error = Some(error);
        self.duration_ms = self
            .started_at
            .map(|started| (now - started).num_milliseconds().max(0) as u64);
        self.finished_at = Some(now);
    }
}

/// The whole checkpoint file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub schema_version: u32,
    pub job_id: JobId,
    pub input_path: String,
    /// Destination domain; compared on resume.
    pub domain: String,
    /// Hex SHA-256 of the destination credentials. Never the credentials.
    pub credential_hash: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub total_rows: u64,
    pub chunk_size: u64,
    /// Sum over finished chunks.
    pub counts: ChunkCounts,
    pub error: Option<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub chunks: Vec<ChunkRecord>,
    /// Canonical organization cache as of the last merge.
    #[serde(default)]
    pub org_cache: Vec<CacheEntry>,
}

impl CheckpointRecord {
    pub fn chunk(&self, chunk_id: ChunkId) -> Option<&ChunkRecord> {
        self.chunks.iter().find(|c| c.chunk_id == chunk_id)
    }

    pub(crate) fn chunk_mut(&mut self, chunk_id: ChunkId) -> Option<&mut ChunkRecord> {
        self.chunks.iter_mut().find(|c| c.chunk_id == chunk_id)
    }

    /// Ids of chunks in `status`, ascending.
    pub fn chunks_with(&self, status: ChunkStatus) -> Vec<ChunkId> {
        let mut ids: Vec<_> = self
            .chunks
            .iter()
            .filter(|c| c.status == status)
            .map(|c| c.chunk_id)
            .collect();
        ids.sort();
        ids
    }

    pub(crate) fn recount(&mut self) {
        let mut counts = ChunkCounts::default();
        for chunk in self.chunks.iter().filter(|c| c.status.is_terminal()) {
            counts.add(&chunk.counts);
        }
        self.counts = counts;
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
