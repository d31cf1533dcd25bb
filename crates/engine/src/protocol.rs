//! Coordinator ⇄ worker message protocol.
//!
//! Both directions are tagged unions handled exhaustively. The serde form
//! (`{"type": "process-chunk", ...}`) is what an out-of-process transport
//! would carry; tags this build does not know decode to `Unknown`, which
//! receivers log and skip.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::{ChunkId, RowRange};
use crate::config::WorkerSettings;
use crate::error::ErrorCategory;
use crate::org_cache::{CacheEntry, CacheStats};
use crate::retry::RetryReason;

pub type WorkerId = u32;

/// Coordinator → worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CoordinatorMessage {
    Initialize(WorkerInit),
    ProcessChunk(ChunkAssignment),
    RateLimitGrant { request_id: Uuid },
    Shutdown,
    #[serde(other)]
    Unknown,
}

/// Worker → coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    Ready,
    ChunkComplete(ChunkReport),
    ChunkFailed { error: String, report: ChunkReport },
    RateLimitRequest { request_id: Uuid },
    ShutdownAck,
    #[serde(other)]
    Unknown,
}

/// A worker message stamped with its sender.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEnvelope {
    pub worker: WorkerId,
    pub message: WorkerMessage,
}

impl WorkerEnvelope {
    pub fn new(worker: WorkerId, message: WorkerMessage) -> Self {
        Self { worker, message }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInit {
    pub settings: WorkerSettings,
    pub cache_entries: Vec<CacheEntry>,
    pub checkpoint_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkAssignment {
    pub chunk_id: ChunkId,
    pub range: RowRange,
    /// How many times this chunk has been dispatched, this one included.
    pub attempt: u32,
    /// Canonical cache entries the worker has not been sent yet.
    pub cache_entries: Vec<CacheEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCounts {
    pub succeeded: u64,
    pub failed: u64,
    pub memberships_created: u64,
}

impl ChunkCounts {
    pub fn processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    pub fn add(&mut self, other: &ChunkCounts) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.memberships_created += other.memberships_created;
    }
}

/// Step of the per-row pipeline a failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    OrgResolution,
    UserCreate,
    MembershipCreate,
}

/// One row that did not make it, with enough context for manual review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    pub row: u64,
    pub chunk_id: ChunkId,
    pub email: String,
    pub step: PipelineStep,
    pub category: ErrorCategory,
    pub reason: RetryReason,
    pub status: Option<u16>,
    pub message: String,
    pub attempts: u32,
    /// Set when the user was created but a later step failed.
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub chunk_id: ChunkId,
    pub range: RowRange,
    pub counts: ChunkCounts,
    pub duration_ms: u64,
    /// Organizations this worker resolved that were not in its seed.
    pub cache_entries: Vec<CacheEntry>,
    pub cache_stats: CacheStats,
    pub failures: Vec<RowFailure>,
}

impl ChunkReport {
    pub fn empty(chunk_id: ChunkId, range: RowRange) -> Self {
        Self {
            chunk_id,
            range,
            counts: ChunkCounts::default(),
            duration_ms: 0,
            cache_entries: Vec::new(),
            cache_stats: CacheStats::default(),
            failures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_use_kebab_case_tags() {
        let json = serde_json::to_value(CoordinatorMessage::RateLimitGrant {
            request_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["type"], "rate-limit-grant");

        let json = serde_json::to_value(WorkerMessage::ShutdownAck).unwrap();
        assert_eq!(json["type"], "shutdown-ack");
    }

    #[test]
    fn unknown_tags_decode_to_unknown() {
        let msg: WorkerMessage = serde_json::from_str(r#"{"type":"heartbeat"}"#).unwrap();
        assert_eq!(msg, WorkerMessage::Unknown);

        let msg: CoordinatorMessage = serde_json::from_str(r#"{"type":"pause"}"#).unwrap();
        assert_eq!(msg, CoordinatorMessage::Unknown);
    }

    #[test]
    fn chunk_report_survives_the_wire() {
        let mut report = ChunkReport::empty(ChunkId(3), RowRange::new(7, 9));
        report.counts.succeeded = 2;
        report.counts.failed = 1;

        let msg = WorkerMessage::ChunkFailed {
            error: "cannot read rows".into(),
            report,
        };
        let json = serde_json::to_string(&msg).unwrap();
        let back: WorkerMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
