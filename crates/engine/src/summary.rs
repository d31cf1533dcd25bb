//! End-of-run summary and the machine-readable error export.

use std::collections::BTreeMap;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use idmigrate_core::JobId;
use serde::Serialize;

use crate::checkpoint::{CheckpointRecord, ChunkStatus, JobStatus};
use crate::chunk::ChunkId;
use crate::error::ErrorCategory;
use crate::org_cache::CacheStats;
use crate::protocol::RowFailure;
use crate::retry::RetryReason;

/// A chunk that failed as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChunkError {
    pub chunk_id: ChunkId,
    pub error: String,
}

/// What one run of a job produced.
///
/// Row and chunk counters come from the checkpoint and so include chunks
/// finished by earlier runs of the same job. `failures` and `cache` cover
/// this run only.
#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub job_id: JobId,
    pub status: JobStatus,
    /// The run was cancelled; the checkpoint is still resumable.
    pub aborted: bool,
    pub dry_run: bool,
    pub total_rows: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub memberships_created: u64,
    pub chunks_total: usize,
    pub chunks_completed: usize,
    pub chunks_failed: usize,
    pub cache: CacheStats,
    pub duration_ms: u64,
    pub checkpoint_path: PathBuf,
    pub errors_by_category: BTreeMap<ErrorCategory, u64>,
    pub errors_by_reason: BTreeMap<RetryReason, u64>,
    pub chunk_errors: Vec<ChunkError>,
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub failures: Vec<RowFailure>,
}

#[derive(Serialize)]
struct ErrorExport<'a> {
    job_id: &'a JobId,
    failed_rows: usize,
    failures: &'a [RowFailure],
    chunk_errors: &'a [ChunkError],
}

impl ImportSummary {
    pub(crate) fn build(
        record: &CheckpointRecord,
        checkpoint_path: &Path,
        mut failures: Vec<RowFailure>,
        cache: CacheStats,
        duration_ms: u64,
        aborted: bool,
        dry_run: bool,
    ) -> Self {
        failures.sort_by_key(|f| f.row);

        let mut errors_by_category = BTreeMap::new();
        let mut errors_by_reason = BTreeMap::new();
        for failure in &failures {
            *errors_by_category.entry(failure.category).or_insert(0) += 1;
            *errors_by_reason.entry(failure.reason).or_insert(0) += 1;
        }

        let chunk_errors = record
            .chunks
            .iter()
            .filter_map(|c| {
                c.error.as_ref().map(|error| ChunkError {
                    chunk_id: c.chunk_id,
                    error: error.clone(),
                })
            })
            .collect::<Vec<_>>();
        if !chunk_errors.is_empty() {
            *errors_by_category.entry(ErrorCategory::LocalInfrastructure).or_insert(0) += chunk_errors.len() as u64;
        }

        Self {
            job_id: record.job_id.clone(),
            status: record.status,
            aborted,
            dry_run,
            total_rows: record.total_rows,
            succeeded: record.counts.succeeded,
            failed: record.counts.failed,
            memberships_created: record.counts.memberships_created,
            chunks_total: record.chunks.len(),
            chunks_completed: record.chunks.iter().filter(|c| c.status == ChunkStatus::Completed).count(),
            chunks_failed: chunk_errors.len(),
            cache,
            duration_ms,
            checkpoint_path: checkpoint_path.to_path_buf(),
            errors_by_category,
            errors_by_reason,
            chunk_errors,
            warnings: record.warnings.clone(),
            failures,
        }
    }

    /// Completed with no failed rows or chunks.
    pub fn is_clean(&self) -> bool {
        self.status == JobStatus::Completed && self.failed == 0 && self.chunks_failed == 0
    }

    /// Write row and chunk failures as pretty JSON for manual review.
    pub fn write_error_export(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let export = ErrorExport {
            job_id: &self.job_id,
            failed_rows: self.failures.len(),
            failures: &self.failures,
            chunk_errors: &self.chunk_errors,
        };
        let mut writer = BufWriter::new(std::fs::File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, &export)?;
        writer.flush()
    }
}
