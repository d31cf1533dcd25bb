//! Job coordinator.
//!
//! Owns the rate budget, the canonical organization cache and the open
//! checkpoint, and is the only writer of all three. One run goes
//! `planning → dispatching ⇄ merging → finalizing` and ends `completed`,
//! `failed` or `aborted`.

mod pool;

use std::collections::VecDeque;
use std::sync::Arc;

use idmigrate_core::IdentityApi;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointError, CheckpointStore, JobStatus, NewCheckpoint};
use crate::chunk::{ChunkId, plan_chunks};
use crate::config::ImportConfig;
use crate::error::{ImportError, ImportResult};
use crate::org_cache::{CacheStats, CanonicalOrgCache};
use crate::protocol::{
    ChunkAssignment, ChunkCounts, ChunkReport, CoordinatorMessage, RowFailure, WorkerEnvelope, WorkerId, WorkerInit,
    WorkerMessage,
};
use crate::rate::{RateBudget, serve_grant};
use crate::source::{JsonLinesSource, RowSource};
use crate::summary::ImportSummary;
use crate::worker::WorkerContext;
use pool::{SlotState, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Planning,
    Dispatching,
    Merging,
    Finalizing,
    Completed,
    Failed,
    /// Stopped on request; the checkpoint is resumable.
    Aborted,
}

/// What the dispatch loop hands to finalizing.
#[derive(Debug, Default)]
struct RunOutcome {
    aborted: bool,
    cache: CacheStats,
    failures: Vec<RowFailure>,
}

/// Loop state shared by the merge and dispatch steps.
struct Dispatch<'a> {
    checkpoint: &'a mut Checkpoint,
    canonical: CanonicalOrgCache,
    pool: WorkerPool,
    queue: VecDeque<ChunkId>,
    outcome: RunOutcome,
}

pub struct Coordinator {
    config: ImportConfig,
    api: Arc<dyn IdentityApi>,
    source: Arc<dyn RowSource>,
    store: CheckpointStore,
    cancel: CancellationToken,
    state: watch::Sender<CoordinatorState>,
}

impl Coordinator {
    /// Coordinator reading rows from the JSON-lines file at `config.input_path`.
    pub fn new(config: ImportConfig, api: Arc<dyn IdentityApi>) -> Self {
        let source = Arc::new(JsonLinesSource::new(&config.input_path));
        let store = CheckpointStore::new(&config.checkpoint_dir);
        let (state, _) = watch::channel(CoordinatorState::Planning);
        Self {
            config,
            api,
            source,
            store,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Read rows from `source` instead of the input file.
    pub fn with_source(mut self, source: Arc<dyn RowSource>) -> Self {
        self.source = source;
        self
    }

    /// Cancelling this token aborts the run: dispatch stops, workers are shut
    /// down and the checkpoint is left in progress.
    pub fn abort_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state_watch(&self) -> watch::Receiver<CoordinatorState> {
        self.state.subscribe()
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Run the job to completion (or abort) and summarize it.
    ///
    /// Failed rows and failed chunks do not make this an `Err`; they are
    /// reported in the summary. `Err` means a structural failure: bad
    /// configuration, a checkpoint that cannot be opened or written, or every
    /// worker gone with work outstanding.
    pub async fn run(self) -> ImportResult<ImportSummary> {
        let started = Instant::now();
        self.set_state(CoordinatorState::Planning);

        let mut checkpoint = match self.plan().await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                error!(error = %err, category = %err.category(), "job planning failed");
                self.set_state(CoordinatorState::Failed);
                return Err(err);
            }
        };
        let job_id = checkpoint.job_id().clone();

        let outcome = match self.execute(&mut checkpoint).await {
            Ok(outcome) => outcome,
            Err(err) => return Err(self.fail_job(&mut checkpoint, err)),
        };

        self.set_state(CoordinatorState::Finalizing);
        if !outcome.aborted && checkpoint.status() == JobStatus::InProgress {
            if let Err(err) = checkpoint.complete() {
                return Err(self.fail_job(&mut checkpoint, err.into()));
            }
        }

        let aborted = outcome.aborted;
        let summary = ImportSummary::build(
            checkpoint.record(),
            checkpoint.path(),
            outcome.failures,
            outcome.cache,
            started.elapsed().as_millis() as u64,
            aborted,
            self.config.dry_run,
        );
        info!(
            %job_id,
            status = %summary.status,
            aborted,
            succeeded = summary.succeeded,
            failed = summary.failed,
            chunks_failed = summary.chunks_failed,
            duration_ms = summary.duration_ms,
            "import finished"
        );
        self.set_state(if aborted {
            CoordinatorState::Aborted
        } else {
            CoordinatorState::Completed
        });
        Ok(summary)
    }

    /// Open or create the checkpoint. Nothing is dispatched when this fails.
    async fn plan(&self) -> ImportResult<Checkpoint> {
        self.config.validate()?;
        let job_id = self.config.job_id_or_generate()?;

        if self.config.resume {
            let mut checkpoint = self.store.resume(&job_id, &self.config.credentials)?;
            let total_rows = self.source.total_rows().await?;
            if total_rows != checkpoint.record().total_rows {
                let warning = format!(
                    "input has {total_rows} rows, job was planned for {}",
                    checkpoint.record().total_rows
                );
                warn!(%job_id, "{warning}");
                checkpoint.add_warning(warning)?;
            }
            let reopen = match checkpoint.status() {
                JobStatus::Failed => true,
                JobStatus::Completed => !checkpoint.failed().is_empty(),
                JobStatus::InProgress => false,
            };
            if reopen {
                info!(%job_id, status = %checkpoint.status(), failed = checkpoint.failed().len(), "reopening job");
                checkpoint.reopen()?;
            }
            info!(
                %job_id,
                pending = checkpoint.pending().len(),
                in_progress = checkpoint.in_progress().len(),
                completed = checkpoint.completed().len(),
                failed = checkpoint.failed().len(),
                "resuming job"
            );
            return Ok(checkpoint);
        }

        let total_rows = self.source.total_rows().await?;
        let chunks = plan_chunks(total_rows, self.config.chunk_size);
        let checkpoint = self.store.create(NewCheckpoint {
            job_id: job_id.clone(),
            input_path: self.config.input_path.display().to_string(),
            total_rows,
            chunk_size: self.config.chunk_size,
            chunks: &chunks,
            credentials: &self.config.credentials,
        })?;
        info!(%job_id, total_rows, chunks = chunks.len(), dry_run = self.config.dry_run, "starting job");
        Ok(checkpoint)
    }

    async fn execute(&self, checkpoint: &mut Checkpoint) -> ImportResult<RunOutcome> {
        if checkpoint.status() != JobStatus::InProgress {
            info!(job_id = %checkpoint.job_id(), status = %checkpoint.status(), "job already finished");
            return Ok(RunOutcome::default());
        }

        // Chunks a crashed run left in progress go first, then retries of
        // failed chunks, then fresh work.
        let queue: VecDeque<ChunkId> = checkpoint
            .in_progress()
            .into_iter()
            .chain(checkpoint.failed())
            .chain(checkpoint.pending())
            .collect();
        if queue.is_empty() {
            return Ok(RunOutcome::default());
        }

        let canonical = CanonicalOrgCache::from_entries(checkpoint.record().org_cache.clone());
        let budget = RateBudget::new(&self.config.rate);
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WorkerEnvelope>();
        let init = WorkerInit {
            settings: self.config.worker_settings(),
            cache_entries: canonical.snapshot(),
            checkpoint_path: checkpoint.path().to_path_buf(),
        };
        let ctx = WorkerContext {
            api: self.api.clone(),
            source: self.source.clone(),
        };
        let workers = self.config.workers.min(queue.len());
        let pool = WorkerPool::spawn(workers, &ctx, &outbound_tx, &init);
        // Only workers hold senders now, so the channel closes when the last one exits.
        drop(outbound_tx);

        debug!(job_id = %checkpoint.job_id(), workers, queued = queue.len(), "workers spawned");
        self.set_state(CoordinatorState::Dispatching);

        let mut run = Dispatch {
            checkpoint,
            canonical,
            pool,
            queue,
            outcome: RunOutcome::default(),
        };
        let cancel = self.cancel.clone();
        let mut shutting_down = false;

        while !run.pool.is_empty() {
            let envelope = tokio::select! {
                biased;
                _ = cancel.cancelled(), if !shutting_down => {
                    info!(job_id = %run.checkpoint.job_id(), busy = run.pool.any_busy(), "abort requested, stopping dispatch");
                    run.outcome.aborted = true;
                    shutting_down = true;
                    run.pool.shutdown_all();
                    continue;
                }
                envelope = outbound_rx.recv() => envelope,
            };
            let Some(WorkerEnvelope { worker, message }) = envelope else {
                break;
            };

            match message {
                WorkerMessage::Ready => {
                    if let Some(slot) = run.pool.get_mut(worker) {
                        if slot.state == SlotState::Starting {
                            slot.state = SlotState::Idle;
                        }
                    }
                }
                WorkerMessage::RateLimitRequest { request_id } => match run.pool.get(worker) {
                    Some(slot) => serve_grant(&budget, request_id, slot.handle.inbox()),
                    None => debug!(worker, %request_id, "rate request from a stopped worker"),
                },
                WorkerMessage::ChunkComplete(report) => self.merge(&mut run, worker, report, None)?,
                WorkerMessage::ChunkFailed { error, report } => self.merge(&mut run, worker, report, Some(error))?,
                WorkerMessage::ShutdownAck => self.on_worker_exit(&mut run, worker)?,
                WorkerMessage::Unknown => warn!(worker, "ignoring unknown worker message"),
            }

            if !shutting_down {
                self.dispatch(&mut run)?;
                if run.queue.is_empty() && !run.pool.any_busy() {
                    debug!(job_id = %run.checkpoint.job_id(), "all chunks settled, shutting workers down");
                    shutting_down = true;
                    run.pool.shutdown_all();
                }
            }
        }

        if !run.outcome.aborted && !run.queue.is_empty() {
            return Err(ImportError::WorkersLost {
                outstanding: run.queue.len(),
            });
        }
        Ok(run.outcome)
    }

    /// Fold a finished chunk into the canonical cache and the checkpoint.
    fn merge(
        &self,
        run: &mut Dispatch<'_>,
        worker: WorkerId,
        report: ChunkReport,
        error: Option<String>,
    ) -> ImportResult<()> {
        let Some(slot) = run.pool.get_mut(worker) else {
            warn!(worker, chunk_id = %report.chunk_id, "report from a stopped worker");
            return Ok(());
        };
        if slot.state != SlotState::Busy(report.chunk_id) {
            warn!(worker, chunk_id = %report.chunk_id, state = ?slot.state, "ignoring report for a chunk the worker does not hold");
            return Ok(());
        }
        slot.state = SlotState::Idle;
        self.set_state(CoordinatorState::Merging);

        let ChunkReport {
            chunk_id,
            counts,
            duration_ms,
            cache_entries,
            cache_stats,
            failures,
            ..
        } = report;

        let merged = run.canonical.merge(cache_entries);
        if merged.added > 0 {
            run.checkpoint.set_org_cache(run.canonical.snapshot());
        }
        run.outcome.cache.merge(&cache_stats);
        run.outcome.failures.extend(failures);

        match error {
            None => {
                run.checkpoint.complete_chunk(chunk_id, counts, duration_ms)?;
                info!(
                    worker,
                    %chunk_id,
                    succeeded = counts.succeeded,
                    failed = counts.failed,
                    memberships = counts.memberships_created,
                    new_orgs = merged.added,
                    duration_ms,
                    "chunk completed"
                );
            }
            Some(error) => {
                warn!(worker, %chunk_id, %error, "chunk failed");
                run.checkpoint.fail_chunk(chunk_id, error, counts)?;
            }
        }

        self.set_state(CoordinatorState::Dispatching);
        Ok(())
    }

    /// Hand queued chunks to idle workers, lowest chunk id first.
    fn dispatch(&self, run: &mut Dispatch<'_>) -> ImportResult<()> {
        for worker in run.pool.idle() {
            let Some(chunk_id) = run.queue.pop_front() else {
                break;
            };
            run.checkpoint.start_chunk(chunk_id)?;
            let chunk = run
                .checkpoint
                .chunk(chunk_id)
                .ok_or(CheckpointError::UnknownChunk(chunk_id))?;
            let (range, attempt) = (chunk.range(), chunk.attempts);

            let Some(slot) = run.pool.get_mut(worker) else {
                run.queue.push_front(chunk_id);
                continue;
            };
            let assignment = ChunkAssignment {
                chunk_id,
                range,
                attempt,
                cache_entries: run.canonical.since(slot.cache_cursor),
            };
            if slot.handle.send(CoordinatorMessage::ProcessChunk(assignment)) {
                slot.cache_cursor = run.canonical.len();
                slot.state = SlotState::Busy(chunk_id);
                debug!(worker, %chunk_id, %range, attempt, "chunk dispatched");
            } else {
                warn!(worker, %chunk_id, "worker unreachable, requeueing chunk");
                run.queue.push_front(chunk_id);
                run.pool.remove(worker);
            }
        }
        Ok(())
    }

    /// A worker acked shutdown. If nobody asked it to stop while it held a
    /// chunk, it died and the chunk fails.
    fn on_worker_exit(&self, run: &mut Dispatch<'_>, worker: WorkerId) -> ImportResult<()> {
        let Some(slot) = run.pool.remove(worker) else {
            return Ok(());
        };
        debug!(worker, remaining = run.pool.len(), "worker stopped");

        if let SlotState::Busy(chunk_id) = slot.state {
            if run.outcome.aborted {
                debug!(worker, %chunk_id, "chunk abandoned, left in progress");
            } else {
                let error = format!("worker {worker} exited unexpectedly");
                warn!(worker, %chunk_id, %error, "chunk lost");
                run.checkpoint.fail_chunk(chunk_id, error, ChunkCounts::default())?;
            }
        }
        Ok(())
    }

    /// Record a structural failure on the checkpoint and pass the error on.
    fn fail_job(&self, checkpoint: &mut Checkpoint, err: ImportError) -> ImportError {
        error!(job_id = %checkpoint.job_id(), error = %err, category = %err.category(), "job failed");
        if let Err(write_err) = checkpoint.fail(err.to_string()) {
            error!(job_id = %checkpoint.job_id(), error = %write_err, "cannot record job failure");
        }
        self.set_state(CoordinatorState::Failed);
        err
    }

    fn set_state(&self, state: CoordinatorState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "coordinator state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use idmigrate_core::{ImportRecord, InMemoryIdentityApi, OrgReference};

    use crate::checkpoint::ChunkStatus;
    use crate::config::{Credentials, OrgMode};
    use crate::source::InMemoryRowSource;

    fn records(n: usize) -> Vec<ImportRecord> {
        (0..n)
            .map(|i| {
                let mut record = ImportRecord::new(format!("user{i}@example.com"));
                record.organization = Some(OrgReference::External {
                    external_id: format!("org-{}", i % 3),
                    name: Some(format!("Org {}", i % 3)),
                });
                record
            })
            .collect()
    }

    fn config(dir: &tempfile::TempDir) -> ImportConfig {
        ImportConfig::new("memory.jsonl")
            .with_job_id("job-unit")
            .with_checkpoint_dir(dir.path())
            .with_workers(2)
            .with_chunk_size(4)
            .with_rate(10_000, None)
            .with_org_mode(OrgMode::PerRow { create_missing: true })
            .with_credentials(Credentials::new("acme.example.com", "sk_test"))
    }

    fn coordinator(config: ImportConfig, api: Arc<InMemoryIdentityApi>, rows: usize) -> Coordinator {
        Coordinator::new(config, api).with_source(Arc::new(InMemoryRowSource::new(records(rows))))
    }

    #[tokio::test]
    async fn imports_every_row_and_creates_each_org_once() {
        let dir = tempfile::tempdir().unwrap();
        let api = InMemoryIdentityApi::arc();

        let summary = coordinator(config(&dir), api.clone(), 10).run().await.unwrap();

        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.succeeded, 10);
        assert_eq!(summary.memberships_created, 10);
        assert_eq!(summary.chunks_total, 3);
        assert_eq!(summary.chunks_completed, 3);
        assert!(summary.is_clean());
        assert_eq!(api.user_count(), 10);
        assert_eq!(api.organization_count(), 3);

        let record = CheckpointStore::new(dir.path())
            .load(&summary.job_id)
            .unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.org_cache.len(), 3);
    }

    #[tokio::test]
    async fn state_watch_ends_completed() {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = coordinator(config(&dir).with_dry_run(true), InMemoryIdentityApi::arc(), 3);
        let states = coordinator.state_watch();

        coordinator.run().await.unwrap();
        assert_eq!(*states.borrow(), CoordinatorState::Completed);
    }

    #[tokio::test]
    async fn empty_input_completes_without_workers() {
        let dir = tempfile::tempdir().unwrap();
        let api = InMemoryIdentityApi::arc();

        let summary = coordinator(config(&dir), api.clone(), 0).run().await.unwrap();
        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.chunks_total, 0);
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_planning() {
        let dir = tempfile::tempdir().unwrap();
        let err = coordinator(config(&dir).with_workers(0), InMemoryIdentityApi::arc(), 3)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::Config(_)));
        assert!(CheckpointStore::new(dir.path()).list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abort_before_dispatch_leaves_job_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let api = InMemoryIdentityApi::arc();
        let coordinator = coordinator(config(&dir), api.clone(), 8);
        coordinator.abort_handle().cancel();

        let summary = coordinator.run().await.unwrap();
        assert!(summary.aborted);
        assert_eq!(summary.status, JobStatus::InProgress);
        assert_eq!(api.total_calls(), 0);

        let record = CheckpointStore::new(dir.path()).load(&summary.job_id).unwrap();
        assert!(record.chunks.iter().all(|c| c.status == ChunkStatus::Pending));
    }

    #[tokio::test]
    async fn completed_job_is_not_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let api = InMemoryIdentityApi::arc();
        coordinator(config(&dir), api.clone(), 5).run().await.unwrap();
        let calls = api.total_calls();

        let summary = coordinator(config(&dir).with_resume(true), api.clone(), 5)
            .run()
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::Completed);
        assert_eq!(summary.succeeded, 5);
        assert_eq!(api.total_calls(), calls);
    }
}
