//! Chunk worker.
//!
//! A worker runs as its own task and talks to the coordinator only through
//! messages: it never sees the rate budget, the canonical cache or the
//! checkpoint. States: `initializing → ready → processing ⇄ ready → shutdown`.

mod pipeline;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use idmigrate_core::IdentityApi;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WorkerSettings;
use crate::org_cache::{OrgCache, OrgCacheConfig};
use crate::protocol::{
    ChunkAssignment, ChunkReport, CoordinatorMessage, WorkerEnvelope, WorkerId, WorkerInit, WorkerMessage,
};
use crate::rate::{GrantClient, RateGate, Unlimited};
use crate::source::RowSource;
use pipeline::RowPipeline;

/// Grant wait used until `initialize` delivers the configured one.
const DEFAULT_GRANT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Initializing,
    Ready,
    Processing,
    Shutdown,
}

/// Collaborators a worker is built with.
#[derive(Clone)]
pub struct WorkerContext {
    pub api: Arc<dyn IdentityApi>,
    pub source: Arc<dyn RowSource>,
}

/// Handle to message and join a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    inbox: mpsc::UnboundedSender<CoordinatorMessage>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Deliver a message. `false` if the worker is gone.
    pub fn send(&self, message: CoordinatorMessage) -> bool {
        self.inbox.send(message).is_ok()
    }

    /// Sender for replies produced outside the coordinator loop (rate grants).
    pub fn inbox(&self) -> mpsc::UnboundedSender<CoordinatorMessage> {
        self.inbox.clone()
    }

    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        let _ = self.inbox.send(CoordinatorMessage::Shutdown);
        let _ = self.join.await;
    }
}

/// Settings and cache received with `initialize`.
struct Runtime {
    settings: WorkerSettings,
    cache: OrgCache,
    gate: Arc<dyn RateGate>,
    checkpoint_path: PathBuf,
}

/// Sends `shutdown-ack` when the worker task ends, however it ends. A
/// coordinator that gets an ack it did not ask for knows the worker died.
struct AckOnExit {
    id: WorkerId,
    outbound: mpsc::UnboundedSender<WorkerEnvelope>,
}

impl Drop for AckOnExit {
    fn drop(&mut self) {
        let _ = self
            .outbound
            .send(WorkerEnvelope::new(self.id, WorkerMessage::ShutdownAck));
    }
}

pub struct Worker {
    id: WorkerId,
    state: WorkerState,
    ctx: WorkerContext,
    grants: Arc<GrantClient>,
    outbound: mpsc::UnboundedSender<WorkerEnvelope>,
    runtime: Option<Runtime>,
}

impl Worker {
    /// Spawn a worker task. It waits for `initialize` before doing anything.
    pub fn spawn(id: WorkerId, ctx: WorkerContext, outbound: mpsc::UnboundedSender<WorkerEnvelope>) -> WorkerHandle {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            id,
            state: WorkerState::Initializing,
            ctx,
            grants: Arc::new(GrantClient::new(id, outbound.clone(), DEFAULT_GRANT_TIMEOUT)),
            outbound,
            runtime: None,
        };
        let join = tokio::spawn(worker.run(inbox_rx));
        WorkerHandle {
            id,
            inbox: inbox_tx,
            join,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<CoordinatorMessage>) {
        let _ack = AckOnExit {
            id: self.id,
            outbound: self.outbound.clone(),
        };

        while let Some(message) = inbox.recv().await {
            match message {
                CoordinatorMessage::Initialize(init) => self.initialize(init),
                CoordinatorMessage::ProcessChunk(assignment) => {
                    if !self.process(assignment, &mut inbox).await {
                        break;
                    }
                }
                CoordinatorMessage::RateLimitGrant { request_id } => {
                    self.grants.on_grant(request_id);
                }
                CoordinatorMessage::Shutdown => break,
                CoordinatorMessage::Unknown => {
                    warn!(worker = self.id, "ignoring unknown coordinator message");
                }
            }
        }

        self.grants.reject_all();
        self.set_state(WorkerState::Shutdown);
    }

    fn initialize(&mut self, init: WorkerInit) {
        if self.state != WorkerState::Initializing {
            warn!(worker = self.id, state = ?self.state, "ignoring repeated initialize");
            return;
        }

        let settings = init.settings;
        // Grant waits are bounded by the job's configured timeout.
        self.grants = Arc::new(GrantClient::new(
            self.id,
            self.outbound.clone(),
            settings.grant_timeout(),
        ));
        let gate: Arc<dyn RateGate> = if settings.dry_run {
            Arc::new(Unlimited)
        } else {
            self.grants.clone()
        };
        let cache = OrgCache::new(
            self.ctx.api.clone(),
            gate.clone(),
            OrgCacheConfig::default().with_dry_run(settings.dry_run),
        );
        let seeded = cache.seed(init.cache_entries);

        debug!(
            worker = self.id,
            seeded,
            checkpoint = %init.checkpoint_path.display(),
            "worker initialized"
        );
        self.runtime = Some(Runtime {
            settings,
            cache,
            gate,
            checkpoint_path: init.checkpoint_path,
        });
        self.set_state(WorkerState::Ready);
        self.send(WorkerMessage::Ready);
    }

    /// Process one chunk while still answering grants and watching for
    /// shutdown. Returns `false` when the worker must stop.
    async fn process(
        &mut self,
        assignment: ChunkAssignment,
        inbox: &mut mpsc::UnboundedReceiver<CoordinatorMessage>,
    ) -> bool {
        if self.state != WorkerState::Ready {
            warn!(worker = self.id, chunk_id = %assignment.chunk_id, state = ?self.state, "refusing chunk");
            self.send(WorkerMessage::ChunkFailed {
                error: format!("worker {} is not ready", self.id),
                report: ChunkReport::empty(assignment.chunk_id, assignment.range),
            });
            return true;
        }

        self.set_state(WorkerState::Processing);
        let chunk_id = assignment.chunk_id;
        let finished = {
            let work = self.run_chunk(assignment);
            tokio::pin!(work);

            loop {
                tokio::select! {
                    message = &mut work => break Some(message),
                    incoming = inbox.recv() => match incoming {
                        Some(CoordinatorMessage::RateLimitGrant { request_id }) => {
                            self.grants.on_grant(request_id);
                        }
                        Some(CoordinatorMessage::Shutdown) | None => {
                            // Abandon the chunk. It stays in progress and is picked up on resume.
                            let rejected = self.grants.reject_all();
                            info!(worker = self.id, %chunk_id, rejected, "abandoning chunk on shutdown");
                            break None;
                        }
                        Some(CoordinatorMessage::ProcessChunk(other)) => {
                            warn!(worker = self.id, busy_with = %chunk_id, chunk_id = %other.chunk_id, "refusing chunk while busy");
                            self.send(WorkerMessage::ChunkFailed {
                                error: format!("worker {} is busy with chunk {chunk_id}", self.id),
                                report: ChunkReport::empty(other.chunk_id, other.range),
                            });
                        }
                        Some(CoordinatorMessage::Initialize(_)) => {
                            warn!(worker = self.id, "ignoring initialize while processing");
                        }
                        Some(CoordinatorMessage::Unknown) => {
                            warn!(worker = self.id, "ignoring unknown coordinator message");
                        }
                    }
                }
            }
        };

        match finished {
            Some(message) => {
                self.send(message);
                self.set_state(WorkerState::Ready);
                true
            }
            None => false,
        }
    }

    async fn run_chunk(&self, assignment: ChunkAssignment) -> WorkerMessage {
        let started = Instant::now();
        let ChunkAssignment {
            chunk_id,
            range,
            attempt,
            cache_entries,
        } = assignment;
        let mut report = ChunkReport::empty(chunk_id, range);

        let Some(runtime) = &self.runtime else {
            return WorkerMessage::ChunkFailed {
                error: format!("worker {} was never initialized", self.id),
                report,
            };
        };
        runtime.cache.seed(cache_entries);
        debug!(worker = self.id, %chunk_id, %range, attempt, "processing chunk");

        let rows = match self.ctx.source.read_range(range).await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(worker = self.id, %chunk_id, error = %err, "cannot read chunk rows");
                return WorkerMessage::ChunkFailed {
                    error: err.to_string(),
                    report,
                };
            }
        };

        let pipeline = RowPipeline {
            api: self.ctx.api.as_ref(),
            gate: runtime.gate.as_ref(),
            cache: &runtime.cache,
            settings: &runtime.settings,
        };
        let outcome = pipeline.run(chunk_id, rows).await;

        report.counts = outcome.counts;
        report.failures = outcome.failures;
        report.cache_entries = runtime.cache.take_discovered();
        report.cache_stats = runtime.cache.take_stats();
        report.duration_ms = started.elapsed().as_millis() as u64;

        match outcome.aborted {
            Some(err) => {
                warn!(
                    worker = self.id,
                    %chunk_id,
                    error = %err,
                    checkpoint = %runtime.checkpoint_path.display(),
                    "chunk aborted"
                );
                WorkerMessage::ChunkFailed {
                    error: err.to_string(),
                    report,
                }
            }
            None => WorkerMessage::ChunkComplete(report),
        }
    }

    fn send(&self, message: WorkerMessage) {
        if self.outbound.send(WorkerEnvelope::new(self.id, message)).is_err() {
            debug!(worker = self.id, "coordinator gone, dropping message");
        }
    }

    fn set_state(&mut self, state: WorkerState) {
        debug!(worker = self.id, from = ?self.state, to = ?state, "worker state");
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use idmigrate_core::{ImportRecord, InMemoryIdentityApi};

    use crate::chunk::{ChunkId, RowRange};
    use crate::config::{OrgMode, RetryPolicy};
    use crate::source::InMemoryRowSource;

    fn settings(dry_run: bool) -> WorkerSettings {
        WorkerSettings {
            input_path: "memory".into(),
            org_mode: OrgMode::None,
            concurrency: 2,
            dry_run,
            retry: RetryPolicy::default(),
            grant_timeout_ms: 5_000,
        }
    }

    fn spawn(
        api: Arc<InMemoryIdentityApi>,
        rows: usize,
    ) -> (WorkerHandle, mpsc::UnboundedReceiver<WorkerEnvelope>) {
        let records = (0..rows)
            .map(|i| ImportRecord::new(format!("user{i}@example.com")))
            .collect();
        let ctx = WorkerContext {
            api,
            source: Arc::new(InMemoryRowSource::new(records)),
        };
        let (tx, rx) = mpsc::unbounded_channel();
        (Worker::spawn(1, ctx, tx), rx)
    }

    fn init(dry_run: bool) -> CoordinatorMessage {
        CoordinatorMessage::Initialize(WorkerInit {
            settings: settings(dry_run),
            cache_entries: Vec::new(),
            checkpoint_path: PathBuf::from("job.json"),
        })
    }

    fn assign(chunk: u32, start: u64, end: u64) -> CoordinatorMessage {
        CoordinatorMessage::ProcessChunk(ChunkAssignment {
            chunk_id: ChunkId(chunk),
            range: RowRange::new(start, end),
            attempt: 1,
            cache_entries: Vec::new(),
        })
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<WorkerEnvelope>) -> WorkerMessage {
        rx.recv().await.unwrap().message
    }

    #[tokio::test]
    async fn dry_run_chunk_reports_counts() {
        let api = InMemoryIdentityApi::arc();
        let (handle, mut rx) = spawn(api.clone(), 5);

        handle.send(init(true));
        assert_eq!(next(&mut rx).await, WorkerMessage::Ready);

        handle.send(assign(0, 1, 5));
        match next(&mut rx).await {
            WorkerMessage::ChunkComplete(report) => {
                assert_eq!(report.chunk_id, ChunkId(0));
                assert_eq!(report.counts.succeeded, 5);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.total_calls(), 0);

        handle.shutdown().await;
        assert_eq!(next(&mut rx).await, WorkerMessage::ShutdownAck);
    }

    #[tokio::test]
    async fn every_call_waits_for_a_grant() {
        let api = InMemoryIdentityApi::arc();
        let (handle, mut rx) = spawn(api.clone(), 2);

        handle.send(init(false));
        assert_eq!(next(&mut rx).await, WorkerMessage::Ready);
        handle.send(assign(0, 1, 2));

        let mut granted = 0;
        loop {
            match next(&mut rx).await {
                WorkerMessage::RateLimitRequest { request_id } => {
                    granted += 1;
                    handle.send(CoordinatorMessage::RateLimitGrant { request_id });
                }
                WorkerMessage::ChunkComplete(report) => {
                    assert_eq!(report.counts.succeeded, 2);
                    break;
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(granted, 2);
        assert_eq!(api.user_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn ungranted_chunk_fails_with_partial_counts() {
        let api = InMemoryIdentityApi::arc();
        let (handle, mut rx) = spawn(api.clone(), 1);

        handle.send(init(false));
        assert_eq!(next(&mut rx).await, WorkerMessage::Ready);
        handle.send(assign(0, 1, 1));

        assert!(matches!(next(&mut rx).await, WorkerMessage::RateLimitRequest { .. }));
        match next(&mut rx).await {
            WorkerMessage::ChunkFailed { error, report } => {
                assert!(error.contains("timed out"));
                assert_eq!(report.counts.processed(), 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test]
    async fn shutdown_abandons_the_current_chunk() {
        let api = Arc::new(InMemoryIdentityApi::new().with_latency(Duration::from_secs(60)));
        let (handle, mut rx) = spawn(api, 1);

        handle.send(init(false));
        assert_eq!(next(&mut rx).await, WorkerMessage::Ready);
        handle.send(assign(0, 1, 1));
        assert!(matches!(next(&mut rx).await, WorkerMessage::RateLimitRequest { .. }));

        handle.send(CoordinatorMessage::Shutdown);
        assert_eq!(next(&mut rx).await, WorkerMessage::ShutdownAck);
    }

    #[tokio::test]
    async fn unread_range_fails_the_chunk() {
        let (handle, mut rx) = spawn(InMemoryIdentityApi::arc(), 2);

        handle.send(init(true));
        assert_eq!(next(&mut rx).await, WorkerMessage::Ready);
        handle.send(assign(3, 7, 9));

        match next(&mut rx).await {
            WorkerMessage::ChunkFailed { error, report } => {
                assert!(error.contains("outside the input"));
                assert_eq!(report.chunk_id, ChunkId(3));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn chunk_before_initialize_is_refused() {
        let (handle, mut rx) = spawn(InMemoryIdentityApi::arc(), 1);
        handle.send(assign(0, 1, 1));
        assert!(matches!(next(&mut rx).await, WorkerMessage::ChunkFailed { .. }));
        handle.send(CoordinatorMessage::Unknown);
        handle.send(init(true));
        assert_eq!(next(&mut rx).await, WorkerMessage::Ready);
    }
}
