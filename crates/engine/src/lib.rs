//! `idmigrate-engine`: chunked, resumable identity import orchestration.
//!
//! A [`Coordinator`] splits the input into chunks, hands them to workers,
//! meters every remote call through one shared rate budget, shares resolved
//! organizations between workers and checkpoints progress after every chunk.

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod org_cache;
pub mod protocol;
pub mod rate;
pub mod retry;
pub mod source;
pub mod summary;
pub mod worker;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore, ChunkStatus, JobStatus};
pub use chunk::{ChunkId, RowRange, plan_chunks};
pub use config::{ConfigError, Credentials, ImportConfig, OrgMode, RateConfig, RetryPolicy};
pub use coordinator::{Coordinator, CoordinatorState};
pub use error::{ErrorCategory, ImportError, ImportResult};
pub use org_cache::{CacheEntry, CacheStats, OrgCache, OrgCacheConfig, OrgKey, ResolveError};
pub use rate::{RateBudget, RateGate, RateLimitError};
pub use retry::{FailureContext, OperationKind, RetryReason, RetryStrategy, RetryVerdict, classify};
pub use source::{InMemoryRowSource, JsonLinesSource, RowSource, SourceError};
pub use summary::ImportSummary;
