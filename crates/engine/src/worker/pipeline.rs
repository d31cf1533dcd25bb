//! Per-row import pipeline: organization, then user, then membership.
//!
//! Every remote call takes one rate grant first. Failed calls are
//! classified and re-attempted while the verdict and the retry policy
//! allow it. A row failure is recorded and the chunk moves on; a rate grant
//! failure aborts the chunk.

use futures::{StreamExt, stream};
use idmigrate_core::{ApiError, IdentityApi, ImportRecord, NewUser, OrgId, UserId};
use tracing::debug;

use crate::chunk::ChunkId;
use crate::config::{OrgMode, WorkerSettings};
use crate::org_cache::{OrgCache, OrgKey, ResolveError};
use crate::protocol::{ChunkCounts, PipelineStep, RowFailure};
use crate::rate::{RateGate, RateLimitError};
use crate::retry::{FailureContext, OperationKind, RetryVerdict, classify};
use crate::source::SourceRow;

/// Result of running one chunk's rows.
#[derive(Debug, Default)]
pub(crate) struct ChunkOutcome {
    pub counts: ChunkCounts,
    pub failures: Vec<RowFailure>,
    /// Set when the chunk stopped early.
    pub aborted: Option<RateLimitError>,
}

enum RowOutcome {
    Imported { memberships: u64 },
    Failed(Box<RowFailure>),
    Aborted(RateLimitError),
}

enum StepError {
    Aborted(RateLimitError),
    Failed {
        status: Option<u16>,
        message: String,
        verdict: RetryVerdict,
        attempts: u32,
    },
}

pub(crate) struct RowPipeline<'a> {
    pub api: &'a dyn IdentityApi,
    pub gate: &'a dyn RateGate,
    pub cache: &'a OrgCache,
    pub settings: &'a WorkerSettings,
}

impl RowPipeline<'_> {
    /// Process `rows` with at most `settings.concurrency` rows in flight.
    /// Outcomes are collected in row order.
    pub(crate) async fn run(&self, chunk_id: ChunkId, rows: Vec<SourceRow>) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();
        let mut results = stream::iter(rows)
            .map(|row| self.process_row(chunk_id, row))
            .buffered(self.settings.concurrency.max(1));

        while let Some(result) = results.next().await {
            match result {
                RowOutcome::Imported { memberships } => {
                    outcome.counts.succeeded += 1;
                    outcome.counts.memberships_created += memberships;
                }
                RowOutcome::Failed(failure) => {
                    debug!(
                        chunk_id = %chunk_id,
                        row = failure.row,
                        step = ?failure.step,
                        reason = %failure.reason,
                        "row failed"
                    );
                    outcome.counts.failed += 1;
                    outcome.failures.push(*failure);
                }
                RowOutcome::Aborted(err) => {
                    outcome.aborted = Some(err);
                    break;
                }
            }
        }
        outcome
    }

    async fn process_row(&self, chunk_id: ChunkId, row: SourceRow) -> RowOutcome {
        let SourceRow { row_number, record } = row;
        let fail = |step: PipelineStep, err: StepError, user_id: Option<&UserId>| match err {
            StepError::Aborted(e) => RowOutcome::Aborted(e),
            StepError::Failed {
                status,
                message,
                verdict,
                attempts,
            } => RowOutcome::Failed(Box::new(RowFailure {
                row: row_number,
                chunk_id,
                email: record.email.clone(),
                step,
                category: verdict.reason.category(status),
                reason: verdict.reason,
                status,
                message,
                attempts,
                user_id: user_id.map(|id| id.to_string()),
            })),
        };

        let org_id = match self.target_org(&record).await {
            Ok(org_id) => org_id,
            Err(err) => return fail(PipelineStep::OrgResolution, err, None),
        };

        let user_id = if self.settings.dry_run {
            UserId::new(format!("dry_run_user_{row_number}"))
        } else {
            let new_user = NewUser::from(&record);
            match self
                .call(OperationKind::UserCreate, None, || self.api.create_user(&new_user))
                .await
            {
                Ok(id) => id,
                Err(err) => return fail(PipelineStep::UserCreate, err, None),
            }
        };

        let Some(org_id) = org_id else {
            return RowOutcome::Imported { memberships: 0 };
        };

        if !self.settings.dry_run {
            let role = record.role.as_deref();
            let created = self
                .call(OperationKind::MembershipCreate, Some(&user_id), || {
                    self.api.create_membership(&user_id, &org_id, role)
                })
                .await;
            if let Err(err) = created {
                return fail(PipelineStep::MembershipCreate, err, Some(&user_id));
            }
        }
        RowOutcome::Imported { memberships: 1 }
    }

    /// The organization the row's user joins, if any.
    async fn target_org(&self, record: &ImportRecord) -> Result<Option<OrgId>, StepError> {
        let (key, create, name) = match &self.settings.org_mode {
            OrgMode::None => return Ok(None),
            OrgMode::Single { org_id } => (OrgKey::id(org_id.clone()), false, None),
            OrgMode::PerRow { create_missing } => match &record.organization {
                None => return Ok(None),
                Some(reference) => {
                    let (key, name) = OrgKey::from_reference(reference);
                    (key, *create_missing, name)
                }
            },
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.cache.resolve(&key, create, name).await {
                Ok(org_id) => return Ok(Some(org_id)),
                Err(ResolveError::RateLimited(e)) => return Err(StepError::Aborted(e)),
                Err(err) => err,
            };

            let verdict = classify(&err.failure_context());
            if !self.wait_for_retry(&verdict, attempt).await {
                return Err(StepError::Failed {
                    status: err.http_status(),
                    message: err.to_string(),
                    verdict,
                    attempts: attempt,
                });
            }
        }
    }

    /// Run one remote call under the rate gate, retrying per the classifier.
    async fn call<T, F, Fut>(
        &self,
        operation: OperationKind,
        user_id: Option<&UserId>,
        mut remote: F,
    ) -> Result<T, StepError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.gate.acquire().await.map_err(StepError::Aborted)?;

            let err = match remote().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let mut ctx = FailureContext::new(operation, err.status, err.message.clone());
            if let Some(user_id) = user_id {
                ctx = ctx.with_user_id(user_id.as_str());
            }
            let verdict = classify(&ctx);
            if !self.wait_for_retry(&verdict, attempt).await {
                return Err(StepError::Failed {
                    status: err.status,
                    message: err.to_string(),
                    verdict,
                    attempts: attempt,
                });
            }
        }
    }

    /// Sleep out the verdict's backoff. `false` when no retry is due.
    async fn wait_for_retry(&self, verdict: &RetryVerdict, attempt: u32) -> bool {
        let Some(strategy) = verdict.strategy.filter(|_| verdict.retryable) else {
            return false;
        };
        if !self.settings.retry.should_retry(attempt) {
            return false;
        }
        let delay = self.settings.retry.delay_for(strategy);
        debug!(
            attempt,
            reason = %verdict.reason,
            delay_ms = delay.as_millis() as u64,
            low_confidence = verdict.low_confidence,
            "retrying remote call"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use idmigrate_core::{ApiOperation, InMemoryIdentityApi, OrgReference};

    use crate::config::RetryPolicy;
    use crate::error::ErrorCategory;
    use crate::org_cache::OrgCacheConfig;
    use crate::rate::Unlimited;
    use crate::retry::RetryReason;

    fn settings(org_mode: OrgMode) -> WorkerSettings {
        WorkerSettings {
            input_path: "memory".into(),
            org_mode,
            concurrency: 4,
            dry_run: false,
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_ms: 1_000,
            },
            grant_timeout_ms: 5_000,
        }
    }

    fn rows(records: Vec<ImportRecord>) -> Vec<SourceRow> {
        records
            .into_iter()
            .enumerate()
            .map(|(i, record)| SourceRow {
                row_number: i as u64 + 1,
                record,
            })
            .collect()
    }

    async fn run(api: &Arc<InMemoryIdentityApi>, settings: &WorkerSettings, records: Vec<ImportRecord>) -> ChunkOutcome {
        let cache = OrgCache::new(
            api.clone(),
            Arc::new(Unlimited),
            OrgCacheConfig::default().with_dry_run(settings.dry_run),
        );
        let pipeline = RowPipeline {
            api: api.as_ref(),
            gate: &Unlimited,
            cache: &cache,
            settings,
        };
        pipeline.run(ChunkId(0), rows(records)).await
    }

    fn member_of(email: &str, org: &str) -> ImportRecord {
        ImportRecord::new(email).with_organization(OrgReference::external(org, Some(org.to_uppercase())))
    }

    #[tokio::test]
    async fn per_row_orgs_are_created_once_and_joined() {
        let api = InMemoryIdentityApi::arc();
        let settings = settings(OrgMode::PerRow { create_missing: true });

        let outcome = run(
            &api,
            &settings,
            vec![
                member_of("a@example.com", "acme"),
                member_of("b@example.com", "acme"),
                member_of("c@example.com", "globex"),
                ImportRecord::new("d@example.com"),
            ],
        )
        .await;

        assert_eq!(
            outcome.counts,
            ChunkCounts {
                succeeded: 4,
                failed: 0,
                memberships_created: 3
            }
        );
        assert_eq!(api.calls(ApiOperation::CreateOrganization), 2);
        assert_eq!(api.membership_count(), 3);
        assert!(outcome.aborted.is_none());
    }

    #[tokio::test]
    async fn bad_row_is_recorded_and_the_rest_continue() {
        let api = InMemoryIdentityApi::arc();
        let outcome = run(
            &api,
            &settings(OrgMode::None),
            vec![
                ImportRecord::new("a@example.com"),
                ImportRecord::new("not-an-email"),
                ImportRecord::new("c@example.com"),
            ],
        )
        .await;

        assert_eq!(outcome.counts.succeeded, 2);
        assert_eq!(outcome.counts.failed, 1);
        let failure = &outcome.failures[0];
        assert_eq!(failure.row, 2);
        assert_eq!(failure.step, PipelineStep::UserCreate);
        assert_eq!(failure.category, ErrorCategory::Validation);
        assert_eq!(failure.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn server_errors_are_retried_and_rate_limits_back_off() {
        let api = InMemoryIdentityApi::arc();
        api.fail_next(ApiOperation::CreateUser, ApiError::new(503, "unavailable"));
        api.fail_next(ApiOperation::CreateUser, ApiError::new(429, "slow down"));

        let start = tokio::time::Instant::now();
        let outcome = run(&api, &settings(OrgMode::None), vec![ImportRecord::new("a@example.com")]).await;

        assert_eq!(outcome.counts.succeeded, 1);
        assert_eq!(api.calls(ApiOperation::CreateUser), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn retries_stop_at_max_attempts() {
        let api = InMemoryIdentityApi::arc();
        for _ in 0..3 {
            api.fail_next(ApiOperation::CreateUser, ApiError::new(500, "boom"));
        }
        let outcome = run(&api, &settings(OrgMode::None), vec![ImportRecord::new("a@example.com")]).await;

        assert_eq!(outcome.counts.failed, 1);
        assert_eq!(outcome.failures[0].attempts, 3);
        assert_eq!(outcome.failures[0].reason, RetryReason::UserCreateUnavailable);
        assert_eq!(outcome.failures[0].category, ErrorCategory::TransientRemote);
    }

    #[tokio::test]
    async fn membership_failure_keeps_the_created_user() {
        let api = InMemoryIdentityApi::arc();
        let org = api.seed_organization("Acme", Some("acme"));
        api.fail_next(ApiOperation::CreateMembership, ApiError::conflict("exists").with_code("membership_exists"));

        let outcome = run(
            &api,
            &settings(OrgMode::Single {
                org_id: org.to_string(),
            }),
            vec![ImportRecord::new("a@example.com")],
        )
        .await;

        let failure = &outcome.failures[0];
        assert_eq!(failure.step, PipelineStep::MembershipCreate);
        assert_eq!(failure.reason, RetryReason::MembershipDuplicate);
        assert_eq!(failure.category, ErrorCategory::Conflict);
        assert!(failure.user_id.is_some());
        assert_eq!(api.user_count(), 1);
        assert_eq!(api.calls(ApiOperation::CreateUser), 1);
    }

    #[tokio::test]
    async fn unknown_single_org_fails_each_row_as_not_found() {
        let api = InMemoryIdentityApi::arc();
        let outcome = run(
            &api,
            &settings(OrgMode::Single {
                org_id: "org_missing".into(),
            }),
            vec![ImportRecord::new("a@example.com")],
        )
        .await;

        assert_eq!(outcome.failures[0].step, PipelineStep::OrgResolution);
        assert_eq!(outcome.failures[0].reason, RetryReason::OrgNotFound);
        assert_eq!(api.user_count(), 0);
    }

    #[tokio::test]
    async fn dry_run_makes_no_calls() {
        let api = InMemoryIdentityApi::arc();
        let mut settings = settings(OrgMode::PerRow { create_missing: true });
        settings.dry_run = true;

        let outcome = run(
            &api,
            &settings,
            vec![member_of("a@example.com", "acme"), ImportRecord::new("b@example.com")],
        )
        .await;

        assert_eq!(outcome.counts.succeeded, 2);
        assert_eq!(outcome.counts.memberships_created, 1);
        assert_eq!(api.total_calls(), 0);
    }

    struct Closed;

    #[async_trait::async_trait]
    impl RateGate for Closed {
        async fn acquire(&self) -> Result<(), RateLimitError> {
            Err(RateLimitError::Timeout(Duration::from_secs(5)))
        }
    }

    #[tokio::test]
    async fn rate_grant_timeout_aborts_the_chunk() {
        let api = InMemoryIdentityApi::arc();
        let cache = OrgCache::new(api.clone(), Arc::new(Closed), OrgCacheConfig::default());
        let settings = settings(OrgMode::None);
        let pipeline = RowPipeline {
            api: api.as_ref(),
            gate: &Closed,
            cache: &cache,
            settings: &settings,
        };

        let outcome = pipeline
            .run(
                ChunkId(0),
                rows(vec![ImportRecord::new("a@example.com"), ImportRecord::new("b@example.com")]),
            )
            .await;
        assert_eq!(outcome.aborted, Some(RateLimitError::Timeout(Duration::from_secs(5))));
        assert_eq!(outcome.counts.processed(), 0);
        assert_eq!(api.total_calls(), 0);
    }
}
