//! Organization resolution cache.
//!
//! Turns an organization reference into a remote organization id, creating
//! the organization when allowed. Concurrent resolutions of one key share a
//! single remote operation; a create that loses a race to another process is
//! recovered with one fresh lookup.
//!
//! Each worker owns an [`OrgCache`] seeded from the coordinator's
//! [`CanonicalOrgCache`] and reports what it discovered back with every
//! chunk. The same type, configured with a size bound and a TTL, serves as a
//! standalone cache outside of a job.

mod canonical;
mod store;

pub use canonical::{CanonicalOrgCache, MergeOutcome};

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use idmigrate_core::{ApiError, IdentityApi, NewOrganization, OrgId, OrgReference, RemoteOrganization};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::debug;

use crate::rate::{RateGate, RateLimitError};
use crate::retry::{FailureContext, OperationKind};
use store::{EntryStore, Inserted, Lookup};

/// Resolution key: a remote id or an external id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OrgKey {
    Id(String),
    ExternalId(String),
}

impl OrgKey {
    pub fn id(id: impl Into<String>) -> Self {
        Self::Id(id.into())
    }

    pub fn external(external_id: impl Into<String>) -> Self {
        Self::ExternalId(external_id.into())
    }

    /// Key and display name for a record's organization reference.
    pub fn from_reference(reference: &OrgReference) -> (Self, Option<&str>) {
        match reference {
            OrgReference::Id { org_id } => (Self::Id(org_id.clone()), None),
            OrgReference::External { external_id, name } => (Self::ExternalId(external_id.clone()), name.as_deref()),
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Self::Id(v) | Self::ExternalId(v) => v,
        }
    }

    fn dry_run_org_id(&self) -> OrgId {
        match self {
            Self::Id(id) => OrgId::new(id.clone()),
            Self::ExternalId(ext) => OrgId::new(format!("dry_run_org_{ext}")),
        }
    }
}

impl std::fmt::Display for OrgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id:{id}"),
            Self::ExternalId(ext) => write!(f, "external_id:{ext}"),
        }
    }
}

/// One resolved organization. Immutable once cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: OrgKey,
    pub org_id: OrgId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl CacheEntry {
    pub fn new(key: OrgKey, org_id: impl Into<OrgId>, name: Option<String>) -> Self {
        Self {
            key,
            org_id: org_id.into(),
            name,
        }
    }

    fn from_remote(key: OrgKey, org: RemoteOrganization) -> Self {
        Self {
            key,
            org_id: org.id,
            name: Some(org.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Callers that attached to an in-flight resolution.
    pub coalesced: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheStats {
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.coalesced += other.coalesced;
        self.evictions += other.evictions;
        self.expired += other.expired;
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrgCacheConfig {
    /// LRU bound. `None` keeps every entry (in-job use).
    pub max_entries: Option<NonZeroUsize>,
    /// Entry lifetime. `None` never expires (in-job use).
    pub ttl: Option<Duration>,
    /// Never call the remote API; synthesize placeholder ids.
    pub dry_run: bool,
}

impl OrgCacheConfig {
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = NonZeroUsize::new(max_entries);
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("organization {key} not found")]
    NotFound { key: OrgKey },

    #[error("resolving organization {key} failed: {error}")]
    Remote { key: OrgKey, error: ApiError },

    /// Creation reported the key as taken, yet a fresh lookup still misses.
    #[error("organization {key} reported as already assigned but could not be looked up: {error}")]
    ConflictUnresolved { key: OrgKey, error: ApiError },

    #[error(transparent)]
    RateLimited(#[from] RateLimitError),

    #[error("resolution of organization {key} was abandoned")]
    Abandoned { key: OrgKey },
}

impl ResolveError {
    pub fn http_status(&self) -> Option<u16> {
        match self {
            ResolveError::Remote { error, .. } | ResolveError::ConflictUnresolved { error, .. } => error.status,
            _ => None,
        }
    }

    pub fn failure_context(&self) -> FailureContext {
        FailureContext::new(OperationKind::OrgResolution, self.http_status(), self.to_string())
    }
}

type Waiter = oneshot::Sender<Result<CacheEntry, ResolveError>>;

enum Slot {
    Hit(CacheEntry),
    Wait(oneshot::Receiver<Result<CacheEntry, ResolveError>>),
    Lead,
}

/// Lock order: `in_flight`, then `store`, then `stats`, then `discovered`.
pub struct OrgCache {
    api: Arc<dyn IdentityApi>,
    gate: Arc<dyn RateGate>,
    dry_run: bool,
    in_flight: Mutex<HashMap<OrgKey, Vec<Waiter>>>,
    store: Mutex<EntryStore>,
    stats: Mutex<CacheStats>,
    discovered: Mutex<Vec<CacheEntry>>,
}

impl std::fmt::Debug for OrgCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrgCache")
            .field("dry_run", &self.dry_run)
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Settles an in-flight resolution. Dropped unsettled (the leading future
/// was cancelled), it releases the waiters with `Abandoned`.
struct InFlightGuard<'a> {
    cache: &'a OrgCache,
    key: OrgKey,
    armed: bool,
}

impl InFlightGuard<'_> {
    fn settle(mut self, result: &Result<CacheEntry, ResolveError>) {
        self.armed = false;
        self.cache.finish(&self.key, result);
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let abandoned = Err(ResolveError::Abandoned { key: self.key.clone() });
            self.cache.finish(&self.key, &abandoned);
        }
    }
}

impl OrgCache {
    pub fn new(api: Arc<dyn IdentityApi>, gate: Arc<dyn RateGate>, config: OrgCacheConfig) -> Self {
        Self {
            api,
            gate,
            dry_run: config.dry_run,
            in_flight: Mutex::new(HashMap::new()),
            store: Mutex::new(EntryStore::new(config.max_entries, config.ttl)),
            stats: Mutex::new(CacheStats::default()),
            discovered: Mutex::new(Vec::new()),
        }
    }

    /// Load entries resolved elsewhere. Keys already cached are left alone
    /// and seeded entries are never reported as discoveries.
    pub fn seed(&self, entries: impl IntoIterator<Item = CacheEntry>) -> usize {
        let mut store = self.store.lock().unwrap();
        let mut added = 0;
        for entry in entries {
            if store.contains(&entry.key) {
                continue;
            }
            if let Inserted::Evicted(_) = store.insert(entry) {
                self.stats.lock().unwrap().evictions += 1;
            }
            added += 1;
        }
        added
    }

    /// Resolve `key` to a remote organization id.
    pub async fn resolve(
        &self,
        key: &OrgKey,
        create_if_missing: bool,
        display_name: Option<&str>,
    ) -> Result<OrgId, ResolveError> {
        let slot = {
            let mut in_flight = self.in_flight.lock().unwrap();
            let mut store = self.store.lock().unwrap();
            let mut stats = self.stats.lock().unwrap();

            match store.get(key) {
                Lookup::Hit(entry) => {
                    stats.hits += 1;
                    Slot::Hit(entry)
                }
                lookup => {
                    if lookup == Lookup::Expired {
                        stats.expired += 1;
                    }
                    match in_flight.get_mut(key) {
                        Some(waiters) => {
                            let (tx, rx) = oneshot::channel();
                            waiters.push(tx);
                            stats.coalesced += 1;
                            Slot::Wait(rx)
                        }
                        None => {
                            in_flight.insert(key.clone(), Vec::new());
                            stats.misses += 1;
                            Slot::Lead
                        }
                    }
                }
            }
        };

        match slot {
            Slot::Hit(entry) => Ok(entry.org_id),
            Slot::Wait(rx) => match rx.await {
                Ok(result) => result.map(|entry| entry.org_id),
                Err(_) => Err(ResolveError::Abandoned { key: key.clone() }),
            },
            Slot::Lead => {
                let guard = InFlightGuard {
                    cache: self,
                    key: key.clone(),
                    armed: true,
                };
                let result = self.resolve_uncached(key, create_if_missing, display_name).await;
                guard.settle(&result);
                result.map(|entry| entry.org_id)
            }
        }
    }

    /// Resolve a record's organization reference.
    pub async fn resolve_reference(
        &self,
        reference: &OrgReference,
        create_if_missing: bool,
    ) -> Result<OrgId, ResolveError> {
        let (key, name) = OrgKey::from_reference(reference);
        self.resolve(&key, create_if_missing, name).await
    }

    /// Cached id for `key`, without touching recency or statistics.
    pub fn peek(&self, key: &OrgKey) -> Option<OrgId> {
        self.store.lock().unwrap().peek(key).map(|entry| entry.org_id.clone())
    }

    /// Entries this cache resolved itself since the last call.
    pub fn take_discovered(&self) -> Vec<CacheEntry> {
        std::mem::take(&mut *self.discovered.lock().unwrap())
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().unwrap()
    }

    /// Statistics since the last call, resetting the counters.
    pub fn take_stats(&self) -> CacheStats {
        std::mem::take(&mut *self.stats.lock().unwrap())
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> Vec<CacheEntry> {
        self.store.lock().unwrap().snapshot()
    }

    pub fn clear(&self) {
        self.store.lock().unwrap().clear();
    }

    fn finish(&self, key: &OrgKey, result: &Result<CacheEntry, ResolveError>) {
        let waiters = {
            let mut in_flight = self.in_flight.lock().unwrap();
            if let Ok(entry) = result {
                let mut store = self.store.lock().unwrap();
                if let Inserted::Evicted(evicted) = store.insert(entry.clone()) {
                    debug!(key = %evicted, "evicted organization cache entry");
                    self.stats.lock().unwrap().evictions += 1;
                }
                self.discovered.lock().unwrap().push(entry.clone());
            }
            in_flight.remove(key).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    async fn resolve_uncached(
        &self,
        key: &OrgKey,
        create_if_missing: bool,
        display_name: Option<&str>,
    ) -> Result<CacheEntry, ResolveError> {
        if self.dry_run {
            return Ok(CacheEntry::new(
                key.clone(),
                key.dry_run_org_id(),
                display_name.map(str::to_string),
            ));
        }

        if let Some(org) = self.lookup(key).await? {
            return Ok(CacheEntry::from_remote(key.clone(), org));
        }

        let external_id = match key {
            OrgKey::ExternalId(ext) if create_if_missing => ext,
            _ => return Err(ResolveError::NotFound { key: key.clone() }),
        };

        let new_org = NewOrganization {
            name: display_name.unwrap_or(external_id).to_string(),
            external_id: Some(external_id.clone()),
        };
        self.gate.acquire().await?;
        match self.api.create_organization(&new_org).await {
            Ok(org) => {
                debug!(key = %key, org_id = %org.id, "created organization");
                Ok(CacheEntry::from_remote(key.clone(), org))
            }
            Err(error) if error.is_external_id_conflict() => {
                debug!(key = %key, "organization created concurrently elsewhere, looking it up again");
                match self.lookup(key).await? {
                    Some(org) => Ok(CacheEntry::from_remote(key.clone(), org)),
                    None => Err(ResolveError::ConflictUnresolved {
                        key: key.clone(),
                        error,
                    }),
                }
            }
            Err(error) => Err(ResolveError::Remote {
                key: key.clone(),
                error,
            }),
        }
    }

    async fn lookup(&self, key: &OrgKey) -> Result<Option<RemoteOrganization>, ResolveError> {
        self.gate.acquire().await?;
        let found = match key {
            OrgKey::Id(id) => self.api.get_organization_by_id(&OrgId::new(id.clone())).await,
            OrgKey::ExternalId(ext) => self.api.get_organization_by_external_id(ext).await,
        };
        found.map_err(|error| ResolveError::Remote {
            key: key.clone(),
            error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::join_all;
    use idmigrate_core::{ApiOperation, InMemoryIdentityApi, MembershipId, NewUser, UserId};

    use crate::rate::Unlimited;

    fn cache_over(api: Arc<InMemoryIdentityApi>, config: OrgCacheConfig) -> Arc<OrgCache> {
        Arc::new(OrgCache::new(api, Arc::new(Unlimited), config))
    }

    #[tokio::test]
    async fn concurrent_resolution_creates_once() {
        let api = Arc::new(InMemoryIdentityApi::new().with_latency(Duration::from_millis(20)));
        let cache = cache_over(api.clone(), OrgCacheConfig::default());
        let key = OrgKey::external("acme");

        let results = join_all((0..10).map(|_| {
            let cache = cache.clone();
            let key = key.clone();
            async move { cache.resolve(&key, true, Some("Acme")).await }
        }))
        .await;

        let first = results[0].clone().unwrap();
        assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
        assert_eq!(api.calls(ApiOperation::CreateOrganization), 1);
        assert_eq!(api.calls(ApiOperation::GetOrganizationByExternalId), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.coalesced, 9);
        assert_eq!(cache.take_discovered().len(), 1);
    }

    #[tokio::test]
    async fn cached_key_makes_no_remote_calls() {
        let api = InMemoryIdentityApi::arc();
        let cache = cache_over(api.clone(), OrgCacheConfig::default());
        let key = OrgKey::external("acme");

        let id = cache.resolve(&key, true, None).await.unwrap();
        let calls = api.total_calls();

        for _ in 0..5 {
            assert_eq!(cache.resolve(&key, true, None).await.unwrap(), id);
        }
        assert_eq!(api.total_calls(), calls);
        assert_eq!(cache.stats().hits, 5);
    }

    #[tokio::test]
    async fn existing_organization_is_found_not_created() {
        let api = InMemoryIdentityApi::arc();
        let existing = api.seed_organization("Globex", Some("globex"));
        let cache = cache_over(api.clone(), OrgCacheConfig::default());

        let id = cache.resolve(&OrgKey::external("globex"), true, None).await.unwrap();
        assert_eq!(id, existing);
        assert_eq!(api.calls(ApiOperation::CreateOrganization), 0);

        let by_id = cache.resolve(&OrgKey::id(existing.as_str()), false, None).await.unwrap();
        assert_eq!(by_id, existing);
    }

    #[tokio::test]
    async fn missing_organization_without_create_is_not_found() {
        let api = InMemoryIdentityApi::arc();
        let cache = cache_over(api.clone(), OrgCacheConfig::default());

        let err = cache.resolve(&OrgKey::external("nope"), false, None).await.unwrap_err();
        assert_eq!(err, ResolveError::NotFound { key: OrgKey::external("nope") });
        assert_eq!(api.calls(ApiOperation::CreateOrganization), 0);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn failed_resolution_is_not_cached() {
        let api = InMemoryIdentityApi::arc();
        api.fail_next(ApiOperation::GetOrganizationByExternalId, ApiError::new(503, "unavailable"));
        let cache = cache_over(api.clone(), OrgCacheConfig::default());
        let key = OrgKey::external("acme");

        let err = cache.resolve(&key, true, None).await.unwrap_err();
        assert_eq!(err.http_status(), Some(503));

        assert!(cache.resolve(&key, true, None).await.is_ok());
        assert_eq!(api.calls(ApiOperation::GetOrganizationByExternalId), 2);
    }

    #[tokio::test]
    async fn dry_run_synthesizes_ids_without_calls() {
        let api = InMemoryIdentityApi::arc();
        let cache = cache_over(api.clone(), OrgCacheConfig::default().with_dry_run(true));

        let id = cache.resolve(&OrgKey::external("acme"), true, None).await.unwrap();
        assert_eq!(id.as_str(), "dry_run_org_acme");
        assert_eq!(cache.resolve(&OrgKey::id("org_9"), false, None).await.unwrap().as_str(), "org_9");
        assert_eq!(api.total_calls(), 0);
    }

    #[tokio::test]
    async fn seeded_entries_are_hits_and_not_discoveries() {
        let api = InMemoryIdentityApi::arc();
        let cache = cache_over(api.clone(), OrgCacheConfig::default());
        let entry = CacheEntry::new(OrgKey::external("acme"), "org_000042", None);

        assert_eq!(cache.seed([entry.clone(), entry]), 1);
        let id = cache.resolve(&OrgKey::external("acme"), true, None).await.unwrap();
        assert_eq!(id.as_str(), "org_000042");
        assert_eq!(api.total_calls(), 0);
        assert!(cache.take_discovered().is_empty());
    }

    #[tokio::test]
    async fn bounded_cache_evicts_and_counts() {
        let api = InMemoryIdentityApi::arc();
        let cache = cache_over(api.clone(), OrgCacheConfig::default().with_max_entries(1));

        cache.resolve(&OrgKey::external("a"), true, None).await.unwrap();
        cache.resolve(&OrgKey::external("b"), true, None).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.peek(&OrgKey::external("a")).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_leader_releases_waiters() {
        let api = Arc::new(InMemoryIdentityApi::new().with_latency(Duration::from_secs(1)));
        let cache = cache_over(api, OrgCacheConfig::default());
        let key = OrgKey::external("acme");

        let leader = tokio::spawn({
            let (cache, key) = (cache.clone(), key.clone());
            async move { cache.resolve(&key, true, None).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = tokio::spawn({
            let (cache, key) = (cache.clone(), key.clone());
            async move { cache.resolve(&key, true, None).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        leader.abort();
        assert_eq!(waiter.await.unwrap(), Err(ResolveError::Abandoned { key }));
    }

    /// Lookups miss until a create has been attempted; creates always
    /// conflict. `appears_after_conflict` decides whether the second lookup
    /// finds the organization.
    struct RacingApi {
        creates: AtomicUsize,
        lookups: AtomicUsize,
        appears_after_conflict: bool,
    }

    impl RacingApi {
        fn new(appears_after_conflict: bool) -> Arc<Self> {
            Arc::new(Self {
                creates: AtomicUsize::new(0),
                lookups: AtomicUsize::new(0),
                appears_after_conflict,
            })
        }

        fn winner() -> RemoteOrganization {
            RemoteOrganization {
                id: OrgId::new("org_winner"),
                name: "Acme".into(),
                external_id: Some("acme".into()),
            }
        }
    }

    #[async_trait::async_trait]
    impl IdentityApi for RacingApi {
        async fn create_organization(&self, _org: &NewOrganization) -> Result<RemoteOrganization, ApiError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Err(ApiError::conflict("external id already assigned")
                .with_code(idmigrate_core::api::CODE_EXTERNAL_ID_CONFLICT))
        }

        async fn get_organization_by_external_id(
            &self,
            _external_id: &str,
        ) -> Result<Option<RemoteOrganization>, ApiError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            let created = self.creates.load(Ordering::SeqCst) > 0;
            Ok((created && self.appears_after_conflict).then(Self::winner))
        }

        async fn get_organization_by_id(&self, _org_id: &OrgId) -> Result<Option<RemoteOrganization>, ApiError> {
            Ok(None)
        }

        async fn create_user(&self, _user: &NewUser) -> Result<UserId, ApiError> {
            unreachable!()
        }

        async fn create_membership(
            &self,
            _user_id: &UserId,
            _org_id: &OrgId,
            _role: Option<&str>,
        ) -> Result<MembershipId, ApiError> {
            unreachable!()
        }
    }

    #[tokio::test]
    async fn create_conflict_recovers_with_one_lookup() {
        let api = RacingApi::new(true);
        let cache = OrgCache::new(api.clone(), Arc::new(Unlimited), OrgCacheConfig::default());

        let id = cache.resolve(&OrgKey::external("acme"), true, Some("Acme")).await.unwrap();
        assert_eq!(id.as_str(), "org_winner");
        assert_eq!(api.creates.load(Ordering::SeqCst), 1);
        assert_eq!(api.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn conflict_without_a_visible_winner_is_fatal() {
        let api = RacingApi::new(false);
        let cache = OrgCache::new(api.clone(), Arc::new(Unlimited), OrgCacheConfig::default());

        let err = cache.resolve(&OrgKey::external("acme"), true, None).await.unwrap_err();
        assert!(matches!(err, ResolveError::ConflictUnresolved { .. }));
        assert_eq!(err.http_status(), Some(409));
        assert_eq!(api.creates.load(Ordering::SeqCst), 1);
        assert_eq!(api.lookups.load(Ordering::SeqCst), 2);
    }
}
