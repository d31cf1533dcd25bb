//! In-memory identity platform for tests/dev.
//!
//! Enforces the same uniqueness rules as the real platform (external ids,
//! user emails, one membership per user/org pair), counts every call and can
//! be scripted to fail or to respond slowly.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::api::{ApiError, CODE_EXTERNAL_ID_CONFLICT, IdentityApi, NewOrganization, NewUser, RemoteOrganization};
use crate::id::{MembershipId, OrgId, UserId};

/// Remote operations exposed by [`IdentityApi`], used for call accounting
/// and failure scripting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiOperation {
    CreateOrganization,
    GetOrganizationByExternalId,
    GetOrganizationById,
    CreateUser,
    CreateMembership,
}

#[derive(Debug, Default)]
struct Directory {
    orgs: HashMap<OrgId, RemoteOrganization>,
    orgs_by_external_id: HashMap<String, OrgId>,
    users: HashMap<UserId, NewUser>,
    user_emails: HashSet<String>,
    memberships: HashSet<(UserId, OrgId)>,
}

#[derive(Debug, Default)]
pub struct InMemoryIdentityApi {
    directory: RwLock<Directory>,
    calls: Mutex<HashMap<ApiOperation, usize>>,
    scripted_failures: Mutex<HashMap<ApiOperation, VecDeque<ApiError>>>,
    latency: Mutex<Option<Duration>>,
    sequence: AtomicU64,
}

impl InMemoryIdentityApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Delay every call by `latency` (simulates network round trips).
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock().unwrap() = Some(latency);
        self
    }

    /// Make the next call of `op` fail with `error`. Failures queue up in
    /// FIFO order per operation.
    pub fn fail_next(&self, op: ApiOperation, error: ApiError) {
        self.scripted_failures
            .lock()
            .unwrap()
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Insert an organization directly, bypassing call accounting.
    pub fn seed_organization(&self, name: impl Into<String>, external_id: Option<&str>) -> OrgId {
        let id = self.next_id("org");
        let org = RemoteOrganization {
            id: id.clone().into(),
            name: name.into(),
            external_id: external_id.map(str::to_string),
        };
        let mut dir = self.directory.write().unwrap();
        if let Some(ext) = external_id {
            dir.orgs_by_external_id.insert(ext.to_string(), org.id.clone());
        }
        dir.orgs.insert(org.id.clone(), org);
        OrgId::new(id)
    }

    pub fn calls(&self, op: ApiOperation) -> usize {
        self.calls.lock().unwrap().get(&op).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn organization_count(&self) -> usize {
        self.directory.read().unwrap().orgs.len()
    }

    pub fn user_count(&self) -> usize {
        self.directory.read().unwrap().users.len()
    }

    pub fn membership_count(&self) -> usize {
        self.directory.read().unwrap().memberships.len()
    }

    pub fn organization_by_external_id(&self, external_id: &str) -> Option<RemoteOrganization> {
        let dir = self.directory.read().unwrap();
        dir.orgs_by_external_id
            .get(external_id)
            .and_then(|id| dir.orgs.get(id))
            .cloned()
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}_{n:06}")
    }

    /// Record the call, apply latency, and pop a scripted failure if one is queued.
    async fn enter(&self, op: ApiOperation) -> Result<(), ApiError> {
        *self.calls.lock().unwrap().entry(op).or_insert(0) += 1;

        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = self
            .scripted_failures
            .lock()
            .unwrap()
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(err) => {
                tracing::debug!(?op, status = ?err.status, "injecting scripted failure");
                Err(err)
            }
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IdentityApi for InMemoryIdentityApi {
    async fn create_organization(&self, org: &NewOrganization) -> Result<RemoteOrganization, ApiError> {
        self.enter(ApiOperation::CreateOrganization).await?;

        let mut dir = self.directory.write().unwrap();
        if let Some(ext) = &org.external_id {
            if dir.orgs_by_external_id.contains_key(ext) {
                return Err(ApiError::conflict(format!(
                    "external id {ext} is already assigned to another organization"
                ))
                .with_code(CODE_EXTERNAL_ID_CONFLICT));
            }
        }

        let remote = RemoteOrganization {
            id: OrgId::new(self.next_id("org")),
            name: org.name.clone(),
            external_id: org.external_id.clone(),
        };
        if let Some(ext) = &org.external_id {
            dir.orgs_by_external_id.insert(ext.clone(), remote.id.clone());
        }
        dir.orgs.insert(remote.id.clone(), remote.clone());
        Ok(remote)
    }

    async fn get_organization_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<RemoteOrganization>, ApiError> {
        self.enter(ApiOperation::GetOrganizationByExternalId).await?;
        Ok(self.organization_by_external_id(external_id))
    }

    async fn get_organization_by_id(&self, org_id: &OrgId) -> Result<Option<RemoteOrganization>, ApiError> {
        self.enter(ApiOperation::GetOrganizationById).await?;
        Ok(self.directory.read().unwrap().orgs.get(org_id).cloned())
    }

    async fn create_user(&self, user: &NewUser) -> Result<UserId, ApiError> {
        self.enter(ApiOperation::CreateUser).await?;

        if user.email.trim().is_empty() || !user.email.contains('@') {
            return Err(ApiError::new(422, format!("invalid email address {:?}", user.email))
                .with_code("invalid_email"));
        }

        let mut dir = self.directory.write().unwrap();
        let email = user.email.to_lowercase();
        if dir.user_emails.contains(&email) {
            return Err(ApiError::conflict(format!("user {email} already exists")).with_code("user_exists"));
        }

        let id = UserId::new(self.next_id("user"));
        dir.user_emails.insert(email);
        dir.users.insert(id.clone(), user.clone());
        Ok(id)
    }

    async fn create_membership(
        &self,
        user_id: &UserId,
        org_id: &OrgId,
        _role: Option<&str>,
    ) -> Result<MembershipId, ApiError> {
        self.enter(ApiOperation::CreateMembership).await?;

        let mut dir = self.directory.write().unwrap();
        if !dir.orgs.contains_key(org_id) {
            return Err(ApiError::new(404, format!("organization {org_id} not found")));
        }
        if !dir.users.contains_key(user_id) {
            return Err(ApiError::new(404, format!("user {user_id} not found")));
        }
        if !dir.memberships.insert((user_id.clone(), org_id.clone())) {
            return Err(ApiError::conflict(format!("{user_id} is already a member of {org_id}"))
                .with_code("membership_exists"));
        }
        Ok(MembershipId::new(self.next_id("om")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(email: &str) -> NewUser {
        NewUser {
            external_id: None,
            email: email.to_string(),
            first_name: None,
            last_name: None,
            email_verified: true,
            password_hash: None,
        }
    }

    #[tokio::test]
    async fn duplicate_external_id_is_a_conflict() {
        let api = InMemoryIdentityApi::new();
        let org = NewOrganization {
            name: "Acme".into(),
            external_id: Some("acme".into()),
        };

        api.create_organization(&org).await.unwrap();
        let err = api.create_organization(&org).await.unwrap_err();

        assert_eq!(err.status, Some(409));
        assert!(err.is_external_id_conflict());
        assert_eq!(api.calls(ApiOperation::CreateOrganization), 2);
        assert_eq!(api.organization_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let api = InMemoryIdentityApi::new();
        api.fail_next(ApiOperation::CreateUser, ApiError::new(503, "unavailable"));

        let err = api.create_user(&user("a@example.com")).await.unwrap_err();
        assert_eq!(err.status, Some(503));

        api.create_user(&user("a@example.com")).await.unwrap();
        assert_eq!(api.user_count(), 1);
    }

    #[tokio::test]
    async fn membership_is_unique_per_user_and_org() {
        let api = InMemoryIdentityApi::new();
        let org_id = api.seed_organization("Acme", Some("acme"));
        let user_id = api.create_user(&user("b@example.com")).await.unwrap();

        api.create_membership(&user_id, &org_id, None).await.unwrap();
        let err = api.create_membership(&user_id, &org_id, None).await.unwrap_err();

        assert_eq!(err.status, Some(409));
        assert_eq!(api.membership_count(), 1);
    }
}
