//! Contract of the destination identity platform.
//!
//! The engine treats every call here as an opaque remote operation that
//! either returns an id or fails with an [`ApiError`] carrying an HTTP-like
//! status and an error-type tag.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{MembershipId, OrgId, UserId};
use crate::record::ImportRecord;

/// Error tag returned when an external id is already bound to another
/// organization.
pub const CODE_EXTERNAL_ID_CONFLICT: &str = "external_id_conflict";

/// Structured failure of one remote call.
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("remote error (status {}, code {}): {message}", fmt_status(&.status), .code.as_deref().unwrap_or("none"))]
pub struct ApiError {
    /// HTTP-like status; `None` when the request never produced a response.
    pub status: Option<u16>,
    /// Error-type tag from the remote platform (e.g. `external_id_conflict`).
    pub code: Option<String>,
    pub message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            code: None,
            message: message.into(),
        }
    }

    /// A failure with no status at all (connection reset, DNS, ...).
    pub fn network(message: impl Into<String>) -> Self {
        Self {
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }

    pub fn is_conflict(&self) -> bool {
        self.status == Some(409)
    }

    /// The remote refused to bind an external id because another
    /// organization already owns it.
    pub fn is_external_id_conflict(&self) -> bool {
        self.is_conflict() || self.code.as_deref() == Some(CODE_EXTERNAL_ID_CONFLICT)
    }
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map_or_else(|| "none".to_string(), |s| s.to_string())
}

/// Organization as seen by the remote platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteOrganization {
    pub id: OrgId,
    pub name: String,
    pub external_id: Option<String>,
}

/// Payload for `create_organization`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrganization {
    pub name: String,
    pub external_id: Option<String>,
}

/// Payload for `create_user`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub external_id: Option<String>,
    pub email: String,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email_verified: bool,
    pub password_hash: Option<String>,
}

impl From<&ImportRecord> for NewUser {
    fn from(record: &ImportRecord) -> Self {
        Self {
            external_id: record.external_id.clone(),
            email: record.email.clone(),
            first_name: record.first_name.clone(),
            last_name: record.last_name.clone(),
            email_verified: record.email_verified,
            password_hash: record.password_hash.clone(),
        }
    }
}

/// Remote identity platform client.
///
/// Lookups return `Ok(None)` when the organization does not exist; every
/// other failure is an [`ApiError`].
#[async_trait::async_trait]
pub trait IdentityApi: Send + Sync {
    async fn create_organization(&self, org: &NewOrganization) -> Result<RemoteOrganization, ApiError>;

    async fn get_organization_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<RemoteOrganization>, ApiError>;

    async fn get_organization_by_id(&self, org_id: &OrgId) -> Result<Option<RemoteOrganization>, ApiError>;

    async fn create_user(&self, user: &NewUser) -> Result<UserId, ApiError>;

    async fn create_membership(
        &self,
        user_id: &UserId,
        org_id: &OrgId,
        role: Option<&str>,
    ) -> Result<MembershipId, ApiError>;
}
