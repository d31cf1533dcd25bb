//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Identifier of one migration run.
///
/// Job ids are stable strings chosen by the operator (or generated) and are
/// used verbatim as checkpoint file names, so only `[A-Za-z0-9._-]` is allowed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

/// Remote organization identifier assigned by the destination platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrgId(String);

/// Remote user identifier assigned by the destination platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

/// Remote membership identifier assigned by the destination platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MembershipId(String);

macro_rules! impl_string_newtype {
    ($t:ty) => {
        impl $t {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $t {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

impl_string_newtype!(JobId);
impl_string_newtype!(OrgId);
impl_string_newtype!(UserId);
impl_string_newtype!(MembershipId);

macro_rules! impl_remote_id {
    ($t:ty) => {
        impl $t {
            /// Wrap an id returned by the remote platform. Remote ids are opaque.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }
        }

        impl From<String> for $t {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $t {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

impl_remote_id!(OrgId);
impl_remote_id!(UserId);
impl_remote_id!(MembershipId);

impl JobId {
    /// Generate a fresh, time-ordered job id (`job-<uuidv7>`).
    pub fn generate() -> Self {
        Self(format!("job-{}", Uuid::now_v7()))
    }

    /// Validate and wrap a caller-supplied job id.
    pub fn parse(raw: impl Into<String>) -> Result<Self, DomainError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(DomainError::invalid_id("JobId: empty"));
        }
        if raw == "." || raw == ".." {
            return Err(DomainError::invalid_id(format!("JobId: reserved name {raw:?}")));
        }
        if let Some(bad) = raw
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(DomainError::invalid_id(format!(
                "JobId: character {bad:?} not allowed in {raw:?}"
            )));
        }
        Ok(Self(raw))
    }
}

impl FromStr for JobId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
