//! Normalized creation payload produced by the provider mapping profiles.

use serde::{Deserialize, Serialize};

/// Logical reference from a source record to its organization.
///
/// Either a remote organization id (the organization already exists in the
/// destination) or an external id, optionally with a display name used when
/// the organization has to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum OrgReference {
    Id { org_id: String },
    External {
        external_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

/// One source user, already mapped into the destination's shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default)]
    pub email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<OrgReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

impl ImportRecord {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            external_id: None,
            email: email.into(),
            first_name: None,
            last_name: None,
            email_verified: false,
            password_hash: None,
            organization: None,
            role: None,
        }
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn with_organization(mut self, organization: OrgReference) -> Self {
        self.organization = Some(organization);
        self
    }
}

impl OrgReference {
    pub fn id(org_id: impl Into<String>) -> Self {
        Self::Id {
            org_id: org_id.into(),
        }
    }

    pub fn external(external_id: impl Into<String>, name: Option<String>) -> Self {
        Self::External {
            external_id: external_id.into(),
            name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_deserializes_with_defaults() {
        let json = r#"{"email":"ada@example.com","organization":{"kind":"external","external_id":"acme"}}"#;
        let record: ImportRecord = serde_json::from_str(json).unwrap();

        assert_eq!(record.email, "ada@example.com");
        assert!(!record.email_verified);
        assert_eq!(record.organization, Some(OrgReference::external("acme", None)));
    }
}
