//! Retry classification for failed remote operations.
//!
//! [`classify`] is a pure decision table. The pipeline decides whether and
//! when to run an operation again from the verdict; nothing here sleeps or
//! keeps state.

use serde::{Deserialize, Serialize};

use crate::error::ErrorCategory;

/// Which remote operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    OrgResolution,
    UserCreate,
    MembershipCreate,
    Other,
}

/// Everything the classifier looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureContext {
    pub http_status: Option<u16>,
    pub operation: Option<OperationKind>,
    pub message: String,
    /// Remote id of a user that already exists for this row.
    pub user_id: Option<String>,
}

impl FailureContext {
    pub fn new(operation: OperationKind, http_status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            http_status,
            operation: Some(operation),
            message: message.into(),
            user_id: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    Immediate,
    WithBackoff,
    ManualFix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    RateLimited,
    OrgNotFound,
    OrgResolutionUnavailable,
    OrgResolutionRejected,
    MembershipDuplicate,
    MembershipUnavailable,
    MembershipInvalid,
    UserCreateUnavailable,
    UserCreateRejected,
    ServerError,
    Conflict,
    Validation,
    UnknownError,
    NotRetryable,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::RateLimited => "rate_limited",
            RetryReason::OrgNotFound => "org_not_found",
            RetryReason::OrgResolutionUnavailable => "org_resolution_unavailable",
            RetryReason::OrgResolutionRejected => "org_resolution_rejected",
            RetryReason::MembershipDuplicate => "membership_duplicate",
            RetryReason::MembershipUnavailable => "membership_unavailable",
            RetryReason::MembershipInvalid => "membership_invalid",
            RetryReason::UserCreateUnavailable => "user_create_unavailable",
            RetryReason::UserCreateRejected => "user_create_rejected",
            RetryReason::ServerError => "server_error",
            RetryReason::Conflict => "conflict",
            RetryReason::Validation => "validation",
            RetryReason::UnknownError => "unknown_error",
            RetryReason::NotRetryable => "not_retryable",
        }
    }

    /// Error-taxonomy bucket for reporting.
    pub fn category(&self, http_status: Option<u16>) -> ErrorCategory {
        match self {
            RetryReason::RateLimited
            | RetryReason::OrgResolutionUnavailable
            | RetryReason::MembershipUnavailable
            | RetryReason::UserCreateUnavailable
            | RetryReason::ServerError
            | RetryReason::UnknownError => ErrorCategory::TransientRemote,
            RetryReason::MembershipDuplicate | RetryReason::Conflict => ErrorCategory::Conflict,
            RetryReason::OrgNotFound | RetryReason::MembershipInvalid | RetryReason::Validation => {
                ErrorCategory::Validation
            }
            RetryReason::OrgResolutionRejected | RetryReason::UserCreateRejected | RetryReason::NotRetryable => {
                match http_status {
                    Some(409) => ErrorCategory::Conflict,
                    Some(s) if s >= 500 => ErrorCategory::TransientRemote,
                    _ => ErrorCategory::Validation,
                }
            }
        }
    }
}

impl std::fmt::Display for RetryReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryVerdict {
    pub retryable: bool,
    pub strategy: Option<RetryStrategy>,
    pub reason: RetryReason,
    /// Set when the verdict is a guess (no status code to go on).
    pub low_confidence: bool,
}

impl RetryVerdict {
    fn retry(strategy: RetryStrategy, reason: RetryReason) -> Self {
        Self {
            retryable: true,
            strategy: Some(strategy),
            reason,
            low_confidence: false,
        }
    }

    fn give_up(reason: RetryReason) -> Self {
        Self {
            retryable: false,
            strategy: None,
            reason,
            low_confidence: false,
        }
    }

    fn manual_fix(reason: RetryReason) -> Self {
        Self {
            strategy: Some(RetryStrategy::ManualFix),
            ..Self::give_up(reason)
        }
    }
}

/// Classify one failure. First matching rule wins.
pub fn classify(ctx: &FailureContext) -> RetryVerdict {
    let status = ctx.http_status;
    let server_error = matches!(status, Some(s) if s >= 500);
    let client_error = matches!(status, Some(s) if (400..500).contains(&s));

    if status == Some(429) {
        return RetryVerdict::retry(RetryStrategy::WithBackoff, RetryReason::RateLimited);
    }

    match ctx.operation {
        Some(OperationKind::OrgResolution) => {
            return if ctx.message.to_ascii_lowercase().contains("not found") {
                RetryVerdict::manual_fix(RetryReason::OrgNotFound)
            } else if status.is_none() || server_error {
                RetryVerdict::retry(RetryStrategy::Immediate, RetryReason::OrgResolutionUnavailable)
            } else {
                RetryVerdict::give_up(RetryReason::OrgResolutionRejected)
            };
        }
        Some(OperationKind::MembershipCreate) if ctx.user_id.is_some() => {
            if status == Some(409) {
                return RetryVerdict::give_up(RetryReason::MembershipDuplicate);
            }
            if server_error {
                return RetryVerdict::retry(RetryStrategy::Immediate, RetryReason::MembershipUnavailable);
            }
            if client_error {
                return RetryVerdict::manual_fix(RetryReason::MembershipInvalid);
            }
        }
        Some(OperationKind::UserCreate) => {
            if server_error {
                return RetryVerdict::retry(RetryStrategy::Immediate, RetryReason::UserCreateUnavailable);
            }
            if client_error {
                return match status {
                    Some(409) => RetryVerdict::give_up(RetryReason::UserCreateRejected),
                    _ => RetryVerdict::manual_fix(RetryReason::UserCreateRejected),
                };
            }
        }
        _ => {}
    }

    match status {
        Some(s) if s >= 500 => RetryVerdict::retry(RetryStrategy::Immediate, RetryReason::ServerError),
        Some(409) => RetryVerdict::give_up(RetryReason::Conflict),
        Some(400) | Some(422) => RetryVerdict::manual_fix(RetryReason::Validation),
        None => RetryVerdict {
            low_confidence: true,
            ..RetryVerdict::retry(RetryStrategy::Immediate, RetryReason::UnknownError)
        },
        Some(_) => RetryVerdict::give_up(RetryReason::NotRetryable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn status(code: u16) -> FailureContext {
        FailureContext {
            http_status: Some(code),
            ..Default::default()
        }
    }

    #[test]
    fn rate_limited_retries_with_backoff() {
        let verdict = classify(&status(429));
        assert!(verdict.retryable);
        assert_eq!(verdict.strategy, Some(RetryStrategy::WithBackoff));
        assert_eq!(verdict.reason, RetryReason::RateLimited);
    }

    #[test]
    fn membership_conflict_after_user_created_is_duplicate() {
        let ctx = FailureContext::new(OperationKind::MembershipCreate, Some(409), "membership exists").with_user_id("u1");
        let verdict = classify(&ctx);
        assert!(!verdict.retryable);
        assert_eq!(verdict.reason, RetryReason::MembershipDuplicate);
        assert_eq!(verdict.reason.as_str(), "membership_duplicate");
    }

    #[test]
    fn missing_status_is_a_low_confidence_retry() {
        let verdict = classify(&FailureContext::default());
        assert!(verdict.retryable);
        assert_eq!(verdict.reason, RetryReason::UnknownError);
        assert!(verdict.low_confidence);
    }

    #[test]
    fn org_resolution_rules() {
        let not_found = FailureContext::new(OperationKind::OrgResolution, Some(404), "Organization not found");
        assert_eq!(classify(&not_found).reason, RetryReason::OrgNotFound);
        assert!(!classify(&not_found).retryable);

        // "not found" wins even over a server error.
        let not_found_5xx = FailureContext::new(OperationKind::OrgResolution, Some(503), "upstream: not found");
        assert!(!classify(&not_found_5xx).retryable);

        let network = FailureContext::new(OperationKind::OrgResolution, None, "connection reset");
        let verdict = classify(&network);
        assert!(verdict.retryable);
        assert_eq!(verdict.strategy, Some(RetryStrategy::Immediate));
        assert!(!verdict.low_confidence);

        let forbidden = FailureContext::new(OperationKind::OrgResolution, Some(403), "forbidden");
        assert_eq!(classify(&forbidden).reason, RetryReason::OrgResolutionRejected);
    }

    #[test]
    fn membership_rules_only_apply_once_the_user_exists() {
        let redo = FailureContext::new(OperationKind::MembershipCreate, Some(502), "bad gateway").with_user_id("u1");
        assert_eq!(classify(&redo).reason, RetryReason::MembershipUnavailable);

        let invalid = FailureContext::new(OperationKind::MembershipCreate, Some(422), "bad role").with_user_id("u1");
        let verdict = classify(&invalid);
        assert_eq!(verdict.reason, RetryReason::MembershipInvalid);
        assert_eq!(verdict.strategy, Some(RetryStrategy::ManualFix));

        // Without a user id the generic table applies.
        let generic = FailureContext::new(OperationKind::MembershipCreate, Some(409), "dup");
        assert_eq!(classify(&generic).reason, RetryReason::Conflict);
    }

    #[test]
    fn user_create_rules() {
        let unavailable = FailureContext::new(OperationKind::UserCreate, Some(500), "boom");
        assert!(classify(&unavailable).retryable);

        let invalid = FailureContext::new(OperationKind::UserCreate, Some(422), "invalid email");
        let verdict = classify(&invalid);
        assert!(!verdict.retryable);
        assert_eq!(verdict.reason.category(Some(422)), ErrorCategory::Validation);

        let exists = FailureContext::new(OperationKind::UserCreate, Some(409), "user exists");
        assert_eq!(classify(&exists).reason.category(Some(409)), ErrorCategory::Conflict);
    }

    #[test]
    fn generic_table() {
        assert_eq!(classify(&status(503)).reason, RetryReason::ServerError);
        assert_eq!(classify(&status(409)).reason, RetryReason::Conflict);
        assert_eq!(classify(&status(400)).reason, RetryReason::Validation);
        assert_eq!(classify(&status(422)).reason, RetryReason::Validation);
        assert_eq!(classify(&status(404)).reason, RetryReason::NotRetryable);
        assert_eq!(classify(&status(302)).reason, RetryReason::NotRetryable);
    }

    fn any_operation() -> impl Strategy<Value = Option<OperationKind>> {
        prop_oneof![
            Just(None),
            Just(Some(OperationKind::OrgResolution)),
            Just(Some(OperationKind::UserCreate)),
            Just(Some(OperationKind::MembershipCreate)),
            Just(Some(OperationKind::Other)),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: retryable verdicts always name how to retry; manual
        /// fixes are never retryable; 429 always backs off.
        #[test]
        fn verdicts_are_consistent(
            http_status in proptest::option::of(100u16..600),
            operation in any_operation(),
            message in "[a-z ]{0,24}",
            user_id in proptest::option::of("u[0-9]{1,3}"),
        ) {
            let ctx = FailureContext { http_status, operation, message, user_id };
            let verdict = classify(&ctx);

            if verdict.retryable {
                prop_assert!(matches!(verdict.strategy, Some(RetryStrategy::Immediate) | Some(RetryStrategy::WithBackoff)));
            } else {
                prop_assert!(verdict.strategy.is_none() || verdict.strategy == Some(RetryStrategy::ManualFix));
            }
            if http_status == Some(429) {
                prop_assert_eq!(verdict.reason, RetryReason::RateLimited);
            }
            prop_assert!(!verdict.low_confidence || http_status.is_none());
        }
    }
}
