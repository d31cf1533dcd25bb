//! The seam between remote callers and whatever grants them permission.

use super::{RateBudget, RateLimitError};

/// Something that must be asked before each remote call.
#[async_trait::async_trait]
pub trait RateGate: Send + Sync {
    async fn acquire(&self) -> Result<(), RateLimitError>;
}

/// Never waits. Used for dry runs and for callers that are rate limited elsewhere.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unlimited;

#[async_trait::async_trait]
impl RateGate for Unlimited {
    async fn acquire(&self) -> Result<(), RateLimitError> {
        Ok(())
    }
}

/// Direct, in-process use of a budget (standalone cache use). Workers go
/// through [`super::GrantClient`] instead.
#[async_trait::async_trait]
impl RateGate for RateBudget {
    async fn acquire(&self) -> Result<(), RateLimitError> {
        RateBudget::acquire(self).await
    }
}
