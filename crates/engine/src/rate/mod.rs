//! Shared rate budget and the grant protocol workers use to reach it.
//!
//! The [`RateBudget`] is owned by the coordinator. Workers never touch it:
//! they go through a [`GrantClient`], which turns every remote call into a
//! `rate-limit-request` / `rate-limit-grant` exchange with a bounded wait.

pub mod budget;
pub mod gate;
pub mod protocol;

pub use budget::{Acquire, RateBudget};
pub use gate::{RateGate, Unlimited};
pub use protocol::{GrantClient, serve_grant};

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// No grant arrived within the allowed wait. Local failure, not a remote one.
    #[error("timed out after {0:?} waiting for a rate grant")]
    Timeout(Duration),
    /// The request was rejected because the requester is shutting down.
    #[error("rate request rejected: worker is shutting down")]
    Rejected,
    /// The budget (or the channel to it) is gone.
    #[error("rate budget is closed")]
    Closed,
}
