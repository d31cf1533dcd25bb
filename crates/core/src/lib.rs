//! `idmigrate-core`: domain building blocks shared by the import engine.
//!
//! This crate holds **pure domain** types plus the contract of the remote
//! identity platform. It has no knowledge of chunks, workers or checkpoints.

pub mod api;
pub mod error;
pub mod id;
pub mod in_memory;
pub mod record;

pub use api::{ApiError, IdentityApi, NewOrganization, NewUser, RemoteOrganization};
pub use error::{DomainError, DomainResult};
pub use id::{JobId, MembershipId, OrgId, UserId};
pub use in_memory::{ApiOperation, InMemoryIdentityApi};
pub use record::{ImportRecord, OrgReference};
