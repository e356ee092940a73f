//! `smartproj-core` — shared primitives for the projection pipeline.
//!
//! This crate contains **pure** building blocks (no IO, no async): identifiers,
//! the per-aggregate version guard and the failure taxonomy every
//! infrastructure error maps onto.

pub mod error;
pub mod id;
pub mod version;

pub use error::{CoreError, CoreResult, FailureKind};
pub use id::{AggregateId, OutboxMessageId, TenantId};
pub use version::{Version, VersionDecision};
