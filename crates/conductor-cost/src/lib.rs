//! # conductor-cost
//!
//! Cost & usage accounting for the Conductor backend: every provider call is
//! recorded with an accuracy class, aggregated by provider/model/workflow/
//! time, and served through an authorized, audited query surface.

pub mod audit;
pub mod authz;
pub mod record;
pub mod store;
pub mod tracker;

pub use audit::{AuditEntry, AuditLog};
pub use authz::{Authorizer, Permission, Role, Scope};
pub use record::{
    AccuracyBreakdown, CostAccuracy, CostAggregate, CostAmount, CostFilter, CostRecord,
};
pub use store::{CostStore, SqliteCostStore};
pub use tracker::CostTracker;
