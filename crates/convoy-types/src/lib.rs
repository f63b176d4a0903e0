//! Shared types for the Convoy orchestration engine.
//!
//! This is the foundation crate: every other Convoy crate depends on it and
//! nothing here depends on the rest of the workspace. It holds the typed
//! identifiers, the error enum, the on-disk data model (items, plans, review
//! findings), the event records that flow through the ledger, the canonical
//! path layout, and the environment-driven configuration.

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod item;
pub mod paths;
pub mod plan;
pub mod review;

pub use config::ConvoyConfig;
pub use error::{ConvoyError, Result};
pub use event::{
    AgentStatus, ApprovalUi, EventKind, EventRecord, ItemStatus, RiskFlags,
};
pub use ids::{AgentId, EventId, ItemId};
pub use item::{Item, LinkMode, RepositoryCatalog, RepositoryConfig, RepositorySource};
pub use paths::DataLayout;
pub use plan::{Plan, PlanTask, PLAN_VERSION};
pub use review::{Finding, OverallAssessment, ReviewFindings, Severity};

/// Roles that belong to the orchestration machinery rather than to a
/// repository. Agents in these roles are never bound to a repository and
/// never count as dev workers.
pub const SYSTEM_ROLES: [&str; 2] = ["planner", "review-receiver"];

/// The role label used for review agents spawned by the worker controller.
pub const REVIEW_ROLE: &str = "review";

/// Whether a role is a system role (planner, review-receiver).
pub fn is_system_role(role: &str) -> bool {
    SYSTEM_ROLES.contains(&role)
}

/// Whether a role identifies a dev worker (neither system nor review).
pub fn is_worker_role(role: &str) -> bool {
    !is_system_role(role) && role != REVIEW_ROLE
}
