//! Catalog mirror synchronization
//!
//! Keeps a local mirror of remote catalog collections in step with the
//! remote: per-key serialization of sync jobs, dependency-ordered upserts,
//! orphan pruning and an offline fallback to the cached mirror.

pub mod coordinator;
pub mod engine;
pub mod fallback;
pub mod mirror;
pub mod remote;
mod scheduler;
mod service;

pub use coordinator::SyncCoordinator;
pub use engine::{
    orphan_ids, plan_dependency_order, DependencyPlan, ReconcileOutcome, ReconciliationEngine,
    PASS_SLACK,
};
pub use fallback::{Guarded, NetworkFallbackPolicy, DEFAULT_NETWORK_KEYWORDS};
pub use mirror::{LocalMirror, SqliteMirror};
#[cfg(feature = "http")]
pub use remote::HttpRemote;
pub use remote::{InjectedFailure, JsonDirRemote, MemoryRemote, RemoteSource};
pub use scheduler::{SchedulerCommand, SyncScheduler};
pub use service::SyncService;
