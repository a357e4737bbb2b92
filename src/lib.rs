//! Mirror Sync - local mirrors of remote catalogs
//!
//! Keeps SQLite mirrors of paginated remote collections (categories,
//! products, tags, attributes) reconciled with their source, with per-key
//! job serialization, retry on store contention and an offline fallback.

pub mod error;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{Result, SyncError};
pub use storage::Storage;
pub use sync::{SyncCoordinator, SyncService};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
