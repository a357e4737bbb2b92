//! Storage engine for the local mirror
//!
//! Handles SQLite connection setup, transactions with retry on contention,
//! schema management and the mirror's queries.

mod connection;
mod migrations;
pub mod queries;
pub mod retry;
pub mod status;

pub use connection::Storage;
pub use migrations::SCHEMA_VERSION;
pub use retry::{Classification, RetryContext, RetryPolicy};
pub use status::{get_sync_status, list_sync_status, SyncRunRecord};
