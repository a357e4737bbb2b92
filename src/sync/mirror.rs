//! Local mirror adapters
//!
//! A `LocalMirror` is the reconciliation engine's view of one resource in the
//! local store. Every method runs on a connection that is already inside the
//! caller's transaction.

use rusqlite::Connection;

use crate::error::Result;
use crate::storage::queries;
use crate::types::{IdFilter, ItemId, LocalRecord, QueryParams, RemoteItem, SyncItem, UpsertOutcome};

/// Mirror of one remote collection in the local store
pub trait LocalMirror<T: SyncItem>: Send + Sync {
    fn resource(&self) -> &str;

    /// Ids currently held locally
    fn list_local_ids(&self, conn: &Connection, filter: &IdFilter) -> Result<Vec<ItemId>>;

    fn upsert(&self, conn: &Connection, item: &T) -> Result<UpsertOutcome>;

    /// Delete `ids`; fails with `NotFound` if any of them is missing
    fn delete_ids(&self, conn: &Connection, ids: &[ItemId]) -> Result<usize>;

    /// Current contents, paginated and filtered
    fn snapshot(&self, conn: &Connection, params: &QueryParams) -> Result<Vec<LocalRecord>>;
}

/// `LocalMirror` over the `mirror_records` table
#[derive(Debug, Clone)]
pub struct SqliteMirror {
    resource: String,
}

impl SqliteMirror {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
        }
    }
}

impl LocalMirror<RemoteItem> for SqliteMirror {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn list_local_ids(&self, conn: &Connection, filter: &IdFilter) -> Result<Vec<ItemId>> {
        queries::find_ids_by_filter(conn, &self.resource, filter)
    }

    fn upsert(&self, conn: &Connection, item: &RemoteItem) -> Result<UpsertOutcome> {
        queries::upsert_record(conn, &self.resource, item)
    }

    fn delete_ids(&self, conn: &Connection, ids: &[ItemId]) -> Result<usize> {
        queries::delete_records(conn, &self.resource, ids)
    }

    fn snapshot(&self, conn: &Connection, params: &QueryParams) -> Result<Vec<LocalRecord>> {
        queries::list_records(conn, &self.resource, params)
    }
}
