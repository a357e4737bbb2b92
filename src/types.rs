//! Core types for mirror sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable identifier shared by remote items and local records
pub type ItemId = i64;

/// Contract every synchronizable item satisfies.
///
/// The dependency-ordering and orphan-pruning algorithms only need an id and
/// an optional parent reference, so they stay reusable across resource kinds.
pub trait SyncItem {
    /// Stable id, unique within one synchronization pass
    fn id(&self) -> ItemId;

    /// Parent in the same collection; `None` for roots
    fn parent_id(&self) -> Option<ItemId>;
}

/// A record as delivered by the remote catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteItem {
    pub id: ItemId,
    /// Parent reference (`parent`, `parentId` and `parent_id` are accepted)
    #[serde(default, alias = "parent", alias = "parentId")]
    pub parent_id: Option<ItemId>,
    /// Every other field of the remote record
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl RemoteItem {
    pub fn new(id: ItemId, parent_id: Option<ItemId>) -> Self {
        Self {
            id,
            parent_id,
            payload: Map::new(),
        }
    }

    /// Builder-style payload field
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

impl SyncItem for RemoteItem {
    fn id(&self) -> ItemId {
        self.id
    }

    /// A parent of `0` is how the catalog spells "no parent"
    fn parent_id(&self) -> Option<ItemId> {
        self.parent_id.filter(|p| *p != 0)
    }
}

/// A row of the local mirror
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub resource: String,
    pub id: ItemId,
    pub parent_id: Option<ItemId>,
    pub payload: Value,
    pub content_hash: String,
    /// False once the CRUD layer soft-deletes the record
    pub active: bool,
    pub synced_at: DateTime<Utc>,
}

/// Outcome of a single upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Filter for id lookups in the mirror
#[derive(Debug, Clone, Copy, Default)]
pub struct IdFilter {
    /// Include soft-deleted records
    pub include_inactive: bool,
}

/// Pagination and filtering for reads of the mirror
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryParams {
    /// 1-based page number
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub parent_id: Option<ItemId>,
    /// Case-insensitive substring match on the payload
    pub search: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
}

impl QueryParams {
    /// Default page size for mirror reads
    pub const DEFAULT_PER_PAGE: u32 = 100;

    pub fn page(page: u32, per_page: u32) -> Self {
        Self {
            page: Some(page),
            per_page: Some(per_page),
            ..Default::default()
        }
    }

    /// LIMIT and OFFSET for SQLite; offsets past `i64::MAX` saturate
    pub(crate) fn limit_offset(&self) -> (i64, i64) {
        let per_page = u64::from(self.per_page.unwrap_or(Self::DEFAULT_PER_PAGE).max(1));
        let page = u64::from(self.page.unwrap_or(1).max(1));
        let offset = (page - 1).saturating_mul(per_page).min(i64::MAX as u64);
        (per_page as i64, offset as i64)
    }
}

/// Shape of a remote collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// Items may reference a parent in the same collection
    Hierarchical,
    Flat,
}

/// How a remote collection is fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchMode {
    Paginated,
    SingleShot,
}

/// Everything the engine needs to know about one resource type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub key: String,
    pub kind: ResourceKind,
    pub fetch: FetchMode,
    /// Overrides `SyncConfig::delete_chunk_size`
    pub delete_chunk_size: Option<usize>,
    /// Whether soft-deleted records are pruned when they vanish remotely
    pub prune_inactive: bool,
}

impl ResourceSpec {
    pub fn hierarchical(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ResourceKind::Hierarchical,
            fetch: FetchMode::Paginated,
            delete_chunk_size: None,
            prune_inactive: true,
        }
    }

    pub fn flat(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ResourceKind::Flat,
            fetch: FetchMode::Paginated,
            delete_chunk_size: None,
            prune_inactive: true,
        }
    }

    pub fn single_shot(mut self) -> Self {
        self.fetch = FetchMode::SingleShot;
        self
    }

    pub fn with_delete_chunk_size(mut self, size: usize) -> Self {
        self.delete_chunk_size = Some(size);
        self
    }

    pub fn keep_inactive(mut self) -> Self {
        self.prune_inactive = false;
        self
    }

    /// The catalog resources the application mirrors out of the box
    pub fn defaults() -> Vec<ResourceSpec> {
        vec![
            ResourceSpec::hierarchical("categories"),
            ResourceSpec::hierarchical("products").with_delete_chunk_size(500),
            ResourceSpec::flat("tags").single_shot(),
            ResourceSpec::flat("attributes").with_delete_chunk_size(100),
        ]
    }
}

/// Result handed back to business-entity services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
    pub success: bool,
    /// Number of rows in `rows`
    pub count: usize,
    pub rows: Vec<LocalRecord>,
    pub message: String,
    /// True when the local cache was served because the remote was unreachable
    #[serde(default)]
    pub degraded: bool,
    /// Original error detail for diagnostics
    pub error: Option<String>,
    #[serde(default)]
    pub deleted: usize,
    pub run_id: String,
}

/// Persisted outcome of the last sync of a resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub resource: String,
    pub last_run_id: Option<String>,
    pub last_started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_processed: i64,
    pub last_deleted: i64,
    pub degraded: bool,
    pub run_count: i64,
}

// =============================================================================
// Configuration
// =============================================================================

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    pub db_path: String,
    /// Storage mode (local or cloud-safe)
    #[serde(default)]
    pub storage_mode: StorageMode,
    /// SQLite busy timeout in milliseconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,
}

fn default_busy_timeout() -> u64 {
    5000
}

impl StorageConfig {
    pub fn new(db_path: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            storage_mode: StorageMode::default(),
            busy_timeout_ms: default_busy_timeout(),
        }
    }
}

/// Storage mode for SQLite
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum StorageMode {
    #[default]
    Local,
    CloudSafe,
}

impl std::str::FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "wal" => Ok(StorageMode::Local),
            "cloud-safe" | "cloudsafe" | "cloud" => Ok(StorageMode::CloudSafe),
            _ => Err(format!("Unknown storage mode: {}", s)),
        }
    }
}

/// Retry configuration for transient store errors
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter_ms: u64,
    #[serde(default = "default_cap_delay")]
    pub cap_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay() -> u64 {
    500
}

fn default_jitter() -> u64 {
    1000
}

fn default_cap_delay() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            jitter_ms: default_jitter(),
            cap_delay_ms: default_cap_delay(),
        }
    }
}

impl RetryConfig {
    /// Millisecond-scale retries without jitter
    pub fn fast() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1,
            jitter_ms: 0,
            cap_delay_ms: 20,
        }
    }
}

/// Reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Remote page size
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Chunk size for flat upserts
    #[serde(default = "default_upsert_chunk")]
    pub upsert_chunk_size: usize,
    /// Chunk size for orphan deletion
    #[serde(default = "default_delete_chunk")]
    pub delete_chunk_size: usize,
    /// Pause after a run settles before the next queued run of the same key
    #[serde(default = "default_quiescence")]
    pub quiescence_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Override for the network error keyword set
    #[serde(default)]
    pub network_keywords: Option<Vec<String>>,
}

fn default_page_size() -> u32 {
    100
}

fn default_upsert_chunk() -> usize {
    50
}

fn default_delete_chunk() -> usize {
    200
}

fn default_quiescence() -> u64 {
    250
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            upsert_chunk_size: default_upsert_chunk(),
            delete_chunk_size: default_delete_chunk(),
            quiescence_ms: default_quiescence(),
            retry: RetryConfig::default(),
            network_keywords: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_item_parent_aliases() {
        let a: RemoteItem = serde_json::from_str(r#"{"id": 2, "parent": 1, "name": "Shoes"}"#).unwrap();
        let b: RemoteItem = serde_json::from_str(r#"{"id": 2, "parentId": 1}"#).unwrap();
        let c: RemoteItem = serde_json::from_str(r#"{"id": 3, "parent": 0}"#).unwrap();
        let d: RemoteItem = serde_json::from_str(r#"{"id": 4}"#).unwrap();

        assert_eq!(a.parent_id(), Some(1));
        assert_eq!(a.payload.get("name"), Some(&Value::from("Shoes")));
        assert!(!a.payload.contains_key("parent"));
        assert_eq!(b.parent_id(), Some(1));
        assert_eq!(c.parent_id(), None);
        assert_eq!(d.parent_id(), None);
    }

    #[test]
    fn test_query_params_paging() {
        assert_eq!(QueryParams::default().limit_offset(), (100, 0));
        assert_eq!(QueryParams::page(3, 20).limit_offset(), (20, 40));
        assert_eq!(QueryParams::page(0, 0).limit_offset(), (1, 0));
    }

    #[test]
    fn test_query_params_paging_large_pages() {
        assert_eq!(
            QueryParams::page(50_000_000, 100).limit_offset(),
            (100, 4_999_999_900)
        );
        assert_eq!(
            QueryParams::page(u32::MAX, u32::MAX).limit_offset(),
            (u32::MAX as i64, i64::MAX)
        );
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: SyncConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.page_size, 100);
        assert_eq!(config.upsert_chunk_size, 50);
        assert_eq!(config.quiescence_ms, 250);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.cap_delay_ms, 10_000);
    }

    #[test]
    fn test_storage_mode_parse() {
        assert_eq!("local".parse::<StorageMode>(), Ok(StorageMode::Local));
        assert_eq!("cloud-safe".parse::<StorageMode>(), Ok(StorageMode::CloudSafe));
        assert!("tape".parse::<StorageMode>().is_err());
    }
}
