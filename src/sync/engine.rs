//! Reconciliation of a local mirror against a remote collection
//!
//! One pass:
//! 1. fetch the whole remote collection (before any transaction is opened),
//! 2. upsert items, parents before children for hierarchical resources,
//! 3. delete local ids the remote no longer has,
//! 4. re-read the mirror for the caller.
//!
//! Steps 2-4 run in a single transaction with retry on store contention.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::Serialize;

use super::mirror::LocalMirror;
use super::remote::RemoteSource;
use crate::error::{Result, SyncError};
use crate::storage::Storage;
use crate::types::{
    FetchMode, IdFilter, ItemId, LocalRecord, QueryParams, ResourceKind, ResourceSpec, SyncConfig,
    SyncItem, UpsertOutcome,
};

/// Extra passes allowed beyond the item count when ordering by dependency
pub const PASS_SLACK: usize = 10;

/// Upper bound on remote pages, for remotes that never return a short page
const MAX_PAGES: u32 = 100_000;

/// Upsert order computed for a hierarchical collection
#[derive(Debug)]
pub struct DependencyPlan<'a, T> {
    /// Items in an order where every parent precedes its children
    pub ordered: Vec<&'a T>,
    /// Ids whose parent never resolved (cycle or dangling reference)
    pub unresolved: Vec<ItemId>,
    pub passes: usize,
}

/// Order `items` so that each item comes after its parent.
///
/// Works in passes: each pass takes every item whose parent is a root or has
/// already been taken. Stops once everything is taken, a pass makes no
/// progress, or `max_passes` is reached.
pub fn plan_dependency_order<T: SyncItem>(items: &[T], max_passes: usize) -> DependencyPlan<'_, T> {
    let mut processed: HashSet<ItemId> = HashSet::with_capacity(items.len());
    let mut ordered = Vec::with_capacity(items.len());
    let mut remaining: Vec<&T> = items.iter().collect();
    let mut passes = 0;

    while !remaining.is_empty() && passes < max_passes {
        passes += 1;
        let before = remaining.len();

        remaining.retain(|item| {
            let ready = match item.parent_id() {
                None => true,
                Some(parent) => processed.contains(&parent),
            };
            if ready {
                processed.insert(item.id());
                ordered.push(*item);
            }
            !ready
        });

        if remaining.len() == before {
            break;
        }
    }

    let mut unresolved: Vec<ItemId> = remaining.iter().map(|item| item.id()).collect();
    unresolved.sort_unstable();

    DependencyPlan {
        ordered,
        unresolved,
        passes,
    }
}

/// Local ids absent from the remote snapshot, sorted
pub fn orphan_ids(local_ids: &[ItemId], remote_ids: &HashSet<ItemId>) -> Vec<ItemId> {
    let mut orphans: Vec<ItemId> = local_ids
        .iter()
        .copied()
        .filter(|id| !remote_ids.contains(id))
        .collect();
    orphans.sort_unstable();
    orphans.dedup();
    orphans
}

/// Counters and final mirror contents of one reconcile pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileOutcome {
    /// Remote items seen (after de-duplication)
    pub processed: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Ids left out because their parent never resolved
    pub skipped: Vec<ItemId>,
    pub rows: Vec<LocalRecord>,
}

impl ReconcileOutcome {
    /// Outcome carrying only a snapshot, with no changes applied
    pub fn snapshot(rows: Vec<LocalRecord>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    fn tally(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }
}

/// Computes and applies the changes that bring the mirror in line with the
/// remote
#[derive(Clone)]
pub struct ReconciliationEngine {
    storage: Storage,
    config: SyncConfig,
}

impl ReconciliationEngine {
    /// The engine retries its transactions under `config.retry`
    pub fn new(storage: Storage, config: SyncConfig) -> Self {
        Self {
            storage: storage.with_retry_config(config.retry.clone()),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetch every remote item of the resource, de-duplicated by id
    pub async fn fetch_remote<T, R>(&self, spec: &ResourceSpec, remote: &R) -> Result<Vec<T>>
    where
        T: SyncItem + Send + 'static,
        R: RemoteSource<T> + ?Sized,
    {
        let items = match spec.fetch {
            FetchMode::SingleShot => remote.fetch_all(&spec.key).await?,
            FetchMode::Paginated => {
                let page_size = self.config.page_size.max(1);
                let mut items = Vec::new();
                let mut page = 1;
                loop {
                    let batch = remote.fetch_page(&spec.key, page, page_size).await?;
                    let received = batch.len();
                    items.extend(batch);
                    tracing::debug!(resource = %spec.key, page, received, "Fetched remote page");

                    if received < page_size as usize {
                        break;
                    }
                    if page >= MAX_PAGES {
                        return Err(SyncError::Data(format!(
                            "remote pagination for '{}' did not terminate",
                            spec.key
                        )));
                    }
                    page += 1;
                }
                items
            }
        };

        Ok(dedupe_by_id(&spec.key, items))
    }

    /// Reconcile the resource's mirror with the remote collection
    pub async fn reconcile<T, R, M>(
        &self,
        spec: &ResourceSpec,
        remote: &R,
        mirror: &M,
        params: &QueryParams,
    ) -> Result<ReconcileOutcome>
    where
        T: SyncItem + Send + Sync + 'static,
        R: RemoteSource<T> + ?Sized,
        M: LocalMirror<T> + ?Sized,
    {
        let items = self.fetch_remote(spec, remote).await?;
        let remote_ids: HashSet<ItemId> = items.iter().map(|item| item.id()).collect();

        let outcome = self
            .storage
            .transact_with_retry(|conn| self.apply(spec, &items, &remote_ids, mirror, params, conn))
            .await?;

        if !outcome.skipped.is_empty() {
            tracing::warn!(
                resource = %spec.key,
                skipped = ?outcome.skipped,
                "Items with unresolved parents left for the next sync"
            );
        }
        tracing::info!(
            resource = %spec.key,
            processed = outcome.processed,
            inserted = outcome.inserted,
            updated = outcome.updated,
            deleted = outcome.deleted,
            "Reconciled"
        );

        Ok(outcome)
    }

    /// Everything written in one pass, on the transaction's connection
    fn apply<T, M>(
        &self,
        spec: &ResourceSpec,
        items: &[T],
        remote_ids: &HashSet<ItemId>,
        mirror: &M,
        params: &QueryParams,
        conn: &Connection,
    ) -> Result<ReconcileOutcome>
    where
        T: SyncItem,
        M: LocalMirror<T> + ?Sized,
    {
        let mut outcome = ReconcileOutcome {
            processed: items.len(),
            ..Default::default()
        };

        match spec.kind {
            ResourceKind::Hierarchical => {
                let plan = plan_dependency_order(items, items.len() + PASS_SLACK);
                for item in plan.ordered {
                    outcome.tally(mirror.upsert(conn, item)?);
                }
                tracing::debug!(resource = %spec.key, passes = plan.passes, "Dependency passes");
                outcome.skipped = plan.unresolved;
            }
            ResourceKind::Flat => {
                let chunk_size = self.config.upsert_chunk_size.max(1);
                for (index, chunk) in items.chunks(chunk_size).enumerate() {
                    for item in chunk {
                        outcome.tally(mirror.upsert(conn, item)?);
                    }
                    tracing::debug!(resource = %spec.key, chunk = index, size = chunk.len(), "Upserted chunk");
                }
            }
        }

        let filter = IdFilter {
            include_inactive: spec.prune_inactive,
        };
        let local_ids = mirror.list_local_ids(conn, &filter)?;
        let orphans = orphan_ids(&local_ids, remote_ids);

        let chunk_size = spec
            .delete_chunk_size
            .unwrap_or(self.config.delete_chunk_size)
            .max(1);
        for chunk in orphans.chunks(chunk_size) {
            outcome.deleted += mirror.delete_ids(conn, chunk)?;
            tracing::debug!(resource = %spec.key, size = chunk.len(), "Deleted orphan chunk");
        }

        outcome.rows = mirror.snapshot(conn, params)?;
        Ok(outcome)
    }
}

fn dedupe_by_id<T: SyncItem>(resource: &str, items: Vec<T>) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    let before = items.len();
    let unique: Vec<T> = items.into_iter().filter(|item| seen.insert(item.id())).collect();

    if unique.len() != before {
        tracing::warn!(
            resource,
            duplicates = before - unique.len(),
            "Remote returned duplicate ids, keeping first occurrence"
        );
    }
    unique
}
