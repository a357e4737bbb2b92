//! Synchronization entrypoint used by business-entity services

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;

use super::coordinator::SyncCoordinator;
use super::engine::{ReconcileOutcome, ReconciliationEngine};
use super::fallback::{Guarded, NetworkFallbackPolicy};
use super::mirror::{LocalMirror, SqliteMirror};
use super::remote::RemoteSource;
use crate::error::{Result, SyncError};
use crate::storage::status::{mark_sync_started, record_sync_result, SyncRunRecord};
use crate::storage::Storage;
use crate::types::{QueryParams, ResourceSpec, SyncConfig, SyncResponse};

/// Synchronizes registered resources against one remote catalog
pub struct SyncService {
    storage: Storage,
    coordinator: Arc<SyncCoordinator>,
    remote: Arc<dyn RemoteSource>,
    engine: ReconciliationEngine,
    fallback: NetworkFallbackPolicy,
    resources: RwLock<HashMap<String, ResourceSpec>>,
}

impl SyncService {
    /// Create a service with the default resource registry
    pub fn new(
        storage: Storage,
        coordinator: Arc<SyncCoordinator>,
        remote: Arc<dyn RemoteSource>,
        config: SyncConfig,
    ) -> Self {
        let resources = ResourceSpec::defaults()
            .into_iter()
            .map(|spec| (spec.key.clone(), spec))
            .collect();
        let storage = storage.with_retry_config(config.retry.clone());

        Self {
            engine: ReconciliationEngine::new(storage.clone(), config.clone()),
            fallback: NetworkFallbackPolicy::from_config(&config),
            storage,
            coordinator,
            remote,
            resources: RwLock::new(resources),
        }
    }

    /// Register (or replace) a resource
    pub fn register(&self, spec: ResourceSpec) {
        self.resources.write().insert(spec.key.clone(), spec);
    }

    pub fn resource(&self, key: &str) -> Option<ResourceSpec> {
        self.resources.read().get(key).cloned()
    }

    /// Registered resource keys, sorted
    pub fn resources(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.resources.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Bring the mirror of `key` in line with the remote and return its rows.
    ///
    /// Never fails: an unreachable remote yields the cached rows flagged
    /// `degraded`, any other failure yields `success: false` with the error.
    pub async fn synchronize(&self, key: &str, params: &QueryParams) -> SyncResponse {
        let run_id = Uuid::new_v4().to_string();

        let Some(spec) = self.resource(key) else {
            let err = SyncError::UnknownResource(key.to_string());
            tracing::error!(resource = key, run_id = %run_id, "Sync requested for unknown resource");
            return failure_response(key, run_id, &err);
        };

        let guarded = self
            .coordinator
            .execute(key, || self.run_guarded(&spec, params, &run_id))
            .await;

        match guarded {
            Ok(Guarded::Fresh(outcome)) => {
                tracing::info!(
                    resource = key,
                    run_id = %run_id,
                    count = outcome.rows.len(),
                    deleted = outcome.deleted,
                    "Sync completed"
                );
                SyncResponse {
                    success: true,
                    count: outcome.rows.len(),
                    message: format!(
                        "Synchronized {}: {} inserted, {} updated, {} deleted",
                        key, outcome.inserted, outcome.updated, outcome.deleted
                    ),
                    degraded: false,
                    error: None,
                    deleted: outcome.deleted,
                    rows: outcome.rows,
                    run_id,
                }
            }
            Ok(Guarded::Degraded { value, cause }) => SyncResponse {
                success: true,
                count: value.rows.len(),
                message: format!(
                    "Remote catalog unreachable; serving {} cached {} from the local mirror",
                    value.rows.len(),
                    key
                ),
                degraded: true,
                error: Some(cause.to_string()),
                deleted: 0,
                rows: value.rows,
                run_id,
            },
            Err(err) => {
                tracing::error!(resource = key, run_id = %run_id, error = %err, "Sync failed");
                failure_response(key, run_id, &err)
            }
        }
    }

    /// One guarded reconcile pass plus its bookkeeping; runs inside the key's lane
    async fn run_guarded(
        &self,
        spec: &ResourceSpec,
        params: &QueryParams,
        run_id: &str,
    ) -> Result<Guarded<ReconcileOutcome>> {
        tracing::info!(resource = %spec.key, run_id, "Sync started");
        self.record(&spec.key, |conn| mark_sync_started(conn, &spec.key, run_id))
            .await;

        let mirror = SqliteMirror::new(spec.key.clone());
        let result = self
            .fallback
            .guard(
                self.engine.reconcile(spec, &*self.remote, &mirror, params),
                || {
                    self.storage
                        .with_connection(|conn| mirror.snapshot(conn, params))
                        .map(ReconcileOutcome::snapshot)
                },
            )
            .await;

        let error = match &result {
            Ok(Guarded::Degraded { cause, .. }) => Some(cause.to_string()),
            Err(err) => Some(err.to_string()),
            Ok(Guarded::Fresh(_)) => None,
        };
        let run = match &result {
            Ok(Guarded::Fresh(outcome)) => SyncRunRecord {
                run_id,
                processed: outcome.processed,
                deleted: outcome.deleted,
                ..Default::default()
            },
            Ok(Guarded::Degraded { .. }) => SyncRunRecord {
                run_id,
                degraded: true,
                error: error.as_deref(),
                ..Default::default()
            },
            Err(_) => SyncRunRecord {
                run_id,
                error: error.as_deref(),
                ..Default::default()
            },
        };
        self.record(&spec.key, |conn| record_sync_result(conn, &spec.key, &run))
            .await;

        result
    }

    /// Best-effort status write; a failure here never fails the sync
    async fn record<F>(&self, resource: &str, mut write: F)
    where
        F: FnMut(&rusqlite::Connection) -> Result<()>,
    {
        let max_attempts = self.storage.retry_policy().config().max_attempts;
        let result = self
            .storage
            .with_retry(max_attempts, || self.storage.with_connection(&mut write))
            .await;
        if let Err(err) = result {
            tracing::warn!(resource, error = %err, "Could not record sync status");
        }
    }
}

fn failure_response(key: &str, run_id: String, err: &SyncError) -> SyncResponse {
    SyncResponse {
        success: false,
        count: 0,
        rows: Vec::new(),
        message: format!("Failed to synchronize {}", key),
        degraded: false,
        error: Some(err.to_string()),
        deleted: 0,
        run_id,
    }
}
