//! Background periodic sync of every registered resource

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::service::SyncService;
use crate::error::{Result, SyncError};
use crate::types::QueryParams;

/// Commands for the sync scheduler
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Synchronize one resource now
    SyncNow(String),
    /// Synchronize every registered resource now
    SyncAll,
    /// Stop the scheduler
    Stop,
}

/// Background scheduler driving a `SyncService`
pub struct SyncScheduler {
    sender: mpsc::Sender<SchedulerCommand>,
    handle: JoinHandle<()>,
}

impl SyncScheduler {
    /// Start the scheduler; the first full sync runs immediately
    pub fn start(service: Arc<SyncService>, period: Duration) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SchedulerCommand>(100);

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(SchedulerCommand::SyncNow(key)) => {
                                Self::sync_one(&service, &key).await;
                            }
                            Some(SchedulerCommand::SyncAll) => {
                                Self::sync_all(&service).await;
                            }
                            Some(SchedulerCommand::Stop) | None => break,
                        }
                    }
                    _ = ticker.tick() => {
                        Self::sync_all(&service).await;
                    }
                }
            }

            tracing::info!("Sync scheduler stopped");
        });

        Self { sender, handle }
    }

    async fn sync_one(service: &SyncService, key: &str) {
        let response = service.synchronize(key, &QueryParams::default()).await;
        if !response.success {
            tracing::warn!(resource = key, message = %response.message, "Scheduled sync failed");
        }
    }

    async fn sync_all(service: &SyncService) {
        let keys = service.resources();
        let params = QueryParams::default();
        let responses = join_all(keys.iter().map(|key| service.synchronize(key, &params))).await;

        let failed = responses.iter().filter(|r| !r.success).count();
        let degraded = responses.iter().filter(|r| r.degraded).count();
        tracing::info!(resources = keys.len(), failed, degraded, "Scheduled sync finished");

        if let Err(err) = service.storage().checkpoint() {
            tracing::warn!(error = %err, "WAL checkpoint failed");
        }
    }

    /// Queue a sync of one resource
    pub async fn sync_now(&self, key: impl Into<String>) -> Result<()> {
        self.send(SchedulerCommand::SyncNow(key.into())).await
    }

    /// Queue a sync of every resource
    pub async fn sync_all_now(&self) -> Result<()> {
        self.send(SchedulerCommand::SyncAll).await
    }

    /// Stop the scheduler and wait for the current run to finish
    pub async fn stop(self) -> Result<()> {
        self.send(SchedulerCommand::Stop).await?;
        self.handle
            .await
            .map_err(|e| SyncError::Internal(format!("scheduler task failed: {}", e)))
    }

    async fn send(&self, cmd: SchedulerCommand) -> Result<()> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SyncError::Internal("sync scheduler is not running".to_string()))
    }
}
