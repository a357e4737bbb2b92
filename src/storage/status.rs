//! Per-resource sync bookkeeping

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::types::SyncStatus;

/// Outcome of one synchronize call, as persisted in `sync_state`
#[derive(Debug, Clone, Default)]
pub struct SyncRunRecord<'a> {
    pub run_id: &'a str,
    pub processed: usize,
    pub deleted: usize,
    pub degraded: bool,
    pub error: Option<&'a str>,
}

/// Note that a run has started
pub fn mark_sync_started(conn: &Connection, resource: &str, run_id: &str) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sync_state (resource, last_run_id, last_started_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(resource) DO UPDATE SET
            last_run_id = excluded.last_run_id,
            last_started_at = excluded.last_started_at",
        params![resource, run_id, now],
    )?;
    Ok(())
}

/// Record how a run ended
pub fn record_sync_result(conn: &Connection, resource: &str, run: &SyncRunRecord<'_>) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO sync_state (resource, last_run_id, last_completed_at, last_error,
                                 last_processed, last_deleted, degraded, run_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)
         ON CONFLICT(resource) DO UPDATE SET
            last_run_id = excluded.last_run_id,
            last_completed_at = excluded.last_completed_at,
            last_error = excluded.last_error,
            last_processed = excluded.last_processed,
            last_deleted = excluded.last_deleted,
            degraded = excluded.degraded,
            run_count = run_count + 1",
        params![
            resource,
            run.run_id,
            now,
            run.error,
            run.processed as i64,
            run.deleted as i64,
            run.degraded as i32
        ],
    )?;
    Ok(())
}

fn status_from_row(row: &Row) -> rusqlite::Result<SyncStatus> {
    let parse = |s: Option<String>| {
        s.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
        })
    };
    let degraded: i32 = row.get("degraded")?;

    Ok(SyncStatus {
        resource: row.get("resource")?,
        last_run_id: row.get("last_run_id")?,
        last_started_at: parse(row.get("last_started_at")?),
        last_completed_at: parse(row.get("last_completed_at")?),
        last_error: row.get("last_error")?,
        last_processed: row.get("last_processed")?,
        last_deleted: row.get("last_deleted")?,
        degraded: degraded != 0,
        run_count: row.get("run_count")?,
    })
}

/// Get the sync status of one resource
pub fn get_sync_status(conn: &Connection, resource: &str) -> Result<Option<SyncStatus>> {
    let status = conn
        .query_row(
            "SELECT * FROM sync_state WHERE resource = ?",
            params![resource],
            status_from_row,
        )
        .optional()?;
    Ok(status)
}

/// Sync status of every resource that has ever run
pub fn list_sync_status(conn: &Connection) -> Result<Vec<SyncStatus>> {
    let mut stmt = conn.prepare("SELECT * FROM sync_state ORDER BY resource")?;
    let rows = stmt
        .query_map([], status_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
