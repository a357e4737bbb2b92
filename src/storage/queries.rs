//! Database queries for the local mirror

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::{Result, SyncError};
use crate::types::*;

/// Upper bound on bound parameters per statement
const MAX_SQL_PARAMS: usize = 500;

const RECORD_COLUMNS: &str = "resource, id, parent_id, payload, content_hash, active, synced_at";

/// Parse a mirror record from a database row
pub fn record_from_row(row: &Row) -> rusqlite::Result<LocalRecord> {
    let payload_str: String = row.get("payload")?;
    let active: i32 = row.get("active")?;
    let synced_at: String = row.get("synced_at")?;

    Ok(LocalRecord {
        resource: row.get("resource")?,
        id: row.get("id")?,
        parent_id: row.get("parent_id")?,
        payload: serde_json::from_str(&payload_str).unwrap_or_else(|_| Value::Object(Map::new())),
        content_hash: row.get("content_hash")?,
        active: active != 0,
        synced_at: DateTime::parse_from_rfc3339(&synced_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
    })
}

/// Compute SHA256 hash of a payload for change detection
///
/// `serde_json::Map` iterates in key order, so equal payloads hash equally.
pub fn compute_payload_hash(parent_id: Option<ItemId>, payload: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_id.unwrap_or(0).to_le_bytes());
    hasher.update(Value::Object(payload.clone()).to_string().as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

/// Ids currently mirrored for a resource
pub fn find_ids_by_filter(conn: &Connection, resource: &str, filter: &IdFilter) -> Result<Vec<ItemId>> {
    let sql = if filter.include_inactive {
        "SELECT id FROM mirror_records WHERE resource = ? ORDER BY id"
    } else {
        "SELECT id FROM mirror_records WHERE resource = ? AND active = 1 ORDER BY id"
    };

    let mut stmt = conn.prepare_cached(sql)?;
    let ids = stmt
        .query_map(params![resource], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<ItemId>>>()?;

    Ok(ids)
}

/// Get a single record, active or not
pub fn get_record(conn: &Connection, resource: &str, id: ItemId) -> Result<Option<LocalRecord>> {
    let sql = format!(
        "SELECT {} FROM mirror_records WHERE resource = ? AND id = ?",
        RECORD_COLUMNS
    );
    let record = conn
        .query_row(&sql, params![resource, id], record_from_row)
        .optional()?;
    Ok(record)
}

/// Insert or update a mirrored item.
///
/// Rows whose parent and payload hash are unchanged (and still active) are
/// left alone, which keeps repeated syncs of an unchanged catalog write-free.
pub fn upsert_record(conn: &Connection, resource: &str, item: &RemoteItem) -> Result<UpsertOutcome> {
    let parent_id = item.parent_id();
    let hash = compute_payload_hash(parent_id, &item.payload);

    let existing: Option<(String, i32)> = conn
        .query_row(
            "SELECT content_hash, active FROM mirror_records WHERE resource = ? AND id = ?",
            params![resource, item.id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((existing_hash, active)) = &existing {
        if *existing_hash == hash && *active != 0 {
            return Ok(UpsertOutcome::Unchanged);
        }
    }

    let payload = serde_json::to_string(&item.payload)?;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO mirror_records (resource, id, parent_id, payload, content_hash, active, synced_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)
         ON CONFLICT(resource, id) DO UPDATE SET
            parent_id = excluded.parent_id,
            payload = excluded.payload,
            content_hash = excluded.content_hash,
            active = 1,
            synced_at = excluded.synced_at",
        params![resource, item.id, parent_id, payload, hash, now],
    )?;

    Ok(if existing.is_some() {
        UpsertOutcome::Updated
    } else {
        UpsertOutcome::Inserted
    })
}

/// Delete records by id.
///
/// Every id must exist; if any is missing nothing is deleted and the batch
/// fails with `SyncError::NotFound` naming the missing ids.
pub fn delete_records(conn: &Connection, resource: &str, ids: &[ItemId]) -> Result<usize> {
    if ids.is_empty() {
        return Ok(0);
    }

    let mut found = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(MAX_SQL_PARAMS) {
        let sql = format!(
            "SELECT id FROM mirror_records WHERE resource = ? AND id IN ({})",
            placeholders(chunk.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(id_params(resource, chunk)), |row| {
                row.get::<_, ItemId>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        found.extend(rows);
    }

    let found: std::collections::HashSet<ItemId> = found.into_iter().collect();
    let mut missing: Vec<ItemId> = ids.iter().copied().filter(|id| !found.contains(id)).collect();
    if !missing.is_empty() {
        missing.sort_unstable();
        missing.dedup();
        return Err(SyncError::NotFound {
            resource: resource.to_string(),
            ids: missing,
        });
    }

    let mut deleted = 0;
    for chunk in ids.chunks(MAX_SQL_PARAMS) {
        let sql = format!(
            "DELETE FROM mirror_records WHERE resource = ? AND id IN ({})",
            placeholders(chunk.len())
        );
        deleted += conn.execute(&sql, rusqlite::params_from_iter(id_params(resource, chunk)))?;
    }

    Ok(deleted)
}

/// Mark a record active or soft-deleted
pub fn set_record_active(conn: &Connection, resource: &str, id: ItemId, active: bool) -> Result<()> {
    let affected = conn.execute(
        "UPDATE mirror_records SET active = ? WHERE resource = ? AND id = ?",
        params![active as i32, resource, id],
    )?;

    if affected == 0 {
        return Err(SyncError::NotFound {
            resource: resource.to_string(),
            ids: vec![id],
        });
    }
    Ok(())
}

/// List records with filtering and pagination, ordered by id
pub fn list_records(conn: &Connection, resource: &str, query: &QueryParams) -> Result<Vec<LocalRecord>> {
    let mut sql = format!("SELECT {} FROM mirror_records", RECORD_COLUMNS);

    let mut conditions = vec!["resource = ?".to_string()];
    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(resource.to_string())];

    if !query.include_inactive {
        conditions.push("active = 1".to_string());
    }

    match query.parent_id {
        Some(0) => conditions.push("parent_id IS NULL".to_string()),
        Some(parent) => {
            conditions.push("parent_id = ?".to_string());
            params.push(Box::new(parent));
        }
        None => {}
    }

    if let Some(ref search) = query.search {
        if !search.trim().is_empty() {
            conditions.push("payload LIKE ? ESCAPE '\\'".to_string());
            params.push(Box::new(format!("%{}%", escape_like(search.trim()))));
        }
    }

    sql.push_str(" WHERE ");
    sql.push_str(&conditions.join(" AND "));
    sql.push_str(" ORDER BY id ASC");

    let (limit, offset) = query.limit_offset();
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

    let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(param_refs.as_slice(), record_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    Ok(records)
}

/// Count mirrored records of a resource
pub fn count_records(conn: &Connection, resource: &str, include_inactive: bool) -> Result<i64> {
    let sql = if include_inactive {
        "SELECT COUNT(*) FROM mirror_records WHERE resource = ?"
    } else {
        "SELECT COUNT(*) FROM mirror_records WHERE resource = ? AND active = 1"
    };
    let count = conn.query_row(sql, params![resource], |row| row.get(0))?;
    Ok(count)
}

/// Escape LIKE wildcards so user text matches literally
fn escape_like(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn id_params(resource: &str, ids: &[ItemId]) -> Vec<rusqlite::types::Value> {
    let mut values = Vec::with_capacity(ids.len() + 1);
    values.push(rusqlite::types::Value::Text(resource.to_string()));
    values.extend(ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));
    values
}
