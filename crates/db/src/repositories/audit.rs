use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use dealdesk_core::audit::{AuditAction, AuditEntry};

use super::{decode_timestamp, encode_timestamp, RepositoryError};
use crate::DbPool;

/// Appends inside the caller's transaction so the entry commits or rolls
/// back with the change it describes.
pub(crate) async fn insert_entry(
    conn: &mut SqliteConnection,
    entry: &AuditEntry,
) -> Result<(), RepositoryError> {
    let metadata_json = serde_json::to_string(&entry.metadata)
        .map_err(|error| RepositoryError::Decode(format!("audit metadata: {error}")))?;

    sqlx::query(
        "INSERT INTO audit_entry (id, action, entity_id, actor_id, metadata_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&entry.entry_id)
    .bind(entry.action.as_str())
    .bind(&entry.entity_id)
    .bind(&entry.actor_id)
    .bind(metadata_json)
    .bind(encode_timestamp(&entry.timestamp))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub(crate) async fn entries_for(
    pool: &DbPool,
    entity_id: &str,
) -> Result<Vec<AuditEntry>, RepositoryError> {
    let rows = sqlx::query(
        "SELECT id, action, entity_id, actor_id, metadata_json, created_at
         FROM audit_entry
         WHERE entity_id = ?
         ORDER BY seq ASC",
    )
    .bind(entity_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(entry_from_row).collect()
}

fn entry_from_row(row: &SqliteRow) -> Result<AuditEntry, RepositoryError> {
    let action_raw: String = row.try_get("action")?;
    let action = AuditAction::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown audit action `{action_raw}`")))?;
    let metadata_json: String = row.try_get("metadata_json")?;
    let metadata: BTreeMap<String, String> = serde_json::from_str(&metadata_json)
        .map_err(|error| RepositoryError::Decode(format!("audit metadata: {error}")))?;
    let created_at: String = row.try_get("created_at")?;

    Ok(AuditEntry {
        entry_id: row.try_get("id")?,
        action,
        entity_id: row.try_get("entity_id")?,
        actor_id: row.try_get("actor_id")?,
        metadata,
        timestamp: decode_timestamp("created_at", &created_at)?,
    })
}
