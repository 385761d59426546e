use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::EngineError;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Subject id under which FinalMark changes are logged, kept apart from the
/// plain mark record ids.
pub fn final_mark_subject(final_mark_id: &str) -> String {
    format!("final_mark:{final_mark_id}")
}

/// An audit entry as decided by the workflow, before it is chained and stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    /// A mark record id, or [`final_mark_subject`] for FinalMark entries.
    pub mark_record_id: String,
    pub actor_id: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLogEntry {
    pub seq: i64,
    pub id: String,
    pub mark_record_id: String,
    pub actor_id: String,
    pub field: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub reason: Option<String>,
    pub timestamp: String,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainReport {
    pub entries: usize,
    pub intact: bool,
    pub first_broken_seq: Option<i64>,
}

fn chain_hash(
    prev_hash: &str,
    id: &str,
    mark_record_id: &str,
    actor_id: &str,
    field: &str,
    old_value: Option<&str>,
    new_value: Option<&str>,
    reason: Option<&str>,
    timestamp: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    for part in [id, mark_record_id, actor_id, field] {
        hasher.update(part.as_bytes());
        hasher.update([0]);
    }
    for part in [old_value, new_value, reason] {
        match part {
            Some(v) => {
                hasher.update([1]);
                hasher.update(v.as_bytes());
            }
            None => hasher.update([2]),
        }
        hasher.update([0]);
    }
    hasher.update(timestamp.as_bytes());
    hex::encode(hasher.finalize())
}

/// Appends one entry to the chain. Call this on the same connection (and
/// inside the same transaction) as the mutation it records.
pub fn append(conn: &Connection, entry: &NewAuditEntry) -> Result<AuditLogEntry, EngineError> {
    if entry.field.trim().is_empty() {
        return Err(EngineError::validation("audit.field", "must not be empty"));
    }
    let prev_hash: String = conn
        .query_row(
            "SELECT hash FROM audit_log ORDER BY seq DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or_else(|| GENESIS_HASH.to_string());

    let id = Uuid::new_v4().to_string();
    let timestamp = entry.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
    let hash = chain_hash(
        &prev_hash,
        &id,
        &entry.mark_record_id,
        &entry.actor_id,
        &entry.field,
        entry.old_value.as_deref(),
        entry.new_value.as_deref(),
        entry.reason.as_deref(),
        &timestamp,
    );

    conn.execute(
        "INSERT INTO audit_log(id, mark_record_id, actor_id, field, old_value, new_value, reason, created_at, prev_hash, hash)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            entry.mark_record_id,
            entry.actor_id,
            entry.field,
            entry.old_value,
            entry.new_value,
            entry.reason,
            timestamp,
            prev_hash,
            hash
        ],
    )?;
    let seq = conn.last_insert_rowid();

    Ok(AuditLogEntry {
        seq,
        id,
        mark_record_id: entry.mark_record_id.clone(),
        actor_id: entry.actor_id.clone(),
        field: entry.field.clone(),
        old_value: entry.old_value.clone(),
        new_value: entry.new_value.clone(),
        reason: entry.reason.clone(),
        timestamp,
        prev_hash,
        hash,
    })
}

const SELECT_COLUMNS: &str =
    "seq, id, mark_record_id, actor_id, field, old_value, new_value, reason, created_at, prev_hash, hash";

fn row_to_entry(r: &rusqlite::Row<'_>) -> rusqlite::Result<AuditLogEntry> {
    Ok(AuditLogEntry {
        seq: r.get(0)?,
        id: r.get(1)?,
        mark_record_id: r.get(2)?,
        actor_id: r.get(3)?,
        field: r.get(4)?,
        old_value: r.get(5)?,
        new_value: r.get(6)?,
        reason: r.get(7)?,
        timestamp: r.get(8)?,
        prev_hash: r.get(9)?,
        hash: r.get(10)?,
    })
}

pub fn list_for_record(
    conn: &Connection,
    mark_record_id: &str,
) -> Result<Vec<AuditLogEntry>, EngineError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM audit_log WHERE mark_record_id = ? ORDER BY seq");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([mark_record_id], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Walks the whole log and recomputes every link.
pub fn verify_chain(conn: &Connection) -> Result<ChainReport, EngineError> {
    let sql = format!("SELECT {SELECT_COLUMNS} FROM audit_log ORDER BY seq");
    let mut stmt = conn.prepare(&sql)?;
    let entries = stmt
        .query_map([], row_to_entry)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut prev = GENESIS_HASH.to_string();
    for e in &entries {
        let expected = chain_hash(
            &prev,
            &e.id,
            &e.mark_record_id,
            &e.actor_id,
            &e.field,
            e.old_value.as_deref(),
            e.new_value.as_deref(),
            e.reason.as_deref(),
            &e.timestamp,
        );
        if e.prev_hash != prev || e.hash != expected {
            return Ok(ChainReport {
                entries: entries.len(),
                intact: false,
                first_broken_seq: Some(e.seq),
            });
        }
        prev = e.hash.clone();
    }
    Ok(ChainReport {
        entries: entries.len(),
        intact: true,
        first_broken_seq: None,
    })
}
