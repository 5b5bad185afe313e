//! Append-only record of row-level import failures.
//!
//! Entries carry the session id next to the job id, so they stay queryable
//! after the job row is gone (`job_id` is set to NULL on delete). The
//! pipeline only ever appends; bulk deletion belongs to retention cleanup.

use crate::error::{truncate_chars, RowError};
use chrono::Utc;
use common::model::import_error::ImportErrorEntry;
use rusqlite::{params, Connection};

/// Longest raw source excerpt kept per error.
pub const MAX_RAW_CHARS: usize = 1000;
/// Upper bound on entries returned by a single query.
pub const MAX_LIST_LIMIT: usize = 1000;

pub fn record(
    conn: &Connection,
    job_id: Option<i64>,
    session_id: &str,
    row_index: i64,
    message: &str,
    raw_text: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO import_errors (job_id, session_id, row_index, message, raw_data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job_id,
            session_id,
            row_index,
            message,
            raw_text.map(|raw| truncate_chars(raw, MAX_RAW_CHARS)),
            Utc::now(),
        ],
    )?;
    Ok(())
}

pub fn record_row_error(
    conn: &Connection,
    job_id: i64,
    session_id: &str,
    error: &RowError,
) -> rusqlite::Result<()> {
    record(
        conn,
        Some(job_id),
        session_id,
        error.row_index,
        &format!("{}: {}", error.kind.label(), error.message),
        error.raw.as_deref(),
    )
}

/// Most recent entries first. `limit` is clamped to `MAX_LIST_LIMIT`.
pub fn list_recent(
    conn: &Connection,
    session_id: &str,
    limit: usize,
) -> rusqlite::Result<Vec<ImportErrorEntry>> {
    let limit = limit.min(MAX_LIST_LIMIT) as i64;
    let mut stmt = conn.prepare(
        "SELECT session_id, row_index, message, raw_data, created_at
         FROM import_errors
         WHERE session_id = ?1
         ORDER BY created_at DESC, id DESC
         LIMIT ?2",
    )?;
    let entries = stmt
        .query_map(params![session_id, limit], |row| {
            Ok(ImportErrorEntry {
                session_id: row.get(0)?,
                row_index: row.get(1)?,
                message: row.get(2)?,
                raw_data: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

pub fn count(conn: &Connection, session_id: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM import_errors WHERE session_id = ?1",
        params![session_id],
        |row| row.get(0),
    )
}

/// Bulk removal used by retention cleanup only.
pub(crate) fn delete_session(conn: &Connection, session_id: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM import_errors WHERE session_id = ?1",
        params![session_id],
    )
}
