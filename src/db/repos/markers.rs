use rusqlite::{params, Connection, Row};

use crate::db::models::RecordMarker;
use crate::db::DbPool;
use crate::error::AppError;

/// One record's marker payload for a batch upsert.
#[derive(Debug, Clone)]
pub struct MarkerUpsert {
    pub record_id: String,
    /// The record's own updated-time value, when the record carried one.
    pub updated_at: Option<String>,
}

fn row_to_marker(row: &Row) -> rusqlite::Result<RecordMarker> {
    Ok(RecordMarker {
        app_id: row.get::<_, i64>("app_id")? as u64,
        record_id: row.get("record_id")?,
        updated_at: row.get("updated_at")?,
        last_run_id: row.get("last_run_id")?,
    })
}

/// Upsert markers inside a caller-held transaction, one statement reused
/// across the batch. Existing (app_id, record_id) rows move to the new run.
pub(crate) fn upsert_batch_tx(
    conn: &Connection,
    app_id: u64,
    run_id: &str,
    markers: &[MarkerUpsert],
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO record_markers (app_id, record_id, updated_at, last_run_id)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(app_id, record_id) DO UPDATE SET
            updated_at = excluded.updated_at,
            last_run_id = excluded.last_run_id",
    )?;
    for m in markers {
        stmt.execute(params![app_id as i64, m.record_id, m.updated_at, run_id])?;
    }
    Ok(())
}

pub fn get(pool: &DbPool, app_id: u64, record_id: &str) -> Result<Option<RecordMarker>, AppError> {
    let conn = pool.get()?;
    let mut stmt = conn.prepare(
        "SELECT * FROM record_markers WHERE app_id = ?1 AND record_id = ?2",
    )?;
    let mut rows = stmt.query_map(params![app_id as i64, record_id], row_to_marker)?;
    rows.next().transpose().map_err(AppError::Database)
}

pub fn count_for_app(pool: &DbPool, app_id: u64) -> Result<i64, AppError> {
    let conn = pool.get()?;
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM record_markers WHERE app_id = ?1",
        params![app_id as i64],
        |row| row.get(0),
    )?;
    Ok(count)
}
