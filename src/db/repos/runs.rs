use rusqlite::{params, Row};

use crate::db::models::{BackupRun, RunFilter, RunKind, RunStatus, RunTrigger, UpdateBackupRun};
use crate::db::repos::{apps, markers};
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_run(row: &Row) -> rusqlite::Result<BackupRun> {
    Ok(BackupRun {
        id: row.get("id")?,
        app_id: row.get::<_, i64>("app_id")? as u64,
        app_name: row.get("app_name")?,
        kind: row
            .get::<_, String>("kind")?
            .parse()
            .unwrap_or(RunKind::Full),
        triggered_by: row
            .get::<_, String>("triggered_by")?
            .parse()
            .unwrap_or(RunTrigger::Manual),
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        duration_ms: row.get("duration_ms")?,
        record_count: row.get::<_, Option<i64>>("record_count")?.unwrap_or(0),
        archive_path: row.get("archive_path")?,
        archive_bytes: row.get("archive_bytes")?,
        compression_ratio: row.get("compression_ratio")?,
        status: row
            .get::<_, String>("status")?
            .parse()
            .unwrap_or(RunStatus::Failure),
        error_detail: row.get("error_detail")?,
        api_requests: row.get::<_, Option<i64>>("api_requests")?.unwrap_or(0),
        retries: row.get::<_, Option<i64>>("retries")?.unwrap_or(0),
        diff_baseline: row.get("diff_baseline")?,
        host: row.get("host")?,
        client_version: row.get("client_version")?,
        remarks: row.get("remarks")?,
    })
}

/// Open a new run with status `running`. The row exists before any remote
/// call so a crash still leaves an auditable trace.
pub fn create(
    pool: &DbPool,
    app_id: u64,
    app_name: Option<&str>,
    kind: RunKind,
    trigger: RunTrigger,
    diff_baseline: Option<&str>,
) -> Result<BackupRun, AppError> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    let host = whoami::fallible::hostname().unwrap_or_else(|_| "unknown".into());

    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO backup_runs
         (id, app_id, app_name, kind, triggered_by, started_at, status,
          record_count, api_requests, retries, diff_baseline, host, client_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'running', 0, 0, 0, ?7, ?8, ?9)",
        params![
            id,
            app_id as i64,
            app_name,
            kind.as_str(),
            trigger.as_str(),
            now,
            diff_baseline,
            host,
            env!("CARGO_PKG_VERSION"),
        ],
    )?;

    get_by_id(pool, &id)
}

pub fn get_by_id(pool: &DbPool, id: &str) -> Result<BackupRun, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM backup_runs WHERE id = ?1",
        params![id],
        row_to_run,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Backup run {id}")),
        other => AppError::Database(other),
    })
}

pub fn update(pool: &DbPool, id: &str, input: UpdateBackupRun) -> Result<(), AppError> {
    let conn = pool.get()?;
    apply_update(&conn, id, &input)?;
    Ok(())
}

fn apply_update(conn: &rusqlite::Connection, id: &str, input: &UpdateBackupRun) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE backup_runs SET
            app_name = COALESCE(?1, app_name),
            status = COALESCE(?2, status),
            finished_at = COALESCE(?3, finished_at),
            duration_ms = COALESCE(?4, duration_ms),
            record_count = COALESCE(?5, record_count),
            archive_path = COALESCE(?6, archive_path),
            archive_bytes = COALESCE(?7, archive_bytes),
            compression_ratio = COALESCE(?8, compression_ratio),
            error_detail = COALESCE(?9, error_detail),
            api_requests = COALESCE(?10, api_requests),
            retries = COALESCE(?11, retries),
            diff_baseline = COALESCE(?12, diff_baseline),
            remarks = COALESCE(?13, remarks)
         WHERE id = ?14",
        params![
            input.app_name,
            input.status.map(|s| s.as_str()),
            input.finished_at,
            input.duration_ms,
            input.record_count,
            input.archive_path,
            input.archive_bytes,
            input.compression_ratio,
            input.error_detail,
            input.api_requests,
            input.retries,
            input.diff_baseline,
            input.remarks,
            id,
        ],
    )
}

/// History, newest first. Every filter field is optional.
pub fn history(pool: &DbPool, filter: &RunFilter) -> Result<Vec<BackupRun>, AppError> {
    let mut sql = String::from("SELECT * FROM backup_runs");
    let mut clauses: Vec<String> = Vec::new();
    let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(app_id) = filter.app_id {
        args.push(Box::new(app_id as i64));
        clauses.push(format!("app_id = ?{}", args.len()));
    }
    if let Some(kind) = filter.kind {
        args.push(Box::new(kind.as_str()));
        clauses.push(format!("kind = ?{}", args.len()));
    }
    if let Some(status) = filter.status {
        args.push(Box::new(status.as_str()));
        clauses.push(format!("status = ?{}", args.len()));
    }
    if let Some(from) = &filter.from {
        args.push(Box::new(from.clone()));
        clauses.push(format!("started_at >= ?{}", args.len()));
    }
    if let Some(to) = &filter.to {
        args.push(Box::new(to.clone()));
        clauses.push(format!("started_at < ?{}", args.len()));
    }
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    args.push(Box::new(filter.limit.unwrap_or(50)));
    sql.push_str(&format!(" ORDER BY started_at DESC LIMIT ?{}", args.len()));

    let conn = pool.get()?;
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(rusqlite::params_from_iter(args), row_to_run)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

/// Finalize a successful backup atomically: run fields, the app baseline
/// and the per-record markers all land in one transaction.
pub fn finalize_success(
    pool: &DbPool,
    run_id: &str,
    app_id: u64,
    input: UpdateBackupRun,
    baseline_at: &str,
    advance_full: bool,
    record_markers: &[markers::MarkerUpsert],
) -> Result<(), AppError> {
    let mut conn = pool.get()?;
    let tx = conn.transaction()?;

    apply_update(&tx, run_id, &input)?;
    apps::advance_baseline_tx(&tx, app_id, baseline_at, advance_full)?;
    markers::upsert_batch_tx(&tx, app_id, run_id, record_markers)?;

    tx.commit()?;
    Ok(())
}

/// Delete a run and every marker that references it in one transaction.
/// Returns the archive path of the deleted run (if any) so the caller can
/// remove the file too.
pub fn delete(pool: &DbPool, id: &str) -> Result<Option<String>, AppError> {
    let run = get_by_id(pool, id)?;

    let mut conn = pool.get()?;
    let tx = conn.transaction()?;
    tx.execute(
        "DELETE FROM record_markers WHERE last_run_id = ?1",
        params![id],
    )?;
    tx.execute("DELETE FROM backup_runs WHERE id = ?1", params![id])?;
    tx.commit()?;

    Ok(run.archive_path)
}

/// Mark runs still `running` from a previous process as failed. Called once
/// at startup; a crashed process can never finalize its own rows.
pub fn fail_stale_running(pool: &DbPool) -> Result<usize, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let n = conn.execute(
        "UPDATE backup_runs SET status = 'failure',
            finished_at = ?1,
            error_detail = COALESCE(error_detail, 'interrupted: process exited before the run finished')
         WHERE status = 'running'",
        params![now],
    )?;
    Ok(n)
}
