use rusqlite::Connection;

use crate::error::AppError;

/// Run the consolidated, idempotent schema migration.
pub fn run(conn: &Connection) -> Result<(), AppError> {
    tracing::debug!("Running database migrations");

    conn.execute_batch(SCHEMA)?;

    tracing::debug!("Database migrations complete");
    Ok(())
}

const SCHEMA: &str = r#"

-- ============================================================================
-- Backup runs — one row per full/differential backup or restore invocation
-- ============================================================================

CREATE TABLE IF NOT EXISTS backup_runs (
    id                 TEXT PRIMARY KEY,
    app_id             INTEGER NOT NULL,
    app_name           TEXT,
    kind               TEXT NOT NULL CHECK(kind IN ('full', 'differential', 'restore')),
    triggered_by       TEXT NOT NULL CHECK(triggered_by IN ('manual', 'scheduled')),
    started_at         TEXT NOT NULL,
    finished_at        TEXT,
    duration_ms        INTEGER,
    record_count       INTEGER NOT NULL DEFAULT 0,
    archive_path       TEXT,
    archive_bytes      INTEGER,
    compression_ratio  REAL,
    status             TEXT NOT NULL DEFAULT 'running'
                       CHECK(status IN ('running', 'success', 'partial_success', 'failure')),
    error_detail       TEXT,
    api_requests       INTEGER NOT NULL DEFAULT 0,
    retries            INTEGER NOT NULL DEFAULT 0,
    diff_baseline      TEXT,
    host               TEXT,
    client_version     TEXT,
    remarks            TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_app     ON backup_runs(app_id);
CREATE INDEX IF NOT EXISTS idx_runs_started ON backup_runs(started_at DESC);
CREATE INDEX IF NOT EXISTS idx_runs_status  ON backup_runs(status);

-- ============================================================================
-- Tracked apps — one row per kintone app that has ever been backed up
-- ============================================================================

CREATE TABLE IF NOT EXISTS tracked_apps (
    app_id              INTEGER PRIMARY KEY,
    name                TEXT NOT NULL,
    active              INTEGER NOT NULL DEFAULT 1,
    last_backup_at      TEXT,
    last_full_backup_at TEXT,
    field_schema        TEXT,
    updated_at          TEXT NOT NULL
);

-- ============================================================================
-- Record markers — last known change time per (app, record)
-- ============================================================================

CREATE TABLE IF NOT EXISTS record_markers (
    app_id      INTEGER NOT NULL,
    record_id   TEXT NOT NULL,
    updated_at  TEXT,
    last_run_id TEXT NOT NULL,
    UNIQUE(app_id, record_id)
);
CREATE INDEX IF NOT EXISTS idx_markers_app     ON record_markers(app_id);
CREATE INDEX IF NOT EXISTS idx_markers_updated ON record_markers(updated_at);
"#;
