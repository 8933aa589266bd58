use rusqlite::{params, Connection, Row};

use crate::db::models::TrackedApp;
use crate::db::DbPool;
use crate::error::AppError;

fn row_to_app(row: &Row) -> rusqlite::Result<TrackedApp> {
    Ok(TrackedApp {
        app_id: row.get::<_, i64>("app_id")? as u64,
        name: row.get("name")?,
        active: row.get("active")?,
        last_backup_at: row.get("last_backup_at")?,
        last_full_backup_at: row.get("last_full_backup_at")?,
        field_schema: row.get("field_schema")?,
        updated_at: row.get("updated_at")?,
    })
}

/// Register or refresh an app. Name and schema snapshot are refreshed;
/// baselines and the active flag are left alone.
pub fn upsert(
    pool: &DbPool,
    app_id: u64,
    name: &str,
    field_schema: Option<&str>,
) -> Result<TrackedApp, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    conn.execute(
        "INSERT INTO tracked_apps (app_id, name, active, field_schema, updated_at)
         VALUES (?1, ?2, 1, ?3, ?4)
         ON CONFLICT(app_id) DO UPDATE SET
            name = excluded.name,
            field_schema = COALESCE(excluded.field_schema, field_schema),
            updated_at = excluded.updated_at",
        params![app_id as i64, name, field_schema, now],
    )?;
    get(pool, app_id)
}

pub fn get(pool: &DbPool, app_id: u64) -> Result<TrackedApp, AppError> {
    let conn = pool.get()?;
    conn.query_row(
        "SELECT * FROM tracked_apps WHERE app_id = ?1",
        params![app_id as i64],
        row_to_app,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => AppError::NotFound(format!("Tracked app {app_id}")),
        other => AppError::Database(other),
    })
}

pub fn try_get(pool: &DbPool, app_id: u64) -> Result<Option<TrackedApp>, AppError> {
    match get(pool, app_id) {
        Ok(app) => Ok(Some(app)),
        Err(AppError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn list(pool: &DbPool, active_only: bool) -> Result<Vec<TrackedApp>, AppError> {
    let conn = pool.get()?;
    let sql = if active_only {
        "SELECT * FROM tracked_apps WHERE active = 1 ORDER BY name ASC"
    } else {
        "SELECT * FROM tracked_apps ORDER BY name ASC"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map([], row_to_app)?;
    rows.collect::<Result<Vec<_>, _>>().map_err(AppError::Database)
}

pub fn set_active(pool: &DbPool, app_id: u64, active: bool) -> Result<bool, AppError> {
    let now = chrono::Utc::now().to_rfc3339();
    let conn = pool.get()?;
    let rows = conn.execute(
        "UPDATE tracked_apps SET active = ?1, updated_at = ?2 WHERE app_id = ?3",
        params![active, now, app_id as i64],
    )?;
    Ok(rows > 0)
}

/// Advance the differential baseline inside a caller-held transaction.
/// `last_full_backup_at` only moves for full backups.
pub(crate) fn advance_baseline_tx(
    conn: &Connection,
    app_id: u64,
    baseline_at: &str,
    advance_full: bool,
) -> rusqlite::Result<()> {
    let now = chrono::Utc::now().to_rfc3339();
    if advance_full {
        conn.execute(
            "UPDATE tracked_apps SET last_backup_at = ?1, last_full_backup_at = ?1,
                updated_at = ?2 WHERE app_id = ?3",
            params![baseline_at, now, app_id as i64],
        )?;
    } else {
        conn.execute(
            "UPDATE tracked_apps SET last_backup_at = ?1, updated_at = ?2 WHERE app_id = ?3",
            params![baseline_at, now, app_id as i64],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_test_db;

    #[test]
    fn test_upsert_refreshes_without_clobbering() {
        let pool = init_test_db().unwrap();

        let app = upsert(&pool, 10, "Customers", Some("{\"f\":1}")).unwrap();
        assert_eq!(app.app_id, 10);
        assert_eq!(app.name, "Customers");
        assert!(app.active);
        assert!(app.last_backup_at.is_none());

        // Baseline set out of band, then a re-upsert with no schema must not
        // erase either value.
        {
            let conn = pool.get().unwrap();
            advance_baseline_tx(&conn, 10, "2026-02-01T00:00:00+00:00", true).unwrap();
        }
        let app = upsert(&pool, 10, "Customers v2", None).unwrap();
        assert_eq!(app.name, "Customers v2");
        assert_eq!(app.field_schema.as_deref(), Some("{\"f\":1}"));
        assert_eq!(
            app.last_backup_at.as_deref(),
            Some("2026-02-01T00:00:00+00:00")
        );
        assert_eq!(
            app.last_full_backup_at.as_deref(),
            Some("2026-02-01T00:00:00+00:00")
        );
    }

    #[test]
    fn test_baseline_full_vs_differential() {
        let pool = init_test_db().unwrap();
        upsert(&pool, 5, "Orders", None).unwrap();

        let conn = pool.get().unwrap();
        advance_baseline_tx(&conn, 5, "2026-03-01T00:00:00+00:00", true).unwrap();
        advance_baseline_tx(&conn, 5, "2026-03-02T00:00:00+00:00", false).unwrap();
        drop(conn);

        let app = get(&pool, 5).unwrap();
        assert_eq!(
            app.last_backup_at.as_deref(),
            Some("2026-03-02T00:00:00+00:00")
        );
        assert_eq!(
            app.last_full_backup_at.as_deref(),
            Some("2026-03-01T00:00:00+00:00")
        );
    }

    #[test]
    fn test_list_and_active_filter() {
        let pool = init_test_db().unwrap();
        upsert(&pool, 2, "Beta", None).unwrap();
        upsert(&pool, 1, "Alpha", None).unwrap();
        upsert(&pool, 3, "Gamma", None).unwrap();
        assert!(set_active(&pool, 3, false).unwrap());

        let all = list(&pool, false).unwrap();
        assert_eq!(
            all.iter().map(|a| a.name.as_str()).collect::<Vec<_>>(),
            vec!["Alpha", "Beta", "Gamma"]
        );

        let active = list(&pool, true).unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|a| a.active));

        assert!(!set_active(&pool, 99, false).unwrap());
        assert!(try_get(&pool, 99).unwrap().is_none());
    }
}
