//! End-to-end flows against an in-process fake kintone service.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use kinvault::config::{BackupSettings, KintoneSettings, RetrySettings, Settings};
use kinvault::db::models::{RunKind, RunStatus, RunTrigger};
use kinvault::db::repos::{apps, markers, runs};
use kinvault::{archive, db, AppContext};

// ============================================================================
// Fake kintone service
// ============================================================================

#[derive(Default)]
struct Fake {
    /// Live records returned by unfiltered (full) fetches.
    records: Vec<Value>,
    /// Records returned for differential (updated-time filtered) queries.
    changed: Vec<Value>,
    /// Records returned for business-key `in (…)` resolution queries.
    resolution: Vec<Value>,
    /// Remaining record-fetch calls to answer with 429 before succeeding.
    rate_limit_remaining: usize,
    /// Fail every record update (PUT) with a 500.
    fail_updates: bool,
    /// File keys whose download answers 404.
    fail_file_keys: Vec<String>,
    /// Fail audit-record writes with a 500.
    fail_audit: bool,

    diff_queries: usize,
    update_bodies: Vec<Value>,
    add_bodies: Vec<Value>,
    audit_bodies: Vec<Value>,
}

type Shared = Arc<Mutex<Fake>>;

async fn get_app() -> Json<Value> {
    Json(json!({"appId": "1", "name": "Fake App"}))
}

async fn get_fields() -> Json<Value> {
    Json(json!({
        "properties": {
            "Record_number": {"type": "RECORD_NUMBER", "code": "Record_number", "label": "No."},
            "Title": {"type": "SINGLE_LINE_TEXT", "code": "Title", "label": "Title"},
            "Updated_datetime": {"type": "UPDATED_TIME", "code": "Updated_datetime"}
        }
    }))
}

async fn get_records(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let q = params.get("query").cloned().unwrap_or_default();
    let mut fake = state.lock().unwrap();

    if fake.rate_limit_remaining > 0 {
        fake.rate_limit_remaining -= 1;
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(header::RETRY_AFTER, "0")],
            Json(json!({"code": "GAIA_RE01", "message": "too many requests"})),
        )
            .into_response();
    }

    let records = if q.contains(" in (") {
        fake.resolution.clone()
    } else if q.contains("Updated_datetime >") {
        fake.diff_queries += 1;
        fake.changed.clone()
    } else {
        fake.records.clone()
    };
    Json(json!({ "records": records })).into_response()
}

async fn put_records(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut fake = state.lock().unwrap();
    if fake.fail_updates {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"code": "GAIA_IN01", "message": "update rejected"})),
        )
            .into_response();
    }
    fake.update_bodies.push(body);
    Json(json!({"records": []})).into_response()
}

async fn post_records(State(state): State<Shared>, Json(body): Json<Value>) -> Json<Value> {
    let mut fake = state.lock().unwrap();
    let n = body["records"].as_array().map(Vec::len).unwrap_or(0);
    fake.add_bodies.push(body);
    Json(json!({
        "ids": (0..n).map(|i| (200 + i).to_string()).collect::<Vec<_>>(),
        "revisions": vec!["1"; n]
    }))
}

async fn post_audit(State(state): State<Shared>, Json(body): Json<Value>) -> Response {
    let mut fake = state.lock().unwrap();
    if fake.fail_audit {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"code": "GAIA_DB01", "message": "audit app unavailable"})),
        )
            .into_response();
    }
    fake.audit_bodies.push(body);
    Json(json!({"id": "1", "revision": "1"})).into_response()
}

async fn get_file(
    State(state): State<Shared>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let key = params.get("fileKey").cloned().unwrap_or_default();
    if state.lock().unwrap().fail_file_keys.contains(&key) {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"code": "GAIA_FI01", "message": "file not found"})),
        )
            .into_response();
    }
    format!("contents of {key}").into_response()
}

async fn spawn_fake(fake: Fake) -> (String, Shared) {
    let shared: Shared = Arc::new(Mutex::new(fake));
    let app = Router::new()
        .route("/k/v1/app.json", get(get_app))
        .route("/k/v1/app/form/fields.json", get(get_fields))
        .route(
            "/k/v1/records.json",
            get(get_records).put(put_records).post(post_records),
        )
        .route("/k/v1/record.json", post(post_audit))
        .route("/k/v1/file.json", get(get_file))
        .with_state(shared.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), shared)
}

// ============================================================================
// Harness
// ============================================================================

fn live_record(id: u64, title: &str) -> Value {
    json!({
        "$id": {"type": "__ID__", "value": id.to_string()},
        "$revision": {"type": "__REVISION__", "value": "1"},
        "Record_number": {"type": "RECORD_NUMBER", "value": id.to_string()},
        "Title": {"type": "SINGLE_LINE_TEXT", "value": title},
        "Updated_datetime": {"type": "UPDATED_TIME", "value": "2026-04-01T10:00:00Z"}
    })
}

fn three_records() -> Vec<Value> {
    vec![
        live_record(1, "alpha"),
        live_record(2, "beta"),
        live_record(3, "gamma"),
    ]
}

struct Harness {
    ctx: AppContext,
    fake: Shared,
    _data_dir: tempfile::TempDir,
}

async fn harness(fake: Fake) -> Harness {
    let (base_url, shared) = spawn_fake(fake).await;
    let data_dir = tempfile::tempdir().unwrap();

    let settings = Settings {
        kintone: KintoneSettings {
            base_url,
            api_token: Some("test-token".into()),
            username: None,
            password: None,
        },
        backup: BackupSettings {
            archive_dir: Some(data_dir.path().join("archives")),
            audit_app_id: Some(99),
            download_attachments: false,
            scan_all_records_for_attachments: false,
        },
        retry: RetrySettings {
            max_attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 10,
        },
    };
    let pool = db::init_db(data_dir.path()).unwrap();
    let ctx = AppContext::new(settings, pool).unwrap();
    Harness {
        ctx,
        fake: shared,
        _data_dir: data_dir,
    }
}

// ============================================================================
// Backup
// ============================================================================

#[tokio::test]
async fn test_full_backup_of_three_records() {
    let h = harness(Fake {
        records: three_records(),
        ..Default::default()
    })
    .await;

    let run = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(run.kind, RunKind::Full);
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.record_count, 3);
    assert_eq!(run.app_name.as_deref(), Some("Fake App"));
    assert!(run.api_requests > 0);
    assert_eq!(run.retries, 0);
    assert!(run.compression_ratio.is_some());

    // Archive holds exactly the captured records plus a matching manifest.
    let path = run.archive_path.as_deref().unwrap();
    let (records, manifest) = archive::read_archive(std::path::Path::new(path)).unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(serde_json::to_value(&records).unwrap(), json!(three_records()));
    let manifest = manifest.unwrap();
    assert_eq!(manifest.record_count, 3);
    assert_eq!(manifest.app_id, 1);
    assert!(manifest.field_schema.is_some());

    // Baselines advanced, one marker per record, one audit row emitted.
    let app = apps::get(&h.ctx.db, 1).unwrap();
    assert!(app.last_backup_at.is_some());
    assert_eq!(app.last_backup_at, app.last_full_backup_at);
    assert_eq!(markers::count_for_app(&h.ctx.db, 1).unwrap(), 3);

    let fake = h.fake.lock().unwrap();
    assert_eq!(fake.audit_bodies.len(), 1);
    assert_eq!(fake.audit_bodies[0]["record"]["action"]["value"], "backup");

    // Counters are reset between logical operations.
    assert_eq!(h.ctx.stats.snapshot().api_requests, 0);
}

#[tokio::test]
async fn test_first_differential_falls_back_to_full() {
    let h = harness(Fake {
        records: three_records(),
        ..Default::default()
    })
    .await;

    let run = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Differential, RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(run.kind, RunKind::Differential);
    assert_eq!(run.record_count, 3);
    assert!(run.diff_baseline.is_none());
    // No updated-time filter was ever sent.
    assert_eq!(h.fake.lock().unwrap().diff_queries, 0);
}

#[tokio::test]
async fn test_unchanged_differential_is_empty_success() {
    let h = harness(Fake {
        records: three_records(),
        ..Default::default()
    })
    .await;
    let orchestrator = h.ctx.orchestrator();

    orchestrator
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();

    let run = orchestrator
        .backup_app(1, RunKind::Differential, RunTrigger::Scheduled)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.record_count, 0);
    assert!(run.archive_path.is_none());
    assert!(run.diff_baseline.is_some());
    assert!(run.finished_at.is_some());
    assert_eq!(h.fake.lock().unwrap().diff_queries, 1);
}

#[tokio::test]
async fn test_rate_limited_fetch_is_retried() {
    let h = harness(Fake {
        records: three_records(),
        rate_limit_remaining: 2,
        ..Default::default()
    })
    .await;

    let run = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.record_count, 3);
    assert_eq!(run.retries, 2);
}

#[tokio::test]
async fn test_fetch_failure_finalizes_run_as_failure() {
    // More 429s than the policy's attempt budget: the fetch exhausts retries.
    let h = harness(Fake {
        records: three_records(),
        rate_limit_remaining: 10,
        ..Default::default()
    })
    .await;

    let err = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap_err();
    assert!(err.is_transient());

    let history = runs::history(&h.ctx.db, &Default::default()).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, RunStatus::Failure);
    assert!(history[0].error_detail.as_deref().unwrap().contains("rate_limited"));
    assert!(history[0].finished_at.is_some());
}

#[tokio::test]
async fn test_attachment_failure_is_skipped_not_fatal() {
    let record = json!({
        "$id": {"type": "__ID__", "value": "1"},
        "$revision": {"type": "__REVISION__", "value": "1"},
        "Record_number": {"type": "RECORD_NUMBER", "value": "1"},
        "Title": {"type": "SINGLE_LINE_TEXT", "value": "alpha"},
        "Attachments": {"type": "FILE", "value": [
            {"contentType": "text/plain", "fileKey": "good-key", "name": "report.txt", "size": "20"},
            {"contentType": "text/plain", "fileKey": "bad-key", "name": "broken.txt", "size": "20"}
        ]},
        "Updated_datetime": {"type": "UPDATED_TIME", "value": "2026-04-01T10:00:00Z"}
    });
    let mut h = harness(Fake {
        records: vec![record],
        fail_file_keys: vec!["bad-key".into()],
        ..Default::default()
    })
    .await;
    h.ctx.settings.backup.download_attachments = true;

    let run = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();

    // A dead file key costs that one file, never the run.
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.record_count, 1);

    let files_dir =
        std::path::Path::new(run.archive_path.as_deref().unwrap()).with_extension("files");
    let field_dir = files_dir.join("1").join("Attachments");
    assert_eq!(
        std::fs::read_to_string(field_dir.join("report.txt")).unwrap(),
        "contents of good-key"
    );
    assert!(!field_dir.join("broken.txt").exists());
}

#[tokio::test]
async fn test_audit_write_failure_is_swallowed() {
    let h = harness(Fake {
        records: three_records(),
        fail_audit: true,
        ..Default::default()
    })
    .await;

    let run = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();

    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.record_count, 3);
    assert!(h.fake.lock().unwrap().audit_bodies.is_empty());
}

// ============================================================================
// Restore
// ============================================================================

#[tokio::test]
async fn test_restore_partitions_updates_and_adds() {
    let h = harness(Fake {
        records: three_records(),
        ..Default::default()
    })
    .await;

    let backup = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();

    // Only business key "1" still resolves to a live record, now id 101.
    h.fake.lock().unwrap().resolution = vec![json!({
        "$id": {"type": "__ID__", "value": "101"},
        "Record_number": {"type": "RECORD_NUMBER", "value": "1"}
    })];

    let outcome = h.ctx.reconciler().restore(&backup.id, None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.attempted, 3);
    assert_eq!(outcome.updated, 1);
    assert_eq!(outcome.added, 2);
    assert!(outcome.warnings.is_empty());

    let fake = h.fake.lock().unwrap();
    assert_eq!(fake.update_bodies.len(), 1);
    let update = &fake.update_bodies[0]["records"][0];
    assert_eq!(update["id"], "101");
    // System fields were stripped from the write shape.
    assert_eq!(update["record"]["Title"]["value"], "alpha");
    assert!(update["record"].get("$id").is_none());
    assert!(update["record"].get("Updated_datetime").is_none());

    assert_eq!(fake.add_bodies.len(), 1);
    assert_eq!(fake.add_bodies[0]["records"].as_array().unwrap().len(), 2);
    drop(fake);

    // The restore left its own terminal run row, referencing the archive.
    let restore_run = runs::get_by_id(&h.ctx.db, &outcome.run_id).unwrap();
    assert_eq!(restore_run.kind, RunKind::Restore);
    assert_eq!(restore_run.status, RunStatus::Success);
    assert_eq!(restore_run.record_count, 3);
    assert_eq!(restore_run.archive_path, backup.archive_path);
    assert!(restore_run.remarks.as_deref().unwrap().contains("updated=1"));
}

#[tokio::test]
async fn test_restore_selection_filter() {
    let h = harness(Fake {
        records: three_records(),
        ..Default::default()
    })
    .await;
    let backup = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();

    let outcome = h
        .ctx
        .reconciler()
        .restore(&backup.id, Some(&["2".to_string()]))
        .await
        .unwrap();
    assert_eq!(outcome.attempted, 1);
    assert_eq!(outcome.added, 1);

    // A selection matching nothing is a validation error, not a no-op.
    let err = h
        .ctx
        .reconciler()
        .restore(&backup.id, Some(&["999".to_string()]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn test_failed_update_partition_is_partial_success() {
    let h = harness(Fake {
        records: three_records(),
        ..Default::default()
    })
    .await;
    let backup = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();

    {
        let mut fake = h.fake.lock().unwrap();
        fake.resolution = vec![json!({
            "$id": {"type": "__ID__", "value": "101"},
            "Record_number": {"type": "RECORD_NUMBER", "value": "1"}
        })];
        fake.fail_updates = true;
    }

    let outcome = h.ctx.reconciler().restore(&backup.id, None).await.unwrap();

    assert_eq!(outcome.status, RunStatus::PartialSuccess);
    assert_eq!(outcome.updated, 0);
    assert_eq!(outcome.added, 2);
    assert!(outcome
        .error_detail
        .as_deref()
        .unwrap()
        .contains("update partition"));

    let restore_run = runs::get_by_id(&h.ctx.db, &outcome.run_id).unwrap();
    assert_eq!(restore_run.status, RunStatus::PartialSuccess);
    assert!(restore_run.error_detail.is_some());
}

#[tokio::test]
async fn test_restore_of_empty_run_is_rejected() {
    let h = harness(Fake::default()).await;

    // Empty backup: success, no archive.
    let empty = h
        .ctx
        .orchestrator()
        .backup_app(1, RunKind::Full, RunTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(empty.record_count, 0);
    assert!(empty.archive_path.is_none());

    let err = h.ctx.reconciler().restore(&empty.id, None).await.unwrap_err();
    assert_eq!(err.kind(), "validation");
}

// ============================================================================
// Scheduled sweep
// ============================================================================

#[tokio::test]
async fn test_scheduled_sweep_covers_active_apps() {
    let h = harness(Fake {
        records: three_records(),
        ..Default::default()
    })
    .await;

    // Two tracked apps, one deactivated; the sweep only touches the active one.
    apps::upsert(&h.ctx.db, 1, "Fake App", None).unwrap();
    apps::upsert(&h.ctx.db, 2, "Dormant", None).unwrap();
    apps::set_active(&h.ctx.db, 2, false).unwrap();

    let outcomes = h.ctx.orchestrator().backup_all_active().await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].app_id, 1);
    let run = outcomes[0].result.as_ref().unwrap();
    assert_eq!(run.triggered_by, RunTrigger::Scheduled);
    assert_eq!(run.kind, RunKind::Differential);
    assert_eq!(run.record_count, 3);
}
