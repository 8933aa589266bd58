//! Audit entries appended to a designated kintone app, one per run.
//! Emission is fire-and-forget: a failed write is logged, never escalated.

use serde_json::{Map, Value};

use crate::db::models::BackupRun;
use crate::kintone::client::KintoneClient;

/// One structured audit row summarizing a finished run.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: &'static str,
    pub app_id: u64,
    pub app_name: String,
    pub kind: String,
    pub status: String,
    pub record_count: i64,
    pub duration_ms: i64,
    pub detail: String,
}

impl AuditEvent {
    /// Summary of a backup run, built from its terminal row.
    pub fn from_backup_run(run: &BackupRun) -> Self {
        Self {
            action: "backup",
            app_id: run.app_id,
            app_name: run.app_name.clone().unwrap_or_default(),
            kind: run.kind.as_str().to_string(),
            status: run.status.as_str().to_string(),
            record_count: run.record_count,
            duration_ms: run.duration_ms.unwrap_or(0),
            detail: format!(
                "run={} archive={} api_requests={} retries={}",
                run.id,
                run.archive_path.as_deref().unwrap_or("-"),
                run.api_requests,
                run.retries
            ),
        }
    }

    /// Summary of a restore, with partition counts and the source run.
    pub fn from_restore(
        run: &BackupRun,
        source_run_id: &str,
        updated: usize,
        added: usize,
    ) -> Self {
        Self {
            action: "restore",
            app_id: run.app_id,
            app_name: run.app_name.clone().unwrap_or_default(),
            kind: run.kind.as_str().to_string(),
            status: run.status.as_str().to_string(),
            record_count: run.record_count,
            duration_ms: run.duration_ms.unwrap_or(0),
            detail: format!("run={} source={source_run_id} updated={updated} added={added}", run.id),
        }
    }

    /// The write-shape record the audit app receives.
    pub fn to_record(&self) -> Map<String, Value> {
        fn val(v: impl Into<Value>) -> Value {
            serde_json::json!({ "value": v.into() })
        }
        let mut record = Map::new();
        record.insert("action".into(), val(self.action));
        record.insert("target_app_id".into(), val(self.app_id.to_string()));
        record.insert("target_app_name".into(), val(self.app_name.as_str()));
        record.insert("kind".into(), val(self.kind.as_str()));
        record.insert("status".into(), val(self.status.as_str()));
        record.insert("record_count".into(), val(self.record_count.to_string()));
        record.insert("duration_ms".into(), val(self.duration_ms.to_string()));
        record.insert("detail".into(), val(self.detail.as_str()));
        record
    }
}

/// Emit one audit row when an audit app is configured; a `None` app id skips
/// emission entirely. The client swallows write failures.
pub async fn emit(client: &KintoneClient, audit_app_id: Option<u64>, event: &AuditEvent) {
    let Some(audit_app_id) = audit_app_id else {
        return;
    };
    tracing::debug!(audit_app_id, action = event.action, status = %event.status, "Emitting audit record");
    client.log_audit(audit_app_id, &event.to_record()).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{RunKind, RunStatus, RunTrigger};

    fn terminal_run() -> BackupRun {
        BackupRun {
            id: "run-1".into(),
            app_id: 12,
            app_name: Some("Orders".into()),
            kind: RunKind::Full,
            triggered_by: RunTrigger::Manual,
            started_at: "2026-04-01T10:00:00+00:00".into(),
            finished_at: Some("2026-04-01T10:00:05+00:00".into()),
            duration_ms: Some(5000),
            record_count: 3,
            archive_path: Some("/tmp/12_x_full.zip".into()),
            archive_bytes: Some(1024),
            compression_ratio: Some(0.5),
            status: RunStatus::Success,
            error_detail: None,
            api_requests: 4,
            retries: 1,
            diff_baseline: None,
            host: Some("box".into()),
            client_version: Some("0.4.2".into()),
            remarks: None,
        }
    }

    #[test]
    fn test_backup_event_record_shape() {
        let event = AuditEvent::from_backup_run(&terminal_run());
        let record = event.to_record();

        assert_eq!(record["action"]["value"], "backup");
        assert_eq!(record["target_app_id"]["value"], "12");
        assert_eq!(record["status"]["value"], "success");
        assert_eq!(record["record_count"]["value"], "3");
        let detail = record["detail"]["value"].as_str().unwrap();
        assert!(detail.contains("run=run-1"));
        assert!(detail.contains("retries=1"));
    }

    #[test]
    fn test_restore_event_carries_counts() {
        let mut run = terminal_run();
        run.kind = RunKind::Restore;
        let event = AuditEvent::from_restore(&run, "source-9", 2, 1);
        let record = event.to_record();

        assert_eq!(record["action"]["value"], "restore");
        let detail = record["detail"]["value"].as_str().unwrap();
        assert!(detail.contains("source=source-9"));
        assert!(detail.contains("updated=2"));
        assert!(detail.contains("added=1"));
    }
}
