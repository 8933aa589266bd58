//! Restore reconciliation: extract an archive, map archived business keys to
//! live record ids, then apply an update partition and an add partition
//! independently.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{Map, Value};

use crate::archive;
use crate::config::Settings;
use crate::db::models::{BackupRun, RunKind, RunStatus, RunTrigger, UpdateBackupRun};
use crate::db::repos::runs;
use crate::db::DbPool;
use crate::engine::audit;
use crate::error::AppError;
use crate::kintone::client::KintoneClient;
use crate::kintone::types::{record_id, record_number, Record, RecordUpdate};

pub struct RestoreReconciler {
    db: DbPool,
    client: Arc<KintoneClient>,
    settings: Settings,
}

/// Result of one restore invocation.
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    /// The restore's own run row.
    pub run_id: String,
    pub source_run_id: String,
    pub status: RunStatus,
    /// Records attempted (after any selection filter).
    pub attempted: usize,
    pub updated: usize,
    pub added: usize,
    pub warnings: Vec<String>,
    pub error_detail: Option<String>,
}

impl RestoreReconciler {
    pub fn new(db: DbPool, client: Arc<KintoneClient>, settings: Settings) -> Self {
        Self {
            db,
            client,
            settings,
        }
    }

    /// Replay records from the archive of `source_run_id` into the live app.
    /// `selected` filters to records whose derived business key is listed.
    pub async fn restore(
        &self,
        source_run_id: &str,
        selected: Option<&[String]>,
    ) -> Result<RestoreOutcome, AppError> {
        let source = runs::get_by_id(&self.db, source_run_id)?;
        let archive_path = source.archive_path.clone().ok_or_else(|| {
            AppError::Validation(format!(
                "backup run {source_run_id} has no archive to restore from"
            ))
        })?;

        let started = Instant::now();
        let run = runs::create(
            &self.db,
            source.app_id,
            source.app_name.as_deref(),
            RunKind::Restore,
            RunTrigger::Manual,
            None,
        )?;
        tracing::info!(run_id = %run.id, source = %source.id, "Restore started");

        let result = self.execute(&source, &archive_path, selected).await;
        let snap = self.client.stats().snapshot();

        match result {
            Ok(mut outcome) => {
                outcome.run_id = run.id.clone();
                runs::update(
                    &self.db,
                    &run.id,
                    UpdateBackupRun {
                        status: Some(outcome.status),
                        finished_at: Some(chrono::Utc::now().to_rfc3339()),
                        duration_ms: Some(started.elapsed().as_millis() as i64),
                        record_count: Some(outcome.attempted as i64),
                        // The restore row references the archive it replayed.
                        archive_path: Some(archive_path),
                        error_detail: outcome.error_detail.clone(),
                        api_requests: Some(snap.api_requests as i64),
                        retries: Some(snap.retries as i64),
                        remarks: Some(format!(
                            "restored from {}: updated={} added={}",
                            source.id, outcome.updated, outcome.added
                        )),
                        ..Default::default()
                    },
                )?;

                let finished = runs::get_by_id(&self.db, &run.id)?;
                audit::emit(
                    &self.client,
                    self.settings.backup.audit_app_id,
                    &audit::AuditEvent::from_restore(
                        &finished,
                        &source.id,
                        outcome.updated,
                        outcome.added,
                    ),
                )
                .await;
                self.client.stats().reset();

                tracing::info!(
                    run_id = %run.id,
                    status = outcome.status.as_str(),
                    updated = outcome.updated,
                    added = outcome.added,
                    "Restore finished"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(run_id = %run.id, error = %e, "Restore failed");
                let finalize = runs::update(
                    &self.db,
                    &run.id,
                    UpdateBackupRun {
                        status: Some(RunStatus::Failure),
                        finished_at: Some(chrono::Utc::now().to_rfc3339()),
                        duration_ms: Some(started.elapsed().as_millis() as i64),
                        error_detail: Some(e.detail()),
                        api_requests: Some(snap.api_requests as i64),
                        retries: Some(snap.retries as i64),
                        ..Default::default()
                    },
                );
                if let Err(fin_err) = finalize {
                    tracing::error!(run_id = %run.id, error = %fin_err, "Could not persist restore failure");
                }
                self.client.stats().reset();
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        source: &BackupRun,
        archive_path: &str,
        selected: Option<&[String]>,
    ) -> Result<RestoreOutcome, AppError> {
        let (records, _manifest) = archive::read_archive(Path::new(archive_path))?;
        if records.is_empty() {
            return Err(AppError::Validation("archive holds no records".into()));
        }

        let mut keyed: Vec<(Option<String>, Record)> = records
            .into_iter()
            .map(|r| (business_key(&r), r))
            .collect();

        if let Some(selected) = selected {
            let wanted: HashSet<&str> = selected.iter().map(String::as_str).collect();
            keyed.retain(|(key, _)| key.as_deref().is_some_and(|k| wanted.contains(k)));
            if keyed.is_empty() {
                return Err(AppError::Validation(
                    "none of the selected records exist in the archive".into(),
                ));
            }
        }

        let mut warnings = Vec::new();
        let distinct_keys: Vec<String> = keyed
            .iter()
            .filter_map(|(k, _)| k.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if distinct_keys.is_empty() {
            let msg = "no archived record carries a business key; every record will be re-created as new".to_string();
            tracing::warn!(app_id = source.app_id, "{msg}");
            warnings.push(msg);
        }

        // A whole-batch resolution failure degrades to "nothing resolved"
        // rather than aborting the restore.
        let resolved: HashMap<String, Option<String>> = if distinct_keys.is_empty() {
            HashMap::new()
        } else {
            match self
                .client
                .resolve_live_identifiers(source.app_id, &distinct_keys)
                .await
            {
                Ok(map) => map,
                Err(e) => {
                    let msg = format!(
                        "business-key resolution failed ({e}); all records will be added as new"
                    );
                    tracing::warn!(app_id = source.app_id, "{msg}");
                    warnings.push(msg);
                    HashMap::new()
                }
            }
        };

        let mut updates: Vec<RecordUpdate> = Vec::new();
        let mut adds: Vec<Map<String, Value>> = Vec::new();
        for (key, record) in &keyed {
            let clean = clean_for_write(record);
            match key
                .as_ref()
                .and_then(|k| resolved.get(k).cloned().flatten())
            {
                Some(live_id) => updates.push(RecordUpdate {
                    id: live_id,
                    record: clean,
                }),
                None => adds.push(clean),
            }
        }
        tracing::info!(
            updates = updates.len(),
            adds = adds.len(),
            "Records partitioned"
        );

        // Partitions apply independently; one failing never prevents the other.
        let mut errors: Vec<String> = Vec::new();
        let update_ok = if updates.is_empty() {
            None
        } else {
            match self
                .client
                .batch_upsert(source.app_id, &updates, &[])
                .await
            {
                Ok(_) => Some(true),
                Err(e) => {
                    tracing::error!(error = %e, "Update partition failed");
                    errors.push(format!("update partition: {}", e.detail()));
                    Some(false)
                }
            }
        };
        let add_ok = if adds.is_empty() {
            None
        } else {
            match self.client.batch_upsert(source.app_id, &[], &adds).await {
                Ok(_) => Some(true),
                Err(e) => {
                    tracing::error!(error = %e, "Add partition failed");
                    errors.push(format!("add partition: {}", e.detail()));
                    Some(false)
                }
            }
        };

        Ok(RestoreOutcome {
            run_id: String::new(), // filled in by the caller once finalized
            source_run_id: source.id.clone(),
            status: derive_status(update_ok, add_ok),
            attempted: keyed.len(),
            updated: if update_ok == Some(true) { updates.len() } else { 0 },
            added: if add_ok == Some(true) { adds.len() } else { 0 },
            warnings,
            error_detail: if errors.is_empty() {
                None
            } else {
                Some(errors.join("; "))
            },
        })
    }
}

/// Business key of an archived record: the internal `$id`, falling back to
/// the human-facing record number, else none.
pub(crate) fn business_key(record: &Record) -> Option<String> {
    record_id(record).or_else(|| record_number(record))
}

/// Write-shape field map: system-managed and computed fields stripped, the
/// rest reduced to `{"value": …}` as the records API expects on writes.
pub(crate) fn clean_for_write(record: &Record) -> Map<String, Value> {
    let mut out = Map::new();
    for (code, value) in record {
        if value.is_readonly() {
            continue;
        }
        out.insert(
            code.clone(),
            serde_json::json!({ "value": value.value_json() }),
        );
    }
    out
}

/// Terminal status from the two partition outcomes (`None` = not attempted):
/// success when every attempted partition succeeded, partial_success when
/// outcomes are mixed, failure when every attempted partition failed.
pub(crate) fn derive_status(update_ok: Option<bool>, add_ok: Option<bool>) -> RunStatus {
    match (update_ok, add_ok) {
        (Some(true), Some(false)) | (Some(false), Some(true)) => RunStatus::PartialSuccess,
        (Some(false), None) | (None, Some(false)) | (Some(false), Some(false)) => {
            RunStatus::Failure
        }
        _ => RunStatus::Success,
    }
}
