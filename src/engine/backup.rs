//! Backup orchestration: one app end to end, or a sequential sweep over
//! every active tracked app.
//!
//! A run's row exists before the first remote call and is finalized exactly
//! once: `running → {success | failure}`. Client counters are snapshotted
//! into the row and reset on every exit path.

use std::sync::Arc;
use std::time::Instant;

use crate::archive::{self, Manifest, SCHEMA_VERSION};
use crate::config::Settings;
use crate::db::models::{BackupRun, RunKind, RunStatus, RunTrigger, UpdateBackupRun};
use crate::db::repos::{apps, markers, runs};
use crate::db::DbPool;
use crate::engine::{attachments, audit};
use crate::error::AppError;
use crate::kintone::client::KintoneClient;
use crate::kintone::types;

pub struct BackupOrchestrator {
    db: DbPool,
    client: Arc<KintoneClient>,
    settings: Settings,
}

/// Per-app result of a scheduled sweep.
pub struct AppBackupOutcome {
    pub app_id: u64,
    pub app_name: String,
    pub result: Result<BackupRun, AppError>,
}

impl BackupOrchestrator {
    pub fn new(db: DbPool, client: Arc<KintoneClient>, settings: Settings) -> Self {
        Self {
            db,
            client,
            settings,
        }
    }

    /// Run one full or differential backup of `app_id`.
    pub async fn backup_app(
        &self,
        app_id: u64,
        kind: RunKind,
        trigger: RunTrigger,
    ) -> Result<BackupRun, AppError> {
        if kind == RunKind::Restore {
            return Err(AppError::Validation(
                "restore runs are driven by the restore reconciler".into(),
            ));
        }

        let started = Instant::now();
        let started_at = chrono::Utc::now();

        // Differential baseline is the app's last successful backup time; a
        // first-time app has none and silently gets a full fetch.
        let baseline = match kind {
            RunKind::Differential => {
                apps::try_get(&self.db, app_id)?.and_then(|a| a.last_backup_at)
            }
            _ => None,
        };
        if kind == RunKind::Differential && baseline.is_none() {
            tracing::info!(app_id, "No differential baseline yet; fetching everything");
        }

        let run = runs::create(
            &self.db,
            app_id,
            None,
            kind,
            trigger,
            baseline.as_deref(),
        )?;
        tracing::info!(run_id = %run.id, app_id, kind = kind.as_str(), "Backup run started");

        let result = self
            .execute(&run, app_id, kind, baseline.as_deref(), &started_at, started)
            .await;

        match result {
            Ok(()) => {
                let finished = runs::get_by_id(&self.db, &run.id)?;
                tracing::info!(
                    run_id = %run.id,
                    records = finished.record_count,
                    duration_ms = finished.duration_ms.unwrap_or(0),
                    "Backup run finished"
                );
                audit::emit(
                    &self.client,
                    self.settings.backup.audit_app_id,
                    &audit::AuditEvent::from_backup_run(&finished),
                )
                .await;
                self.client.stats().reset();
                Ok(finished)
            }
            Err(e) => {
                let snap = self.client.stats().snapshot();
                tracing::error!(run_id = %run.id, app_id, error = %e, "Backup run failed");
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
                    tracing::error!(run_id = %run.id, error = %fin_err, "Could not persist run failure");
                }
                self.client.stats().reset();
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        run: &BackupRun,
        app_id: u64,
        kind: RunKind,
        baseline: Option<&str>,
        started_at: &chrono::DateTime<chrono::Utc>,
        started: Instant,
    ) -> Result<(), AppError> {
        let app = self.client.get_app(app_id).await?;
        apps::upsert(&self.db, app_id, &app.name, None)?;
        runs::update(
            &self.db,
            &run.id,
            UpdateBackupRun {
                app_name: Some(app.name.clone()),
                ..Default::default()
            },
        )?;

        let records = match baseline {
            Some(since) => self.client.get_changed_records(app_id, since).await?,
            None => self.client.get_all_records(app_id, None, None).await?,
        };
        tracing::info!(app_id, count = records.len(), "Records fetched");

        // Empty set: success with no archive, but elapsed time and counters
        // still land on the row and the baseline still advances.
        if records.is_empty() {
            let snap = self.client.stats().snapshot();
            runs::finalize_success(
                &self.db,
                &run.id,
                app_id,
                UpdateBackupRun {
                    status: Some(RunStatus::Success),
                    finished_at: Some(chrono::Utc::now().to_rfc3339()),
                    duration_ms: Some(started.elapsed().as_millis() as i64),
                    record_count: Some(0),
                    api_requests: Some(snap.api_requests as i64),
                    retries: Some(snap.retries as i64),
                    ..Default::default()
                },
                &started_at.to_rfc3339(),
                kind == RunKind::Full,
                &[],
            )?;
            return Ok(());
        }

        // Schema snapshot is best-effort; a failure here must not fail the run.
        let schema = match self.client.get_field_schema(app_id).await {
            Ok(schema) => Some(schema),
            Err(e) => {
                tracing::warn!(app_id, error = %e, "Field schema snapshot unavailable");
                None
            }
        };
        if let Some(schema) = &schema {
            apps::upsert(
                &self.db,
                app_id,
                &app.name,
                Some(&serde_json::to_string(schema.as_ref())?),
            )?;
        }

        let manifest = Manifest {
            schema_version: SCHEMA_VERSION,
            app_id,
            record_count: records.len(),
            captured_at: started_at.to_rfc3339(),
            field_schema: schema
                .as_ref()
                .map(|s| serde_json::to_value(s.as_ref()))
                .transpose()?,
        };
        let archive_path = self
            .settings
            .archive_dir()?
            .join(archive::archive_file_name(app_id, kind, started_at));
        let stats = archive::write_archive(&archive_path, &records, &manifest)?;
        let compression_ratio = if stats.raw_bytes > 0 {
            1.0 - stats.compressed_bytes as f64 / stats.raw_bytes as f64
        } else {
            0.0
        };
        tracing::debug!(
            path = %archive_path.display(),
            raw = stats.raw_bytes,
            compressed = stats.compressed_bytes,
            "Archive written"
        );

        if self.settings.backup.download_attachments {
            let fields = attachments::discover_file_fields(
                &records,
                self.settings.backup.scan_all_records_for_attachments,
            );
            if !fields.is_empty() {
                let dest = archive_path.with_extension("files");
                let summary =
                    attachments::download_all(&self.client, &records, &fields, &dest).await;
                tracing::info!(
                    downloaded = summary.downloaded,
                    failed = summary.failed,
                    "Attachment sweep complete"
                );
            }
        }

        let record_markers: Vec<markers::MarkerUpsert> = records
            .iter()
            .filter_map(|r| {
                types::record_id(r).map(|record_id| markers::MarkerUpsert {
                    record_id,
                    updated_at: types::updated_time(r),
                })
            })
            .collect();

        let snap = self.client.stats().snapshot();
        runs::finalize_success(
            &self.db,
            &run.id,
            app_id,
            UpdateBackupRun {
                status: Some(RunStatus::Success),
                finished_at: Some(chrono::Utc::now().to_rfc3339()),
                duration_ms: Some(started.elapsed().as_millis() as i64),
                record_count: Some(records.len() as i64),
                archive_path: Some(archive_path.display().to_string()),
                archive_bytes: Some(stats.compressed_bytes as i64),
                compression_ratio: Some(compression_ratio),
                api_requests: Some(snap.api_requests as i64),
                retries: Some(snap.retries as i64),
                ..Default::default()
            },
            &started_at.to_rfc3339(),
            kind == RunKind::Full,
            &record_markers,
        )?;
        Ok(())
    }

    /// Scheduled sweep: differential backup of every active tracked app,
    /// strictly one at a time. One app's failure never stops the rest.
    pub async fn backup_all_active(&self) -> Result<Vec<AppBackupOutcome>, AppError> {
        let tracked = apps::list(&self.db, true)?;
        tracing::info!(apps = tracked.len(), "Scheduled sweep starting");

        let mut outcomes = Vec::with_capacity(tracked.len());
        for app in tracked {
            let result = self
                .backup_app(app.app_id, RunKind::Differential, RunTrigger::Scheduled)
                .await;
            if let Err(e) = &result {
                tracing::error!(app_id = app.app_id, name = %app.name, error = %e, "App backup failed; continuing sweep");
            }
            outcomes.push(AppBackupOutcome {
                app_id: app.app_id,
                app_name: app.name,
                result,
            });
        }

        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        tracing::info!(
            total = outcomes.len(),
            failed,
            "Scheduled sweep finished"
        );
        Ok(outcomes)
    }
}
