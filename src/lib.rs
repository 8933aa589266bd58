pub mod archive;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod kintone;
pub mod logging;

use std::sync::Arc;

use crate::config::Settings;
use crate::db::DbPool;
use crate::error::AppError;
use crate::kintone::client::{KintoneAuth, KintoneClient};
use crate::kintone::retry::{RequestStats, RetryPolicy};

/// Everything a command needs: settings, the metadata index, and one kintone
/// client with caller-owned counters.
pub struct AppContext {
    pub settings: Settings,
    pub db: DbPool,
    pub client: Arc<KintoneClient>,
    pub stats: RequestStats,
}

impl AppContext {
    /// Wire the stack up from loaded settings and an open pool.
    pub fn new(settings: Settings, db: DbPool) -> Result<Self, AppError> {
        let stats = RequestStats::new();
        let auth = KintoneAuth::from_settings(&settings.kintone)?;
        let client = Arc::new(KintoneClient::new(
            settings.kintone.base_url.clone(),
            auth,
            RetryPolicy::from(&settings.retry),
            stats.clone(),
        )?);
        Ok(Self {
            settings,
            db,
            client,
            stats,
        })
    }

    pub fn orchestrator(&self) -> engine::backup::BackupOrchestrator {
        engine::backup::BackupOrchestrator::new(
            self.db.clone(),
            self.client.clone(),
            self.settings.clone(),
        )
    }

    pub fn reconciler(&self) -> engine::restore::RestoreReconciler {
        engine::restore::RestoreReconciler::new(
            self.db.clone(),
            self.client.clone(),
            self.settings.clone(),
        )
    }
}
