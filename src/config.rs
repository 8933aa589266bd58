use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::AppError;

/// Top-level settings, deserialized from `config.toml` with env overrides.
///
/// The encrypted settings store of the desktop app is not this crate's
/// concern; it hands us a plain file (or env vars) through this interface.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub kintone: KintoneSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KintoneSettings {
    /// Base URL of the kintone tenant, e.g. `https://example.cybozu.com`.
    #[serde(default)]
    pub base_url: String,
    /// API token auth (`X-Cybozu-API-Token`). Preferred over user/password.
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    /// Where archives (and attachment folders) are written.
    /// Defaults to `<data_dir>/archives`.
    pub archive_dir: Option<PathBuf>,
    /// kintone app that receives one audit record per run. Optional; when
    /// absent, audit emission is skipped entirely.
    pub audit_app_id: Option<u64>,
    /// Download file-field attachments alongside the archive.
    pub download_attachments: bool,
    /// Widen attachment-field discovery from the first record to every
    /// record. Off by default to match the historical behavior; see
    /// `engine::attachments::discover_file_fields`.
    pub scan_all_records_for_attachments: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            archive_dir: None,
            audit_app_id: None,
            download_attachments: true,
            scan_all_records_for_attachments: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Load `.env` into the environment. Must run before [`data_dir`] so a
/// `KINVAULT_DATA_DIR` defined only in `.env` governs the database and log
/// directories too, not just the config and archive paths. Already-set
/// variables are never overridden, so calling it again is harmless.
pub fn load_env() {
    let _ = dotenvy::dotenv();
}

/// Resolve the data directory: `KINVAULT_DATA_DIR` env, else the platform
/// data dir + `kinvault`.
pub fn data_dir() -> Result<PathBuf, AppError> {
    if let Ok(dir) = std::env::var("KINVAULT_DATA_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::data_dir()
        .map(|d| d.join("kinvault"))
        .ok_or_else(|| AppError::Config("cannot determine a data directory".into()))
}

impl Settings {
    /// Load settings from `path` (or `<data_dir>/config.toml` when None),
    /// apply env overrides, and validate. `.env` files are honored.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        load_env();

        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => data_dir()?.join("config.toml"),
        };

        let mut settings: Settings = if config_path.exists() {
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str(&raw)
                .map_err(|e| AppError::Config(format!("{}: {e}", config_path.display())))?
        } else {
            // Env-only operation is fine; start from defaults.
            Settings {
                kintone: KintoneSettings {
                    base_url: String::new(),
                    api_token: None,
                    username: None,
                    password: None,
                },
                backup: BackupSettings::default(),
                retry: RetrySettings::default(),
            }
        };

        if let Ok(url) = std::env::var("KINVAULT_BASE_URL") {
            settings.kintone.base_url = url;
        }
        if let Ok(token) = std::env::var("KINVAULT_API_TOKEN") {
            settings.kintone.api_token = Some(token);
        }

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.kintone.base_url.is_empty() {
            return Err(AppError::Config(
                "kintone.base_url is not set (config.toml or KINVAULT_BASE_URL)".into(),
            ));
        }
        let has_token = self.kintone.api_token.as_deref().is_some_and(|t| !t.is_empty());
        let has_basic = self.kintone.username.is_some() && self.kintone.password.is_some();
        if !has_token && !has_basic {
            return Err(AppError::Config(
                "no kintone credentials: set kintone.api_token (or KINVAULT_API_TOKEN), \
                 or kintone.username + kintone.password"
                    .into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    /// Archive output directory, creating nothing.
    pub fn archive_dir(&self) -> Result<PathBuf, AppError> {
        match &self.backup.archive_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("archives")),
        }
    }
}
