/// App-wide error type. Every fallible function returns `Result<T, AppError>`.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kintone API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Rate limited by kintone (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Short machine-readable kind, used in run error detail and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Database(_) => "database",
            AppError::Pool(_) => "pool",
            AppError::Io(_) => "io",
            AppError::Serde(_) => "serde",
            AppError::Archive(_) => "archive",
            AppError::Http(_) => "http",
            AppError::Api { .. } => "api",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::Auth(_) => "auth",
            AppError::Config(_) => "config",
            AppError::NotFound(_) => "not_found",
            AppError::Validation(_) => "validation",
        }
    }

    /// Transient errors are retried by the client's backoff loop; everything
    /// else aborts the calling operation immediately (auth and configuration
    /// problems never get better by waiting).
    pub fn is_transient(&self) -> bool {
        match self {
            // Request construction problems (bad URL, body serialization)
            // are permanent; connect/timeout/transfer failures are not.
            AppError::Http(e) => !e.is_builder(),
            AppError::RateLimited { .. } => true,
            AppError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Error detail persisted on a failed run: kind tag plus display text, so
    /// history queries can group failures without parsing prose.
    pub fn detail(&self) -> String {
        format!("[{}] {}", self.kind(), self)
    }
}
