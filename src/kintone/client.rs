//! HTTP client wrapping the kintone REST API (`/k/v1/...`).
//!
//! Every outbound call goes through one retry loop with exponential backoff
//! and request accounting; pagination and batching are transparent to callers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::config::KintoneSettings;
use crate::error::AppError;
use crate::kintone::query::{self, KEY_CHUNK, RECORD_PAGE_LIMIT, UPSERT_CHUNK};
use crate::kintone::retry::{RequestStats, RetryPolicy};
use crate::kintone::types::*;

// ============================================================================
// Auth
// ============================================================================

/// kintone credentials. API token is preferred; basic auth is the fallback
/// (`X-Cybozu-Authorization`, base64 of `user:password`).
#[derive(Clone)]
pub enum KintoneAuth {
    ApiToken(String),
    Basic { username: String, password: String },
}

impl KintoneAuth {
    pub fn from_settings(settings: &KintoneSettings) -> Result<Self, AppError> {
        if let Some(token) = settings.api_token.as_deref().filter(|t| !t.is_empty()) {
            return Ok(KintoneAuth::ApiToken(token.to_string()));
        }
        match (&settings.username, &settings.password) {
            (Some(u), Some(p)) => Ok(KintoneAuth::Basic {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => Err(AppError::Auth("no kintone credentials configured".into())),
        }
    }

    fn apply(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            KintoneAuth::ApiToken(token) => req.header("X-Cybozu-API-Token", token),
            KintoneAuth::Basic { username, password } => req.header(
                "X-Cybozu-Authorization",
                BASE64.encode(format!("{username}:{password}")),
            ),
        }
    }
}

// ============================================================================
// Error body
// ============================================================================

/// Error shape kintone returns: `{"code": "...", "id": "...", "message": "..."}`.
#[derive(Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

// ============================================================================
// KintoneClient
// ============================================================================

pub struct KintoneClient {
    http: reqwest::Client,
    base_url: String,
    auth: KintoneAuth,
    policy: RetryPolicy,
    stats: RequestStats,
    /// Field schema per app, fetched once and reused for the updated-time and
    /// record-number code discovery.
    schema_cache: tokio::sync::Mutex<HashMap<u64, Arc<FormFields>>>,
}

impl KintoneClient {
    pub fn new(
        base_url: String,
        auth: KintoneAuth,
        policy: RetryPolicy,
        stats: RequestStats,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
            policy,
            stats,
            schema_cache: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// The caller-owned counters this client reports into.
    pub fn stats(&self) -> &RequestStats {
        &self.stats
    }

    // --------------------------------------------------------------------
    // Retry core
    // --------------------------------------------------------------------

    fn authed(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.auth
            .apply(self.http.request(method, format!("{}{}", self.base_url, path)))
    }

    /// Issue one logical call: counts one request, retries transient failures
    /// with capped exponential backoff and ±20% jitter. A 429's `Retry-After`
    /// hint, when present, overrides the computed delay.
    async fn send_with_retry(
        &self,
        make: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, AppError> {
        self.stats.record_request();

        let mut attempt: u32 = 1;
        loop {
            let outcome = match make().send().await {
                Ok(resp) => Self::check_status(resp).await,
                Err(e) => Err(AppError::Http(e)),
            };
            match outcome {
                Ok(resp) => return Ok(resp),
                Err(err) if err.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = match &err {
                        AppError::RateLimited {
                            retry_after_secs: Some(secs),
                        } => Duration::from_secs(*secs),
                        _ => self.policy.jittered(self.policy.delay_for(attempt)),
                    };
                    tracing::warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient kintone error; backing off"
                    );
                    self.stats.record_retry();
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Map a non-success response to the error taxonomy: 429 → RateLimited
    /// (with the server's wait hint), 401/403 → Auth (fatal), the rest → Api.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, AppError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(AppError::RateLimited { retry_after_secs });
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .ok()
            .and_then(|e| match (e.code, e.message) {
                (Some(c), Some(m)) => Some(format!("{c}: {m}")),
                (None, Some(m)) => Some(m),
                _ => None,
            })
            .unwrap_or(body);

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(AppError::Auth(message));
        }
        Err(AppError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        make: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<T, AppError> {
        let resp = self.send_with_retry(make).await?;
        Ok(resp.json().await?)
    }

    // --------------------------------------------------------------------
    // Apps / schema
    // --------------------------------------------------------------------

    /// `GET /k/v1/apps.json` — every app visible to the credentials,
    /// paginated 100 at a time.
    pub async fn list_apps(&self) -> Result<Vec<AppInfo>, AppError> {
        let mut apps = Vec::new();
        let mut offset = 0usize;
        loop {
            let page: AppsResponse = self
                .get_json(|| {
                    self.authed(reqwest::Method::GET, "/k/v1/apps.json").query(&[
                        ("limit", "100".to_string()),
                        ("offset", offset.to_string()),
                    ])
                })
                .await?;
            let n = page.apps.len();
            apps.extend(page.apps);
            if n < 100 {
                return Ok(apps);
            }
            offset += n;
        }
    }

    /// `GET /k/v1/app.json?id=…`
    pub async fn get_app(&self, app_id: u64) -> Result<AppInfo, AppError> {
        self.get_json(|| {
            self.authed(reqwest::Method::GET, "/k/v1/app.json")
                .query(&[("id", app_id.to_string())])
        })
        .await
    }

    /// `GET /k/v1/app/form/fields.json` — cached per app for the lifetime of
    /// the client.
    pub async fn get_field_schema(&self, app_id: u64) -> Result<Arc<FormFields>, AppError> {
        {
            let cache = self.schema_cache.lock().await;
            if let Some(schema) = cache.get(&app_id) {
                return Ok(schema.clone());
            }
        }
        let schema: FormFields = self
            .get_json(|| {
                self.authed(reqwest::Method::GET, "/k/v1/app/form/fields.json")
                    .query(&[("app", app_id.to_string())])
            })
            .await?;
        let schema = Arc::new(schema);
        self.schema_cache
            .lock()
            .await
            .insert(app_id, schema.clone());
        Ok(schema)
    }

    /// Field code of the app's UPDATED_TIME field, discovered from the
    /// schema. Falls back to the default code with a warning when the schema
    /// is unreadable or the field is missing.
    pub async fn updated_time_code(&self, app_id: u64) -> String {
        self.field_code_of_type(app_id, "UPDATED_TIME", "Updated_datetime")
            .await
    }

    /// Field code of the human-facing record number (the business key used
    /// for restore reconciliation).
    pub async fn record_number_code(&self, app_id: u64) -> String {
        self.field_code_of_type(app_id, "RECORD_NUMBER", "Record_number")
            .await
    }

    async fn field_code_of_type(&self, app_id: u64, kind: &str, fallback: &str) -> String {
        match self.get_field_schema(app_id).await {
            Ok(schema) => match schema
                .properties
                .values()
                .find(|p| p.kind == kind)
                .map(|p| p.code.clone())
            {
                Some(code) => code,
                None => {
                    tracing::warn!(app_id, kind, fallback, "Field type absent from schema; using default code");
                    fallback.to_string()
                }
            },
            Err(e) => {
                tracing::warn!(app_id, kind, fallback, error = %e, "Schema unavailable; using default code");
                fallback.to_string()
            }
        }
    }

    // --------------------------------------------------------------------
    // Records
    // --------------------------------------------------------------------

    /// `GET /k/v1/records.json`, seek-paginated on `$id` until exhausted.
    /// Returns the full set ordered by `$id`; one request counted per page.
    /// When a projection is given, `$id` is forced into it so the cursor
    /// survives.
    pub async fn get_all_records(
        &self,
        app_id: u64,
        fields: Option<&[String]>,
        condition: Option<&str>,
    ) -> Result<Vec<Record>, AppError> {
        let projection: Option<Vec<String>> = fields.map(|f| {
            let mut f = f.to_vec();
            if !f.iter().any(|c| c == "$id") {
                f.push("$id".to_string());
            }
            f
        });

        let mut records = Vec::new();
        let mut last_id: Option<String> = None;
        loop {
            let q = query::page_query(condition, last_id.as_deref(), RECORD_PAGE_LIMIT);
            let page: RecordsResponse = self
                .get_json(|| {
                    let mut req = self
                        .authed(reqwest::Method::GET, "/k/v1/records.json")
                        .query(&[("app", app_id.to_string()), ("query", q.clone())]);
                    if let Some(fields) = &projection {
                        for (i, code) in fields.iter().enumerate() {
                            req = req.query(&[(format!("fields[{i}]"), code)]);
                        }
                    }
                    req
                })
                .await?;

            let n = page.records.len();
            last_id = page.records.last().and_then(record_id);
            records.extend(page.records);
            if n < RECORD_PAGE_LIMIT || last_id.is_none() {
                return Ok(records);
            }
        }
    }

    /// Records whose updated time is strictly after `since`.
    pub async fn get_changed_records(
        &self,
        app_id: u64,
        since: &str,
    ) -> Result<Vec<Record>, AppError> {
        let updated_code = self.updated_time_code(app_id).await;
        let condition = query::changed_since(&updated_code, since);
        self.get_all_records(app_id, None, Some(&condition)).await
    }

    // --------------------------------------------------------------------
    // Attachments
    // --------------------------------------------------------------------

    /// `GET /k/v1/file.json` — stream one attachment to `dest`. Returns the
    /// byte count written.
    pub async fn download_attachment(&self, file_key: &str, dest: &Path) -> Result<u64, AppError> {
        let resp = self
            .send_with_retry(|| {
                self.authed(reqwest::Method::GET, "/k/v1/file.json")
                    .query(&[("fileKey", file_key)])
            })
            .await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    // --------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------

    /// Apply updates (`PUT /k/v1/records.json`) and inserts (`POST`) in
    /// chunks of at most 100 records; one request counted per chunk. Within
    /// one call, either partition failing fails the call — restore isolates
    /// partitions by calling this once per partition.
    pub async fn batch_upsert(
        &self,
        app_id: u64,
        updates: &[RecordUpdate],
        inserts: &[serde_json::Map<String, Value>],
    ) -> Result<UpsertCounts, AppError> {
        let mut counts = UpsertCounts::default();

        for chunk in updates.chunks(UPSERT_CHUNK) {
            let body = serde_json::json!({ "app": app_id, "records": chunk });
            self.send_with_retry(|| {
                self.authed(reqwest::Method::PUT, "/k/v1/records.json")
                    .json(&body)
            })
            .await?;
            counts.updated += chunk.len();
        }

        for chunk in inserts.chunks(UPSERT_CHUNK) {
            let body = serde_json::json!({ "app": app_id, "records": chunk });
            self.send_with_retry(|| {
                self.authed(reqwest::Method::POST, "/k/v1/records.json")
                    .json(&body)
            })
            .await?;
            counts.added += chunk.len();
        }

        Ok(counts)
    }

    /// Map business keys to live `$id`s via batched `in (…)` queries, at most
    /// 50 keys per query. Unresolved keys map to `None`.
    pub async fn resolve_live_identifiers(
        &self,
        app_id: u64,
        business_keys: &[String],
    ) -> Result<HashMap<String, Option<String>>, AppError> {
        let key_code = self.record_number_code(app_id).await;
        let mut resolved: HashMap<String, Option<String>> =
            business_keys.iter().map(|k| (k.clone(), None)).collect();

        let projection = vec!["$id".to_string(), key_code.clone()];
        for chunk in business_keys.chunks(KEY_CHUNK) {
            let condition = query::in_clause(&key_code, chunk);
            let records = self
                .get_all_records(app_id, Some(&projection), Some(&condition))
                .await?;
            for record in &records {
                let live_id = record_id(record);
                let key = record.get(&key_code).and_then(|v| v.as_text());
                if let (Some(id), Some(key)) = (live_id, key) {
                    if let Some(slot) = resolved.get_mut(key) {
                        *slot = Some(id);
                    }
                }
            }
        }
        Ok(resolved)
    }

    /// Append one structured row to the audit app (`POST /k/v1/record.json`).
    /// Failures are caught and logged at WARN, never propagated — an audit
    /// hiccup must not fail the run it describes.
    pub async fn log_audit(&self, audit_app_id: u64, record: &serde_json::Map<String, Value>) {
        let body = serde_json::json!({ "app": audit_app_id, "record": record });
        let result = self
            .send_with_retry(|| {
                self.authed(reqwest::Method::POST, "/k/v1/record.json")
                    .json(&body)
            })
            .await;
        if let Err(e) = result {
            tracing::warn!(audit_app_id, error = %e, "Audit record write failed; continuing");
        }
    }
}
