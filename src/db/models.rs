use serde::{Deserialize, Serialize};

// ============================================================================
// Run enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Full,
    Differential,
    Restore,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Full => "full",
            RunKind::Differential => "differential",
            RunKind::Restore => "restore",
        }
    }
}

impl std::str::FromStr for RunKind {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "full" => Ok(RunKind::Full),
            "differential" => Ok(RunKind::Differential),
            "restore" => Ok(RunKind::Restore),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunTrigger {
    Manual,
    Scheduled,
}

impl RunTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunTrigger::Manual => "manual",
            RunTrigger::Scheduled => "scheduled",
        }
    }
}

impl std::str::FromStr for RunTrigger {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "manual" => Ok(RunTrigger::Manual),
            "scheduled" => Ok(RunTrigger::Scheduled),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Success,
    PartialSuccess,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::PartialSuccess => "partial_success",
            RunStatus::Failure => "failure",
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, ()> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "partial_success" => Ok(RunStatus::PartialSuccess),
            "failure" => Ok(RunStatus::Failure),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Backup runs
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct BackupRun {
    pub id: String,
    pub app_id: u64,
    pub app_name: Option<String>,
    pub kind: RunKind,
    pub triggered_by: RunTrigger,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub record_count: i64,
    pub archive_path: Option<String>,
    pub archive_bytes: Option<i64>,
    pub compression_ratio: Option<f64>,
    pub status: RunStatus,
    pub error_detail: Option<String>,
    pub api_requests: i64,
    pub retries: i64,
    pub diff_baseline: Option<String>,
    pub host: Option<String>,
    pub client_version: Option<String>,
    pub remarks: Option<String>,
}

/// Partial-field update for a run; `None` keeps the stored value (COALESCE).
#[derive(Debug, Clone, Default)]
pub struct UpdateBackupRun {
    pub app_name: Option<String>,
    pub status: Option<RunStatus>,
    pub finished_at: Option<String>,
    pub duration_ms: Option<i64>,
    pub record_count: Option<i64>,
    pub archive_path: Option<String>,
    pub archive_bytes: Option<i64>,
    pub compression_ratio: Option<f64>,
    pub error_detail: Option<String>,
    pub api_requests: Option<i64>,
    pub retries: Option<i64>,
    pub diff_baseline: Option<String>,
    pub remarks: Option<String>,
}

/// History query filter; all fields optional. Results are newest-first.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub app_id: Option<u64>,
    pub kind: Option<RunKind>,
    pub status: Option<RunStatus>,
    /// Inclusive lower bound on started_at (RFC3339).
    pub from: Option<String>,
    /// Exclusive upper bound on started_at (RFC3339).
    pub to: Option<String>,
    pub limit: Option<i64>,
}

// ============================================================================
// Tracked apps
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TrackedApp {
    pub app_id: u64,
    pub name: String,
    pub active: bool,
    pub last_backup_at: Option<String>,
    pub last_full_backup_at: Option<String>,
    /// Best-effort JSON snapshot of the app's field schema; nullable.
    pub field_schema: Option<String>,
    pub updated_at: String,
}

// ============================================================================
// Record markers
// ============================================================================

#[derive(Debug, Clone)]
pub struct RecordMarker {
    pub app_id: u64,
    pub record_id: String,
    pub updated_at: Option<String>,
    pub last_run_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_round_trip() {
        for kind in [RunKind::Full, RunKind::Differential, RunKind::Restore] {
            assert_eq!(kind.as_str().parse::<RunKind>().unwrap(), kind);
        }
        for status in [
            RunStatus::Running,
            RunStatus::Success,
            RunStatus::PartialSuccess,
            RunStatus::Failure,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
    }
}
