use crate::jobs::ImportStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Snapshot of an import job returned to status pollers.
///
/// `running` reflects whether a worker for this job is alive in the current
/// process, which is independent of the persisted `status` (a `paused` job
/// may or may not still hold a worker).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportJobStatus {
    pub job_id: i64,
    pub session_id: String,
    pub file_name: String,
    pub status: ImportStatus,
    pub phase: String,
    pub processed: i64,
    /// Logical records in the file, once the counting pre-pass has finished.
    pub total: Option<i64>,
    pub progress_percent: i64,
    pub records_created: i64,
    pub records_failed: i64,
    pub running: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub stop_reason: Option<String>,
    pub error_message: Option<String>,
    pub info_message: Option<String>,
    pub staging_table: Option<String>,
    pub archive_table: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// One row of the import history listing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportJobSummary {
    pub job_id: i64,
    pub session_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_md5: Option<String>,
    pub status: ImportStatus,
    pub records_created: i64,
    pub records_failed: i64,
    pub created_at: DateTime<Utc>,
}

/// Returned by `POST /api/imports` once the upload is stored and the worker
/// has been scheduled.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmittedImport {
    pub job_id: i64,
    pub session_id: String,
}

/// Outcome of a control-surface request (pause, resume, cancel, finalize).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub success: bool,
    pub status: Option<ImportStatus>,
    pub message: String,
}

impl ControlResponse {
    pub fn ok(status: ImportStatus, message: impl Into<String>) -> Self {
        Self {
            success: true,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn rejected(status: Option<ImportStatus>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status,
            message: message.into(),
        }
    }
}

/// What `POST /api/imports/purge` removed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub jobs_deleted: usize,
    pub errors_deleted: usize,
    pub files_deleted: usize,
    pub staging_tables_dropped: usize,
}
