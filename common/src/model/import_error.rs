use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A row-level failure captured while importing.
///
/// Entries are keyed by session id rather than job id so they remain
/// queryable after the job record is gone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ImportErrorEntry {
    pub session_id: String,
    /// 1-based logical row index within the import.
    pub row_index: i64,
    pub message: String,
    pub raw_data: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportErrorCount {
    pub job_id: i64,
    pub session_id: String,
    pub count: i64,
}
