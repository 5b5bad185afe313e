use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a CSV import job.
///
/// `Completed` and `Cancelled` are terminal. A `Failed` job can only go back
/// to `Pending`, which starts a fresh run with reset counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Processing,
    Paused,
    /// Every row is staged and the live table is untouched until finalize.
    TempCompleted,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub const ALL: [ImportStatus; 7] = [
        ImportStatus::Pending,
        ImportStatus::Processing,
        ImportStatus::Paused,
        ImportStatus::TempCompleted,
        ImportStatus::Completed,
        ImportStatus::Failed,
        ImportStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Processing => "processing",
            ImportStatus::Paused => "paused",
            ImportStatus::TempCompleted => "temp_completed",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ImportStatus::Completed | ImportStatus::Cancelled)
    }

    /// Statuses from which `next` may be entered.
    pub fn allowed_sources(next: ImportStatus) -> Vec<ImportStatus> {
        ImportStatus::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(next))
            .collect()
    }

    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        use ImportStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Paused)
                | (Processing, TempCompleted)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Paused, Processing)
                | (Paused, Cancelled)
                | (TempCompleted, Processing)
                | (Failed, Pending)
        )
    }
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImportStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImportStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown import status '{}'", s))
    }
}
