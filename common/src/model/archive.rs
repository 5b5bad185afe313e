use serde::{Deserialize, Serialize};

/// A frozen copy of the live subscriber table taken at finalize time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveTableInfo {
    pub name: String,
    pub columns: i64,
    pub rows: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveCleanupReport {
    pub kept_tables: Vec<String>,
    pub deleted_tables: Vec<String>,
    pub total_kept: usize,
    pub total_deleted: usize,
    pub dry_run: bool,
}
