use common::jobs::ImportStatus;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Failures that stop an operation as a whole: job-fatal errors inside a
/// worker, or a rejected control-surface request.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("import job {0} not found")]
    JobNotFound(i64),
    #[error("cannot move import job from '{from}' to '{to}'")]
    InvalidTransition {
        from: ImportStatus,
        to: ImportStatus,
    },
    #[error("uploaded file is missing: {}", .0.display())]
    MissingUpload(PathBuf),
    #[error("unsupported encoding '{0}'")]
    UnsupportedEncoding(String),
    #[error("invalid delimiter '{0}'")]
    InvalidDelimiter(String),
    #[error("import job {job_id} cannot be finalized: {reason}")]
    NotFinalizable { job_id: i64, reason: String },
    #[error("upload rejected: {0}")]
    Upload(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid record pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl ImportError {
    /// Whether the error describes a request the caller made in the wrong
    /// state, as opposed to an infrastructure failure.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ImportError::InvalidTransition { .. } | ImportError::NotFinalizable { .. }
        )
    }

    /// Whether the caller sent something unusable (bad upload or parameters).
    pub fn is_bad_request(&self) -> bool {
        matches!(
            self,
            ImportError::Upload(_)
                | ImportError::InvalidRequest(_)
                | ImportError::UnsupportedEncoding(_)
                | ImportError::InvalidDelimiter(_)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowErrorKind {
    /// A physical line that is neither a record start nor a continuation of one.
    InvalidLine,
    InsufficientColumns,
    InvalidId,
    InvalidDate,
    /// A value longer than its column; the row is staged with the value cut.
    Truncated,
    Csv,
    Insert,
}

impl RowErrorKind {
    pub fn label(&self) -> &'static str {
        match self {
            RowErrorKind::InvalidLine => "invalid line",
            RowErrorKind::InsufficientColumns => "insufficient columns",
            RowErrorKind::InvalidId => "invalid id",
            RowErrorKind::InvalidDate => "invalid date",
            RowErrorKind::Truncated => "truncated field",
            RowErrorKind::Csv => "unparseable line",
            RowErrorKind::Insert => "insert failed",
        }
    }
}

/// A problem with a single logical row. Never escapes the per-row boundary:
/// it is written to the error ledger and counted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowError {
    pub row_index: i64,
    pub kind: RowErrorKind,
    pub message: String,
    pub raw: Option<String>,
}

impl RowError {
    pub fn new(row_index: i64, kind: RowErrorKind, message: impl Into<String>) -> Self {
        Self {
            row_index,
            kind,
            message: message.into(),
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: impl Into<String>) -> Self {
        self.raw = Some(raw.into());
        self
    }
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {}: {}: {}",
            self.row_index,
            self.kind.label(),
            self.message
        )
    }
}

/// Truncates `text` to at most `max_chars` characters without splitting a
/// code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
