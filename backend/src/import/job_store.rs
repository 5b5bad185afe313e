//! Persistence of `ImportJob` records.
//!
//! The worker driving a job is the only writer of its progress fields. HTTP
//! handlers write the control flags (`pause_requested`, `cancel_requested`)
//! and never touch progress, so each side updates only its own columns and
//! neither clobbers the other.

use crate::error::ImportError;
use chrono::{DateTime, Utc};
use common::jobs::ImportStatus;
use common::model::import_job::{ImportJobStatus, ImportJobSummary};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;

/// Free-text sub-stage labels stored in `phase`.
pub mod phase {
    pub const PENDING: &str = "pending";
    pub const COUNTING: &str = "counting";
    pub const STAGING: &str = "staging";
    pub const PAUSED: &str = "paused";
    pub const WAITING_FINALIZATION: &str = "waiting_finalization";
    pub const FINALIZING: &str = "finalizing";
    pub const FINALIZED: &str = "finalized";
    pub const CANCELLED: &str = "cancelled";
    pub const FAILED: &str = "failed";
}

/// Longest `error_message` / `info_message` kept on the job row.
pub const MAX_MESSAGE_CHARS: usize = 500;

#[derive(Clone, Debug)]
pub struct ImportJob {
    pub id: i64,
    pub session_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_md5: Option<String>,
    pub delimiter: char,
    pub encoding: String,
    pub has_header: bool,
    pub upload_path: PathBuf,
    pub status: ImportStatus,
    pub phase: String,
    pub staging_table_name: Option<String>,
    pub archive_table_name: Option<String>,
    pub records_count: Option<i64>,
    pub records_created: i64,
    pub records_failed: i64,
    pub processed_rows: i64,
    pub progress_percent: i64,
    /// Byte offset just past the last committed logical record.
    pub resume_offset: i64,
    pub pause_requested: bool,
    pub cancel_requested: bool,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub error_message: Option<String>,
    pub info_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ImportJob {
    pub fn to_status(&self, running: bool) -> ImportJobStatus {
        ImportJobStatus {
            job_id: self.id,
            session_id: self.session_id.clone(),
            file_name: self.file_name.clone(),
            status: self.status,
            phase: self.phase.clone(),
            processed: self.processed_rows,
            total: self.records_count,
            progress_percent: self.progress_percent,
            records_created: self.records_created,
            records_failed: self.records_failed,
            running,
            last_heartbeat: self.last_heartbeat_at,
            stop_reason: self.stop_reason.clone(),
            error_message: self.error_message.clone(),
            info_message: self.info_message.clone(),
            pause_requested: self.pause_requested,
            cancel_requested: self.cancel_requested,
            staging_table: self.staging_table_name.clone(),
            archive_table: self.archive_table_name.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    pub fn to_summary(&self) -> ImportJobSummary {
        ImportJobSummary {
            job_id: self.id,
            session_id: self.session_id.clone(),
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            file_md5: self.file_md5.clone(),
            status: self.status,
            records_created: self.records_created,
            records_failed: self.records_failed,
            created_at: self.created_at,
        }
    }
}

#[derive(Clone, Debug)]
pub struct NewImportJob {
    pub session_id: String,
    pub file_name: String,
    pub file_size: i64,
    pub file_md5: Option<String>,
    pub delimiter: char,
    pub encoding: String,
    pub has_header: bool,
    pub upload_path: PathBuf,
}

/// Counters committed together with each batch of staged rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub processed_rows: i64,
    pub records_created: i64,
    pub records_failed: i64,
    pub resume_offset: i64,
    pub progress_percent: i64,
    pub last_error: Option<String>,
}

impl Progress {
    pub fn of(job: &ImportJob) -> Self {
        Self {
            processed_rows: job.processed_rows,
            records_created: job.records_created,
            records_failed: job.records_failed,
            resume_offset: job.resume_offset,
            progress_percent: job.progress_percent,
            last_error: None,
        }
    }
}

/// Control fields re-read from the database at each checkpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ControlFlags {
    pub status: ImportStatus,
    pub pause_requested: bool,
    pub cancel_requested: bool,
}

const JOB_COLUMNS: &str = "id, session_id, file_name, file_size, file_md5, delimiter, encoding,
    has_header, upload_path, status, phase, staging_table_name, archive_table_name,
    records_count, records_created, records_failed, processed_rows, progress_percent,
    resume_offset, pause_requested, cancel_requested, last_heartbeat_at, stop_reason,
    error_message, info_message, created_at, updated_at, started_at, finished_at";

fn parse_status(idx: usize, raw: String) -> rusqlite::Result<ImportStatus> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ImportJob> {
    let delimiter: String = row.get(5)?;
    let upload_path: String = row.get(8)?;
    Ok(ImportJob {
        id: row.get(0)?,
        session_id: row.get(1)?,
        file_name: row.get(2)?,
        file_size: row.get(3)?,
        file_md5: row.get(4)?,
        delimiter: delimiter.chars().next().unwrap_or(','),
        encoding: row.get(6)?,
        has_header: row.get(7)?,
        upload_path: PathBuf::from(upload_path),
        status: parse_status(9, row.get(9)?)?,
        phase: row.get(10)?,
        staging_table_name: row.get(11)?,
        archive_table_name: row.get(12)?,
        records_count: row.get(13)?,
        records_created: row.get(14)?,
        records_failed: row.get(15)?,
        processed_rows: row.get(16)?,
        progress_percent: row.get(17)?,
        resume_offset: row.get(18)?,
        pause_requested: row.get(19)?,
        cancel_requested: row.get(20)?,
        last_heartbeat_at: row.get(21)?,
        stop_reason: row.get(22)?,
        error_message: row.get(23)?,
        info_message: row.get(24)?,
        created_at: row.get(25)?,
        updated_at: row.get(26)?,
        started_at: row.get(27)?,
        finished_at: row.get(28)?,
    })
}

fn status_list(statuses: &[ImportStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn capped(message: &str) -> String {
    crate::error::truncate_chars(message, MAX_MESSAGE_CHARS).to_string()
}

pub fn create(conn: &Connection, new_job: &NewImportJob) -> Result<ImportJob, ImportError> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO import_jobs (session_id, file_name, file_size, file_md5, delimiter, encoding,
            has_header, upload_path, status, phase, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
        params![
            new_job.session_id,
            new_job.file_name,
            new_job.file_size,
            new_job.file_md5,
            new_job.delimiter.to_string(),
            new_job.encoding,
            new_job.has_header,
            new_job.upload_path.to_string_lossy(),
            ImportStatus::Pending.as_str(),
            phase::PENDING,
            now,
        ],
    )?;
    get(conn, conn.last_insert_rowid())
}

pub fn find(conn: &Connection, job_id: i64) -> rusqlite::Result<Option<ImportJob>> {
    conn.query_row(
        &format!("SELECT {} FROM import_jobs WHERE id = ?1", JOB_COLUMNS),
        params![job_id],
        job_from_row,
    )
    .optional()
}

pub fn get(conn: &Connection, job_id: i64) -> Result<ImportJob, ImportError> {
    find(conn, job_id)?.ok_or(ImportError::JobNotFound(job_id))
}

pub fn list_recent(conn: &Connection, limit: usize) -> rusqlite::Result<Vec<ImportJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM import_jobs ORDER BY created_at DESC, id DESC LIMIT ?1",
        JOB_COLUMNS
    ))?;
    let jobs = stmt
        .query_map(params![limit as i64], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

pub fn find_by_status(conn: &Connection, status: ImportStatus) -> rusqlite::Result<Vec<ImportJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM import_jobs WHERE status = ?1 ORDER BY id",
        JOB_COLUMNS
    ))?;
    let jobs = stmt
        .query_map(params![status.as_str()], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

/// Moves a job to `to` if its current status allows it. The check and the
/// write happen in a single statement, so two concurrent callers cannot
/// both win.
pub fn transition(
    conn: &Connection,
    job_id: i64,
    to: ImportStatus,
    phase: &str,
) -> Result<ImportJob, ImportError> {
    let sources = ImportStatus::allowed_sources(to);
    let now = Utc::now();
    let finished = matches!(
        to,
        ImportStatus::Completed | ImportStatus::Cancelled | ImportStatus::Failed
    );
    let updated = conn.execute(
        &format!(
            "UPDATE import_jobs
             SET status = ?1, phase = ?2, updated_at = ?3,
                 started_at = CASE WHEN ?1 = 'processing' THEN COALESCE(started_at, ?3) ELSE started_at END,
                 finished_at = CASE WHEN ?4 THEN ?3 ELSE finished_at END
             WHERE id = ?5 AND status IN ({})",
            status_list(&sources)
        ),
        params![to.as_str(), phase, now, finished, job_id],
    )?;

    if updated == 0 {
        let current = get(conn, job_id)?;
        return Err(ImportError::InvalidTransition {
            from: current.status,
            to,
        });
    }
    get(conn, job_id)
}

pub fn set_phase(conn: &Connection, job_id: i64, phase: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET phase = ?1, updated_at = ?2 WHERE id = ?3",
        params![phase, Utc::now(), job_id],
    )?;
    Ok(())
}

pub fn refresh_control(conn: &Connection, job_id: i64) -> Result<ControlFlags, ImportError> {
    conn.query_row(
        "SELECT status, pause_requested, cancel_requested FROM import_jobs WHERE id = ?1",
        params![job_id],
        |row| {
            Ok(ControlFlags {
                status: parse_status(0, row.get(0)?)?,
                pause_requested: row.get(1)?,
                cancel_requested: row.get(2)?,
            })
        },
    )
    .optional()?
    .ok_or(ImportError::JobNotFound(job_id))
}

pub fn set_pause_requested(conn: &Connection, job_id: i64, value: bool) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET pause_requested = ?1, updated_at = ?2 WHERE id = ?3",
        params![value, Utc::now(), job_id],
    )?;
    Ok(())
}

pub fn set_cancel_requested(conn: &Connection, job_id: i64, value: bool) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET cancel_requested = ?1, updated_at = ?2 WHERE id = ?3",
        params![value, Utc::now(), job_id],
    )?;
    Ok(())
}

/// Writes batch counters and the heartbeat. The percentage never moves
/// backwards.
pub fn save_progress(conn: &Connection, job_id: i64, progress: &Progress) -> rusqlite::Result<()> {
    let now = Utc::now();
    conn.execute(
        "UPDATE import_jobs
         SET processed_rows = ?1, records_created = ?2, records_failed = ?3,
             resume_offset = ?4, progress_percent = MAX(progress_percent, ?5),
             error_message = COALESCE(?6, error_message),
             last_heartbeat_at = ?7, updated_at = ?7
         WHERE id = ?8",
        params![
            progress.processed_rows,
            progress.records_created,
            progress.records_failed,
            progress.resume_offset,
            progress.progress_percent.clamp(0, 100),
            progress.last_error.as_deref().map(capped),
            now,
            job_id,
        ],
    )?;
    Ok(())
}

pub fn heartbeat(conn: &Connection, job_id: i64) -> rusqlite::Result<()> {
    let now = Utc::now();
    conn.execute(
        "UPDATE import_jobs SET last_heartbeat_at = ?1, updated_at = ?1 WHERE id = ?2",
        params![now, job_id],
    )?;
    Ok(())
}

pub fn set_records_count(conn: &Connection, job_id: i64, count: i64) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET records_count = ?1, updated_at = ?2 WHERE id = ?3",
        params![count, Utc::now(), job_id],
    )?;
    Ok(())
}

pub fn set_staging_table(
    conn: &Connection,
    job_id: i64,
    table: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET staging_table_name = ?1, updated_at = ?2 WHERE id = ?3",
        params![table, Utc::now(), job_id],
    )?;
    Ok(())
}

pub fn set_error_message(
    conn: &Connection,
    job_id: i64,
    message: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET error_message = ?1, updated_at = ?2 WHERE id = ?3",
        params![message.map(capped), Utc::now(), job_id],
    )?;
    Ok(())
}

pub fn set_info_message(conn: &Connection, job_id: i64, message: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET info_message = ?1, updated_at = ?2 WHERE id = ?3",
        params![capped(message), Utc::now(), job_id],
    )?;
    Ok(())
}

pub fn set_stop_reason(conn: &Connection, job_id: i64, reason: Option<&str>) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE import_jobs SET stop_reason = ?1, updated_at = ?2 WHERE id = ?3",
        params![reason.map(capped), Utc::now(), job_id],
    )?;
    Ok(())
}

/// `failed -> pending`: wipes progress so the next run starts from byte 0.
pub fn reset_for_restart(conn: &Connection, job_id: i64) -> Result<ImportJob, ImportError> {
    let updated = conn.execute(
        "UPDATE import_jobs
         SET status = ?1, phase = ?2, staging_table_name = NULL, records_count = NULL,
             records_created = 0, records_failed = 0, processed_rows = 0,
             progress_percent = 0, resume_offset = 0, pause_requested = 0,
             cancel_requested = 0, stop_reason = NULL, error_message = NULL,
             started_at = NULL, finished_at = NULL, updated_at = ?3
         WHERE id = ?4 AND status = ?5",
        params![
            ImportStatus::Pending.as_str(),
            phase::PENDING,
            Utc::now(),
            job_id,
            ImportStatus::Failed.as_str(),
        ],
    )?;
    if updated == 0 {
        let current = get(conn, job_id)?;
        return Err(ImportError::InvalidTransition {
            from: current.status,
            to: ImportStatus::Pending,
        });
    }
    get(conn, job_id)
}

/// Jobs a previous process left mid-flight. Staging runs become `paused` so
/// they can be resumed from their checkpoint; interrupted finalizes go back
/// to `temp_completed` (finalize runs in one transaction, so the live table
/// was not touched). Returns `(paused, reverted)`.
pub fn recover_orphans(conn: &Connection) -> rusqlite::Result<(usize, usize)> {
    let now = Utc::now();
    let reverted = conn.execute(
        "UPDATE import_jobs
         SET status = ?1, phase = ?2, error_message = 'finalize interrupted by restart',
             updated_at = ?3
         WHERE status = ?4 AND phase = ?5",
        params![
            ImportStatus::TempCompleted.as_str(),
            phase::WAITING_FINALIZATION,
            now,
            ImportStatus::Processing.as_str(),
            phase::FINALIZING,
        ],
    )?;
    let paused = conn.execute(
        "UPDATE import_jobs
         SET status = ?1, phase = ?2, stop_reason = 'interrupted by restart', updated_at = ?3
         WHERE status = ?4",
        params![
            ImportStatus::Paused.as_str(),
            phase::PAUSED,
            now,
            ImportStatus::Processing.as_str(),
        ],
    )?;
    Ok((paused, reverted))
}

/// Terminal jobs created before `older_than`.
pub fn find_expired(
    conn: &Connection,
    older_than: DateTime<Utc>,
) -> rusqlite::Result<Vec<ImportJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM import_jobs WHERE created_at < ?1 AND status IN ({}) ORDER BY id",
        JOB_COLUMNS,
        status_list(&[
            ImportStatus::Completed,
            ImportStatus::Cancelled,
            ImportStatus::Failed
        ])
    ))?;
    let jobs = stmt
        .query_map(params![older_than], job_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(jobs)
}

pub(crate) fn delete(conn: &Connection, job_id: i64) -> rusqlite::Result<usize> {
    conn.execute("DELETE FROM import_jobs WHERE id = ?1", params![job_id])
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn new_job(session_id: &str, upload_path: PathBuf) -> NewImportJob {
        NewImportJob {
            session_id: session_id.to_string(),
            file_name: "subscribers.csv".to_string(),
            file_size: std::fs::metadata(&upload_path).map(|m| m.len() as i64).unwrap_or(0),
            file_md5: None,
            delimiter: ',',
            encoding: "utf-8".to_string(),
            has_header: false,
            upload_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::new_job;
    use super::*;
    use crate::db::test_support::temp_database;

    #[test]
    fn create_and_read_back() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = create(&conn, &new_job("imp_1", dir.path().join("a.csv"))).unwrap();

        assert_eq!(job.status, ImportStatus::Pending);
        assert_eq!(job.phase, phase::PENDING);
        assert_eq!(job.delimiter, ',');
        assert_eq!(job.records_count, None);
        assert!(job.staging_table_name.is_none());

        let listed = list_recent(&conn, 10).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "imp_1");
    }

    #[test]
    fn missing_job_is_reported() {
        let (_dir, db) = temp_database();
        let conn = db.connect().unwrap();
        assert!(matches!(get(&conn, 99), Err(ImportError::JobNotFound(99))));
    }

    #[test]
    fn transitions_are_checked() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = create(&conn, &new_job("imp_t", dir.path().join("a.csv"))).unwrap();

        let err = transition(&conn, job.id, ImportStatus::Completed, phase::FINALIZED).unwrap_err();
        assert!(matches!(
            err,
            ImportError::InvalidTransition {
                from: ImportStatus::Pending,
                to: ImportStatus::Completed
            }
        ));

        let job = transition(&conn, job.id, ImportStatus::Processing, phase::STAGING).unwrap();
        assert_eq!(job.status, ImportStatus::Processing);
        assert!(job.started_at.is_some());

        let job = transition(&conn, job.id, ImportStatus::Cancelled, phase::CANCELLED).unwrap();
        assert!(job.finished_at.is_some());
        assert!(transition(&conn, job.id, ImportStatus::Processing, phase::STAGING).is_err());
    }

    #[test]
    fn progress_percent_never_decreases() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = create(&conn, &new_job("imp_p", dir.path().join("a.csv"))).unwrap();

        let mut progress = Progress {
            processed_rows: 10,
            records_created: 9,
            records_failed: 1,
            resume_offset: 500,
            progress_percent: 40,
            last_error: Some("row 3: invalid date".to_string()),
        };
        save_progress(&conn, job.id, &progress).unwrap();
        progress.progress_percent = 35;
        progress.last_error = None;
        save_progress(&conn, job.id, &progress).unwrap();

        let job = get(&conn, job.id).unwrap();
        assert_eq!(job.progress_percent, 40);
        assert_eq!(job.resume_offset, 500);
        assert_eq!(job.error_message.as_deref(), Some("row 3: invalid date"));
        assert!(job.last_heartbeat_at.is_some());
    }

    #[test]
    fn control_flags_round_trip() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = create(&conn, &new_job("imp_c", dir.path().join("a.csv"))).unwrap();

        set_pause_requested(&conn, job.id, true).unwrap();
        let flags = refresh_control(&conn, job.id).unwrap();
        assert!(flags.pause_requested);
        assert!(!flags.cancel_requested);
        assert_eq!(flags.status, ImportStatus::Pending);
    }

    #[test]
    fn restart_only_from_failed() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = create(&conn, &new_job("imp_r", dir.path().join("a.csv"))).unwrap();
        assert!(reset_for_restart(&conn, job.id).is_err());

        transition(&conn, job.id, ImportStatus::Processing, phase::STAGING).unwrap();
        save_progress(
            &conn,
            job.id,
            &Progress {
                processed_rows: 5,
                records_created: 5,
                resume_offset: 120,
                progress_percent: 50,
                ..Progress::default()
            },
        )
        .unwrap();
        transition(&conn, job.id, ImportStatus::Failed, phase::FAILED).unwrap();

        let job = reset_for_restart(&conn, job.id).unwrap();
        assert_eq!(job.status, ImportStatus::Pending);
        assert_eq!(job.processed_rows, 0);
        assert_eq!(job.resume_offset, 0);
        assert_eq!(job.progress_percent, 0);
    }

    #[test]
    fn orphans_are_recovered() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let staging = create(&conn, &new_job("imp_o1", dir.path().join("a.csv"))).unwrap();
        let finalizing = create(&conn, &new_job("imp_o2", dir.path().join("b.csv"))).unwrap();
        transition(&conn, staging.id, ImportStatus::Processing, phase::STAGING).unwrap();
        transition(&conn, finalizing.id, ImportStatus::Processing, phase::FINALIZING).unwrap();

        assert_eq!(recover_orphans(&conn).unwrap(), (1, 1));
        assert_eq!(get(&conn, staging.id).unwrap().status, ImportStatus::Paused);
        assert_eq!(
            get(&conn, finalizing.id).unwrap().status,
            ImportStatus::TempCompleted
        );
    }
}
