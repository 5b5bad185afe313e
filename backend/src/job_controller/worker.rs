//! The blocking import worker.
//!
//! One worker drives one job: reconstruct logical lines, parse them, stage
//! them. Rows are committed in batches of `checkpoint_every`; each batch
//! commits the staged rows, their error records and the job's counters and
//! byte offset in a single transaction, so a crash or a pause never leaves
//! rows staged that the checkpoint does not account for. Control flags are
//! re-read after every batch.

use crate::config::ImportSettings;
use crate::db::Database;
use crate::error::{ImportError, RowError, RowErrorKind};
use crate::import::encoding::TextEncoding;
use crate::import::job_store::{self, phase, ImportJob, Progress};
use crate::import::reconstructor::{
    count_logical_records, LineReconstructor, PhoneRecordStart, PhysicalLines, Reconstructed,
    RecordStart,
};
use crate::import::staging::{self, StagingWriter};
use crate::import::{error_ledger, record};
use common::jobs::ImportStatus;
use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::fs::File;
use std::io::{self, BufReader, Seek, SeekFrom};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

/// How a worker run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerExit {
    /// Every row is staged; the job waits for finalize.
    Staged,
    Cancelled,
    /// Paused for longer than the idle timeout; the job stays `paused`.
    Released,
    /// The job was not in a runnable state.
    Skipped,
    Failed(String),
}

enum PauseOutcome {
    Resumed,
    Cancelled,
    Released,
}

pub fn run_job(db: &Database, job_id: i64, settings: &ImportSettings) -> WorkerExit {
    let mut conn = match db.connect() {
        Ok(conn) => conn,
        Err(e) => {
            error!("Import job {}: cannot open database: {}", job_id, e);
            return WorkerExit::Failed(e.to_string());
        }
    };

    match drive(&mut conn, job_id, settings) {
        Ok(exit) => exit,
        Err(e) => {
            error!("Import job {} failed: {}", job_id, e);
            if let Err(cleanup) = fail_job(&conn, job_id, &e) {
                error!(
                    "Import job {}: could not record failure: {}",
                    job_id, cleanup
                );
            }
            WorkerExit::Failed(e.to_string())
        }
    }
}

fn drive(
    conn: &mut Connection,
    job_id: i64,
    settings: &ImportSettings,
) -> Result<WorkerExit, ImportError> {
    let job = job_store::get(conn, job_id)?;
    if !matches!(job.status, ImportStatus::Pending | ImportStatus::Paused) {
        warn!(
            "Import job {} is '{}', nothing to run",
            job_id, job.status
        );
        return Ok(WorkerExit::Skipped);
    }

    let flags = job_store::refresh_control(conn, job_id)?;
    if flags.cancel_requested {
        finish_cancel(conn, job_id)?;
        return Ok(WorkerExit::Cancelled);
    }
    if job.status == ImportStatus::Paused && flags.pause_requested {
        match wait_while_paused(conn, job_id, settings)? {
            PauseOutcome::Resumed => {}
            PauseOutcome::Cancelled => return Ok(WorkerExit::Cancelled),
            PauseOutcome::Released => return Ok(WorkerExit::Released),
        }
    } else {
        job_store::transition(conn, job_id, ImportStatus::Processing, phase::STAGING)?;
        job_store::set_stop_reason(conn, job_id, None)?;
    }

    let job = job_store::get(conn, job_id)?;
    info!(
        "Import job {} ({}) running from byte {}",
        job_id, job.session_id, job.resume_offset
    );

    let encoding = TextEncoding::from_label(&job.encoding)?;
    let predicate: Arc<dyn RecordStart> = Arc::new(PhoneRecordStart::new()?);
    if !job.upload_path.is_file() {
        return Err(ImportError::MissingUpload(job.upload_path.clone()));
    }

    if job.records_count.is_none() {
        job_store::set_phase(conn, job_id, phase::COUNTING)?;
        match count_records(&job, encoding, predicate.as_ref()) {
            Ok(total) => {
                job_store::set_records_count(conn, job_id, total as i64)?;
                info!("Import job {}: {} logical records", job_id, total);
            }
            Err(e) => warn!("Import job {}: record count unavailable: {}", job_id, e),
        }
    }

    let writer = StagingWriter::ensure(conn, &job)?;
    job_store::set_phase(conn, job_id, phase::STAGING)?;

    stage_file(conn, &job, &writer, encoding, predicate, settings)
}

fn open_upload(job: &ImportJob) -> Result<File, ImportError> {
    File::open(&job.upload_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => ImportError::MissingUpload(job.upload_path.clone()),
        _ => ImportError::Io(e),
    })
}

fn count_records(
    job: &ImportJob,
    encoding: TextEncoding,
    predicate: &dyn RecordStart,
) -> Result<u64, ImportError> {
    let reader = BufReader::new(open_upload(job)?);
    let lines = PhysicalLines::new(reader, encoding, 0);
    Ok(count_logical_records(
        lines,
        predicate,
        job.delimiter,
        job.has_header,
    )?)
}

fn progress_percent(offset: i64, size: u64) -> i64 {
    if size == 0 {
        return 100;
    }
    ((offset.max(0) as u64).saturating_mul(100) / size).min(100) as i64
}

fn stage_file(
    conn: &mut Connection,
    job: &ImportJob,
    writer: &StagingWriter,
    encoding: TextEncoding,
    predicate: Arc<dyn RecordStart>,
    settings: &ImportSettings,
) -> Result<WorkerExit, ImportError> {
    let mut file = open_upload(job)?;
    let size = file.metadata()?.len();
    let offset = job.resume_offset.max(0) as u64;
    file.seek(SeekFrom::Start(offset))?;

    let lines = PhysicalLines::new(BufReader::new(file), encoding, offset);
    let skip_header = job.has_header && offset == 0;
    let mut items = LineReconstructor::new(lines, predicate, job.delimiter, skip_header);
    let delimiter = job.delimiter as u8;
    let mut progress = Progress::of(job);

    loop {
        let tx = conn.transaction()?;
        let mut exhausted = false;
        let mut in_batch = 0;
        while in_batch < settings.checkpoint_every {
            let item = match items.next() {
                Some(item) => item?,
                None => {
                    exhausted = true;
                    break;
                }
            };
            in_batch += 1;
            progress.processed_rows += 1;
            stage_item(&tx, job, writer, delimiter, &item, &mut progress)?;
            progress.resume_offset = item.line().end as i64;
        }
        progress.progress_percent = if exhausted {
            100
        } else {
            progress_percent(progress.resume_offset, size)
        };
        job_store::save_progress(&tx, job.id, &progress)?;
        tx.commit()?;
        progress.last_error = None;
        debug!(
            "Import job {}: checkpoint at byte {} ({} processed, {} created, {} failed)",
            job.id,
            progress.resume_offset,
            progress.processed_rows,
            progress.records_created,
            progress.records_failed
        );

        let flags = job_store::refresh_control(conn, job.id)?;
        if flags.cancel_requested {
            finish_cancel(conn, job.id)?;
            return Ok(WorkerExit::Cancelled);
        }
        if exhausted {
            break;
        }
        if flags.pause_requested {
            job_store::transition(conn, job.id, ImportStatus::Paused, phase::PAUSED)?;
            job_store::set_stop_reason(conn, job.id, Some("paused by request"))?;
            info!(
                "Import job {} paused after {} rows",
                job.id, progress.processed_rows
            );
            match wait_while_paused(conn, job.id, settings)? {
                PauseOutcome::Resumed => {}
                PauseOutcome::Cancelled => return Ok(WorkerExit::Cancelled),
                PauseOutcome::Released => return Ok(WorkerExit::Released),
            }
        }
    }

    job_store::set_records_count(conn, job.id, progress.processed_rows)?;
    job_store::transition(
        conn,
        job.id,
        ImportStatus::TempCompleted,
        phase::WAITING_FINALIZATION,
    )?;
    info!(
        "Import job {} staged into {}: {} created, {} failed",
        job.id,
        writer.table(),
        progress.records_created,
        progress.records_failed
    );
    Ok(WorkerExit::Staged)
}

/// Parses and stages one logical line. Row problems go to the error ledger
/// and the counters; only database failures are returned.
fn stage_item(
    conn: &Connection,
    job: &ImportJob,
    writer: &StagingWriter,
    delimiter: u8,
    item: &Reconstructed,
    progress: &mut Progress,
) -> Result<(), ImportError> {
    let row_index = progress.processed_rows;
    let rejected = match item {
        Reconstructed::Orphan(line) => Some(
            RowError::new(
                row_index,
                RowErrorKind::InvalidLine,
                format!(
                    "line at byte {} does not start a record and follows no record",
                    line.start
                ),
            )
            .with_raw(line.text.as_str()),
        ),
        Reconstructed::Record(line) => match record::parse_record(&line.text, delimiter, row_index) {
            Err(err) => Some(err.with_raw(line.text.as_str())),
            Ok(parsed) => {
                for warning in parsed.warnings {
                    let warning = warning.with_raw(line.text.as_str());
                    error_ledger::record_row_error(conn, job.id, &job.session_id, &warning)?;
                    progress.last_error = Some(warning.to_string());
                }
                writer
                    .insert(conn, row_index, &parsed.record, &line.text)?
                    .err()
            }
        },
    };

    match rejected {
        None => progress.records_created += 1,
        Some(err) => {
            debug!("Import job {}: {}", job.id, err);
            error_ledger::record_row_error(conn, job.id, &job.session_id, &err)?;
            progress.records_failed += 1;
            progress.last_error = Some(err.to_string());
        }
    }
    Ok(())
}

/// Blocks while the job is paused, polling its control flags.
fn wait_while_paused(
    conn: &Connection,
    job_id: i64,
    settings: &ImportSettings,
) -> Result<PauseOutcome, ImportError> {
    let since = Instant::now();
    loop {
        let flags = job_store::refresh_control(conn, job_id)?;
        if flags.cancel_requested {
            finish_cancel(conn, job_id)?;
            return Ok(PauseOutcome::Cancelled);
        }
        if !flags.pause_requested {
            job_store::transition(conn, job_id, ImportStatus::Processing, phase::STAGING)?;
            job_store::set_stop_reason(conn, job_id, None)?;
            info!("Import job {} resumed", job_id);
            return Ok(PauseOutcome::Resumed);
        }
        if since.elapsed() >= settings.pause_idle_timeout {
            info!(
                "Import job {} paused for {:?}, releasing its worker",
                job_id, settings.pause_idle_timeout
            );
            return Ok(PauseOutcome::Released);
        }
        job_store::heartbeat(conn, job_id)?;
        thread::sleep(settings.pause_poll_interval);
    }
}

/// Moves the job to `cancelled` and drops its staging table. Returns false
/// when the job's status no longer allows cancelling.
pub(crate) fn finish_cancel(conn: &Connection, job_id: i64) -> Result<bool, ImportError> {
    let job = match job_store::transition(conn, job_id, ImportStatus::Cancelled, phase::CANCELLED) {
        Ok(job) => job,
        Err(ImportError::InvalidTransition { from, .. }) => {
            debug!("Import job {} is '{}', cancel ignored", job_id, from);
            return Ok(false);
        }
        Err(e) => return Err(e),
    };
    staging::drop_staging(conn, &job)?;
    job_store::set_stop_reason(conn, job_id, Some("cancelled by request"))?;
    info!("Import job {} cancelled", job_id);
    Ok(true)
}

fn fail_job(conn: &Connection, job_id: i64, cause: &ImportError) -> Result<(), ImportError> {
    let message = cause.to_string();
    job_store::set_error_message(conn, job_id, Some(&message))?;
    match job_store::transition(conn, job_id, ImportStatus::Failed, phase::FAILED) {
        Ok(job) => {
            staging::drop_staging(conn, &job)?;
            job_store::set_stop_reason(conn, job_id, Some("failed"))?;
            Ok(())
        }
        Err(ImportError::InvalidTransition { from, .. }) => {
            warn!(
                "Import job {} left '{}' after failure: {}",
                job_id, from, message
            );
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::import::job_store::test_support::new_job;
    use std::path::Path;
    use std::time::Duration;

    pub fn fast_settings(checkpoint_every: usize) -> ImportSettings {
        ImportSettings {
            checkpoint_every,
            pause_poll_interval: Duration::from_millis(5),
            pause_idle_timeout: Duration::from_millis(200),
            archive_keep: 3,
        }
    }

    /// Numbered valid rows: `i,9930000000i,Last i,First i,,,,,,,`.
    pub fn valid_rows(count: usize) -> String {
        (1..=count)
            .map(|i| format!("{},993{:08},Last{},First{},,,,,,,\n", i, i, i, i))
            .collect()
    }

    pub fn job_for(conn: &Connection, dir: &Path, name: &str, content: &str) -> ImportJob {
        let path = dir.join(format!("{}.csv", name));
        std::fs::write(&path, content).unwrap();
        job_store::create(conn, &new_job(name, path)).unwrap()
    }
}
