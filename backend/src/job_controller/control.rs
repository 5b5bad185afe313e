//! Pause, resume, cancel and finalize requests.
//!
//! Requests never touch a running worker directly: they write a control flag
//! and the worker picks it up at its next checkpoint. Only when no worker is
//! alive for the job does a request act on the job itself.

use crate::error::ImportError;
use crate::import::job_store::{self, phase};
use crate::import::{archive, staging};
use crate::job_controller::state::JobsState;
use crate::job_controller::worker;
use common::jobs::ImportStatus;
use common::model::import_job::ControlResponse;
use log::{info, warn};

pub async fn request_pause(state: &JobsState, job_id: i64) -> Result<ControlResponse, ImportError> {
    state
        .run_blocking(move |conn| {
            let job = job_store::get(conn, job_id)?;
            let response = match job.status {
                ImportStatus::Processing if job.phase == phase::FINALIZING => {
                    ControlResponse::rejected(Some(job.status), "job is being finalized")
                }
                ImportStatus::Processing => {
                    job_store::set_pause_requested(conn, job_id, true)?;
                    info!("Pause requested for import job {}", job_id);
                    ControlResponse::ok(job.status, "pause requested")
                }
                ImportStatus::Paused => {
                    job_store::set_pause_requested(conn, job_id, true)?;
                    ControlResponse::ok(job.status, "job is already paused")
                }
                other => ControlResponse::rejected(
                    Some(other),
                    format!("cannot pause a job that is '{}'", other),
                ),
            };
            Ok(response)
        })
        .await
}

/// Lifts a pause, restarting the worker if it was released, or restarts a
/// failed job from the beginning.
pub async fn request_resume(state: &JobsState, job_id: i64) -> Result<ControlResponse, ImportError> {
    let (response, start) = state
        .run_blocking(move |conn| {
            let job = job_store::get(conn, job_id)?;
            let decided = match job.status {
                ImportStatus::Paused | ImportStatus::Processing if job.phase != phase::FINALIZING => {
                    job_store::set_pause_requested(conn, job_id, false)?;
                    (ControlResponse::ok(job.status, "resume requested"), true)
                }
                ImportStatus::Pending => (ControlResponse::ok(job.status, "job is queued"), true),
                ImportStatus::Failed => {
                    staging::drop_staging(conn, &job)?;
                    let job = job_store::reset_for_restart(conn, job_id)?;
                    info!("Import job {} restarted from the beginning", job_id);
                    (ControlResponse::ok(job.status, "job restarted"), true)
                }
                other => (
                    ControlResponse::rejected(
                        Some(other),
                        format!("cannot resume a job that is '{}'", other),
                    ),
                    false,
                ),
            };
            Ok(decided)
        })
        .await?;

    if start {
        let restarted = state.start_worker(job_id).await;
        info!(
            "Resume requested for import job {} (new worker: {})",
            job_id, restarted
        );
    }
    Ok(response)
}

pub async fn request_cancel(state: &JobsState, job_id: i64) -> Result<ControlResponse, ImportError> {
    let flagged = state
        .run_blocking(move |conn| {
            let job = job_store::get(conn, job_id)?;
            match job.status {
                ImportStatus::Processing if job.phase == phase::FINALIZING => Ok(Err(
                    ControlResponse::rejected(Some(job.status), "job is being finalized"),
                )),
                ImportStatus::Pending | ImportStatus::Processing | ImportStatus::Paused => {
                    job_store::set_cancel_requested(conn, job_id, true)?;
                    Ok(Ok(job.status))
                }
                other => Ok(Err(ControlResponse::rejected(
                    Some(other),
                    format!("cannot cancel a job that is '{}'", other),
                ))),
            }
        })
        .await?;
    let status = match flagged {
        Ok(status) => status,
        Err(rejected) => return Ok(rejected),
    };

    if state.is_running(job_id).await {
        info!("Cancel requested for running import job {}", job_id);
        return Ok(ControlResponse::ok(status, "cancel requested"));
    }
    state
        .run_blocking(move |conn| {
            if worker::finish_cancel(conn, job_id)? {
                return Ok(ControlResponse::ok(ImportStatus::Cancelled, "job cancelled"));
            }
            let current = job_store::get(conn, job_id)?.status;
            Ok(ControlResponse::rejected(
                Some(current),
                format!("cannot cancel a job that is '{}'", current),
            ))
        })
        .await
}

/// Swaps a staged job into the live table and prunes old archives.
pub async fn finalize(state: &JobsState, job_id: i64) -> Result<ControlResponse, ImportError> {
    let _guard = state.finalize_lock.lock().await;
    let keep = state.settings.archive_keep;

    let message = state
        .run_blocking(move |conn| {
            let outcome = archive::finalize(conn, job_id)?;
            let mut message = format!(
                "Loaded {} rows, previous data archived to {}",
                outcome.rows_loaded, outcome.archive_table
            );
            match archive::cleanup_archives(conn, keep, false) {
                Ok(report) => {
                    let summary = archive::cleanup_summary(&report);
                    message = format!("{}. {}", message, summary);
                }
                Err(e) => warn!("Archive cleanup after finalize failed: {}", e),
            }
            job_store::set_info_message(conn, job_id, &message)?;
            Ok(message)
        })
        .await?;

    Ok(ControlResponse::ok(ImportStatus::Completed, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema;
    use crate::job_controller::state::test_support::{test_state, wait_idle};
    use crate::job_controller::worker::test_support::{job_for, valid_rows};
    use std::time::Duration;

    async fn wait_for(state: &JobsState, job_id: i64, status: ImportStatus) {
        let conn = state.db.connect().unwrap();
        for _ in 0..2000 {
            if job_store::get(&conn, job_id).unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("import job {} never reached {}", job_id, status);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pause_resume_and_finalize() {
        let (dir, state) = test_state(25);
        let conn = state.db.connect().unwrap();
        let job = job_for(&conn, dir.path(), "imp_flow", &valid_rows(100));
        job_store::set_pause_requested(&conn, job.id, true).unwrap();
        state.start_worker(job.id).await;
        wait_for(&state, job.id, ImportStatus::Paused).await;

        let rejected = finalize(&state, job.id).await;
        assert!(matches!(rejected, Err(ImportError::NotFinalizable { .. })));

        let resumed = request_resume(&state, job.id).await.unwrap();
        assert!(resumed.success);
        wait_for(&state, job.id, ImportStatus::TempCompleted).await;
        wait_idle(&state, job.id).await;

        let response = finalize(&state, job.id).await.unwrap();
        assert!(response.success);
        assert_eq!(response.status, Some(ImportStatus::Completed));
        assert_eq!(schema::row_count(&conn, schema::LIVE_TABLE).unwrap(), 100);
        let job = job_store::get(&conn, job.id).unwrap();
        assert!(job.info_message.unwrap().contains("Kept 1 archive tables, deleted 0"));

        let again = request_cancel(&state, job.id).await.unwrap();
        assert!(!again.success);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cancel_without_worker_cleans_up() {
        let (dir, state) = test_state(10);
        let conn = state.db.connect().unwrap();
        let job = job_for(&conn, dir.path(), "imp_idle", &valid_rows(30));
        job_store::set_pause_requested(&conn, job.id, true).unwrap();
        state.start_worker(job.id).await;
        wait_for(&state, job.id, ImportStatus::Paused).await;
        wait_idle(&state, job.id).await;
        let staging = job_store::get(&conn, job.id)
            .unwrap()
            .staging_table_name
            .unwrap();

        let response = request_cancel(&state, job.id).await.unwrap();
        assert!(response.success);
        assert_eq!(response.status, Some(ImportStatus::Cancelled));
        assert!(!schema::table_exists(&conn, &staging).unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn pause_is_rejected_for_pending_jobs() {
        let (dir, state) = test_state(10);
        let conn = state.db.connect().unwrap();
        let job = job_for(&conn, dir.path(), "imp_pending", &valid_rows(3));

        let response = request_pause(&state, job.id).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.status, Some(ImportStatus::Pending));
        assert!(matches!(
            request_pause(&state, 4242).await,
            Err(ImportError::JobNotFound(4242))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_job_restarts_from_scratch() {
        let (dir, state) = test_state(10);
        let conn = state.db.connect().unwrap();
        let path = dir.path().join("late.csv");
        let job = job_store::create(
            &conn,
            &job_store::test_support::new_job("imp_late", path.clone()),
        )
        .unwrap();
        state.start_worker(job.id).await;
        wait_for(&state, job.id, ImportStatus::Failed).await;
        wait_idle(&state, job.id).await;

        std::fs::write(&path, valid_rows(12)).unwrap();
        let response = request_resume(&state, job.id).await.unwrap();
        assert!(response.success);
        assert_eq!(response.status, Some(ImportStatus::Pending));
        wait_for(&state, job.id, ImportStatus::TempCompleted).await;
        let job = job_store::get(&conn, job.id).unwrap();
        assert_eq!(job.records_created, 12);
        assert!(job.error_message.is_none());
    }
}
