//! Tracks the import workers alive in this process.
//!
//! The database is the source of truth for a job's status and progress. What
//! lives here is only the set of jobs that currently own a worker thread, so
//! that a job is never driven by two workers at once and status responses can
//! say whether anything is actually running.
//!
//! The main components are:
//! - `JobsState`: clonable, shared as `web::Data`. Holds the database handle,
//!   the worker settings, the registry of running jobs and the finalize lock.
//! - `JobUpdate`: sent by a worker task when its worker returns.
//! - `start_job_updater`: long-running task that drains `JobUpdate`s, removes
//!   finished workers from the registry and reconciles what they left behind.

use crate::config::{AppConfig, ImportSettings};
use crate::db::Database;
use crate::error::ImportError;
use crate::import::job_store;
use crate::job_controller::worker::{self, WorkerExit};
use chrono::{DateTime, Utc};
use common::jobs::ImportStatus;
use log::{error, info, warn};
use rusqlite::Connection;
use std::path::PathBuf;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, Mutex, RwLock};

const UPDATE_CHANNEL_SIZE: usize = 100;

#[derive(Clone, Debug)]
pub struct RunningJob {
    pub started_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct JobsState {
    pub db: Database,
    pub settings: ImportSettings,
    pub upload_dir: PathBuf,
    pub max_upload_bytes: u64,
    /// Job id to the worker currently driving it. Inserted by `start_worker`
    /// under the write lock, removed by `start_job_updater`.
    pub jobs: Arc<RwLock<HashMap<i64, RunningJob>>>,
    pub tx: mpsc::Sender<JobUpdate>,
    /// Held for the whole of a finalize, so two finalizes never swap the
    /// live table at the same time.
    pub finalize_lock: Arc<Mutex<()>>,
}

#[derive(Debug)]
pub enum JobUpdate {
    Exited { job_id: i64, exit: WorkerExit },
}

/// What the updater should do once a worker is gone.
#[derive(Debug, PartialEq, Eq)]
enum Followup {
    Nothing,
    Restart,
}

impl JobsState {
    pub fn new(db: Database, config: &AppConfig) -> (Self, mpsc::Receiver<JobUpdate>) {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_SIZE);
        let state = Self {
            db,
            settings: config.import.clone(),
            upload_dir: config.upload_dir.clone(),
            max_upload_bytes: config.max_upload_bytes,
            jobs: Arc::new(RwLock::new(HashMap::new())),
            tx,
            finalize_lock: Arc::new(Mutex::new(())),
        };
        (state, rx)
    }

    /// Runs database work on the blocking pool with its own connection.
    pub async fn run_blocking<T, F>(&self, work: F) -> Result<T, ImportError>
    where
        F: FnOnce(&mut Connection) -> Result<T, ImportError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<T, ImportError> {
            let mut conn = db.connect()?;
            work(&mut conn)
        })
        .await
        .map_err(|e| ImportError::Io(std::io::Error::other(e.to_string())))?
    }

    pub async fn is_running(&self, job_id: i64) -> bool {
        self.jobs.read().await.contains_key(&job_id)
    }

    /// Spawns a worker for `job_id` unless one is already registered.
    /// Returns whether a new worker was started.
    pub async fn start_worker(&self, job_id: i64) -> bool {
        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job_id) {
                return false;
            }
            jobs.insert(
                job_id,
                RunningJob {
                    started_at: Utc::now(),
                },
            );
        }

        let db = self.db.clone();
        let settings = self.settings.clone();
        let tx = self.tx.clone();

        tokio::spawn(async move {
            let handle =
                tokio::task::spawn_blocking(move || worker::run_job(&db, job_id, &settings));
            let exit = match handle.await {
                Ok(exit) => exit,
                Err(join_err) => {
                    error!("Import job {} worker aborted: {}", job_id, join_err);
                    WorkerExit::Failed(format!("join error: {}", join_err))
                }
            };
            if tx.send(JobUpdate::Exited { job_id, exit }).await.is_err() {
                warn!("Job updater is gone; import job {} stays registered", job_id);
            }
        });

        info!("Started worker for import job {}", job_id);
        true
    }
}

/// Looks at a job whose worker just left. A pause lifted or a cancel
/// requested while the worker was on its way out would otherwise be lost.
fn reconcile(db: &Database, job_id: i64) -> Result<Followup, ImportError> {
    let conn = db.connect()?;
    let flags = job_store::refresh_control(&conn, job_id)?;

    match flags.status {
        ImportStatus::Pending | ImportStatus::Paused if flags.cancel_requested => {
            worker::finish_cancel(&conn, job_id)?;
            Ok(Followup::Nothing)
        }
        ImportStatus::Paused if !flags.pause_requested => Ok(Followup::Restart),
        _ => Ok(Followup::Nothing),
    }
}

/// Starts the central job updater.
///
/// Spawned once from `main.rs`. Each `JobUpdate::Exited` removes the job from
/// the registry; a worker that was released while paused is restarted if the
/// pause has been lifted in the meantime.
pub async fn start_job_updater(state: JobsState, mut rx: mpsc::Receiver<JobUpdate>) {
    while let Some(update) = rx.recv().await {
        let JobUpdate::Exited { job_id, exit } = update;
        let running = state.jobs.write().await.remove(&job_id);
        let ran_for = running
            .map(|r| (Utc::now() - r.started_at).num_seconds())
            .unwrap_or_default();
        info!(
            "Import job {} worker exited after {}s: {:?}",
            job_id, ran_for, exit
        );

        match &exit {
            WorkerExit::Failed(reason) => {
                warn!("Import job {} failed: {}", job_id, reason);
                continue;
            }
            WorkerExit::Skipped => continue,
            _ => {}
        }
        let db = state.db.clone();
        let followup = tokio::task::spawn_blocking(move || reconcile(&db, job_id)).await;
        match followup {
            Ok(Ok(Followup::Restart)) if exit == WorkerExit::Released => {
                state.start_worker(job_id).await;
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Import job {}: reconcile failed: {}", job_id, e),
            Err(join_err) => warn!("Import job {}: reconcile aborted: {}", job_id, join_err),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::job_controller::worker::test_support::{job_for, valid_rows};

    #[tokio::test(flavor = "multi_thread")]
    async fn worker_is_registered_once() {
        let (dir, state) = test_state(10);
        let conn = state.db.connect().unwrap();
        let job = job_for(&conn, dir.path(), "imp_once", &valid_rows(5));
        job_store::set_pause_requested(&conn, job.id, true).unwrap();

        assert!(state.start_worker(job.id).await);
        assert!(!state.start_worker(job.id).await);
        assert!(state.is_running(job.id).await);

        wait_idle(&state, job.id).await;
        assert_eq!(
            job_store::get(&conn, job.id).unwrap().status,
            ImportStatus::Paused
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn released_worker_restarts_when_pause_is_lifted() {
        let (dir, state) = test_state(10);
        let conn = state.db.connect().unwrap();
        let job = job_for(&conn, dir.path(), "imp_relift", &valid_rows(30));
        job_store::set_pause_requested(&conn, job.id, true).unwrap();
        state.start_worker(job.id).await;
        wait_idle(&state, job.id).await;

        // Lift the pause while no worker exists and report a release.
        job_store::set_pause_requested(&conn, job.id, false).unwrap();
        state.jobs.write().await.insert(job.id, RunningJob { started_at: Utc::now() });
        state
            .tx
            .send(JobUpdate::Exited {
                job_id: job.id,
                exit: WorkerExit::Released,
            })
            .await
            .unwrap();

        for _ in 0..1000 {
            if job_store::get(&conn, job.id).unwrap().status == ImportStatus::TempCompleted {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        let job = job_store::get(&conn, job.id).unwrap();
        assert_eq!(job.status, ImportStatus::TempCompleted);
        assert_eq!(job.records_created, 30);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn blocking_work_gets_its_own_connection() {
        let (dir, state) = test_state(10);
        let conn = state.db.connect().unwrap();
        let job = job_for(&conn, dir.path(), "imp_blocking", &valid_rows(1));

        let found = state
            .run_blocking(move |conn| job_store::get(conn, job.id))
            .await
            .unwrap();
        assert_eq!(found.session_id, "imp_blocking");

        let missing = state.run_blocking(|conn| job_store::get(conn, 404)).await;
        assert!(matches!(missing, Err(ImportError::JobNotFound(404))));
    }
}
