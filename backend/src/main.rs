mod config;
mod db;
mod error;
mod import;
mod job_controller;
mod services;

use crate::config::AppConfig;
use crate::db::Database;
use crate::import::job_store;
use crate::job_controller::state::{start_job_updater, JobsState};
use actix_web::{web, App, HttpServer};
use common::jobs::ImportStatus;
use env_logger::Env;
use log::{info, warn};

/// Puts jobs a previous process left mid-flight back into a resumable state
/// and returns the ones that were submitted but never started.
fn recover_jobs(db: &Database) -> rusqlite::Result<Vec<i64>> {
    let conn = db.connect()?;
    let (paused, reverted) = job_store::recover_orphans(&conn)?;
    if paused > 0 {
        warn!(
            "{} interrupted import jobs moved to 'paused'; resume them to continue",
            paused
        );
    }
    if reverted > 0 {
        warn!(
            "{} interrupted finalizes rolled back to 'temp_completed'",
            reverted
        );
    }
    Ok(job_store::find_by_status(&conn, ImportStatus::Pending)?
        .into_iter()
        .map(|job| job.id)
        .collect())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init_from_env(Env::default().default_filter_or("info"));
    let config = AppConfig::from_env();

    let db = Database::new(config.db_path.clone());
    db.init().map_err(std::io::Error::other)?;
    std::fs::create_dir_all(&config.upload_dir)?;
    info!(
        "Database at {}, uploads in {}",
        db.path().display(),
        config.upload_dir.display()
    );
    let pending = recover_jobs(&db).map_err(std::io::Error::other)?;

    // Initialize job controller state
    let (jobs_state, rx) = JobsState::new(db, &config);

    // Start job updater task
    let updater_state = jobs_state.clone();
    tokio::spawn(async move {
        start_job_updater(updater_state, rx).await;
    });

    for job_id in pending {
        jobs_state.start_worker(job_id).await;
    }

    info!("Server running at http://{}:{}", config.host, config.port);

    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(jobs_state.clone()))
            .service(services::imports::configure_routes())
            .service(services::archives::configure_routes())
    })
    .bind((config.host.as_str(), config.port))?
    .run()
    .await
}
