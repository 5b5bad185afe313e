use crate::error::ImportError;
use crate::import::archive;
use crate::job_controller::state::JobsState;
use crate::services::error_response;
use actix_web::{web, HttpResponse, Responder};
use common::model::archive::ArchiveCleanupReport;
use common::requests::CleanupArchivesQuery;
use log::info;

pub(crate) async fn process(
    query: web::Query<CleanupArchivesQuery>,
    state: web::Data<JobsState>,
) -> impl Responder {
    let keep = query.keep.unwrap_or(state.settings.archive_keep);
    match cleanup(keep, query.dry_run, &state).await {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(&e),
    }
}

/// Serialised with finalize so an archive is never dropped while the live
/// table is being swapped.
async fn cleanup(
    keep: usize,
    dry_run: bool,
    state: &JobsState,
) -> Result<ArchiveCleanupReport, ImportError> {
    let _guard = state.finalize_lock.lock().await;
    state
        .run_blocking(move |conn| {
            let report = archive::cleanup_archives(conn, keep, dry_run)?;
            if !dry_run {
                info!("{}", archive::cleanup_summary(&report));
            }
            Ok(report)
        })
        .await
}
