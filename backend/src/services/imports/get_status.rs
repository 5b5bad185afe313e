use crate::error::ImportError;
use crate::import::job_store;
use crate::job_controller::state::JobsState;
use crate::services::error_response;
use actix_web::{web, HttpResponse, Responder};
use common::model::import_job::ImportJobStatus;

pub(crate) async fn process(job_id: web::Path<i64>, state: web::Data<JobsState>) -> impl Responder {
    match get_import_status(job_id.into_inner(), &state).await {
        Ok(status) => HttpResponse::Ok().json(status),
        Err(e) => error_response(&e),
    }
}

async fn get_import_status(job_id: i64, state: &JobsState) -> Result<ImportJobStatus, ImportError> {
    let job = state
        .run_blocking(move |conn| job_store::get(conn, job_id))
        .await?;
    let running = state.is_running(job_id).await;
    Ok(job.to_status(running))
}
