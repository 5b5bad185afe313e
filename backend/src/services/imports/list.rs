use crate::error::ImportError;
use crate::import::job_store;
use crate::job_controller::state::JobsState;
use crate::services::error_response;
use actix_web::{web, HttpResponse, Responder};
use common::model::import_job::ImportJobSummary;
use common::requests::ListJobsQuery;

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 500;

pub(crate) async fn process(
    query: web::Query<ListJobsQuery>,
    state: web::Data<JobsState>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    match list_jobs(limit, &state).await {
        Ok(jobs) => HttpResponse::Ok().json(jobs),
        Err(e) => error_response(&e),
    }
}

async fn list_jobs(limit: usize, state: &JobsState) -> Result<Vec<ImportJobSummary>, ImportError> {
    state
        .run_blocking(move |conn| {
            Ok(job_store::list_recent(conn, limit)?
                .iter()
                .map(|job| job.to_summary())
                .collect())
        })
        .await
}
