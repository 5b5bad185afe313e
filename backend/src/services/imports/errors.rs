use crate::error::ImportError;
use crate::import::{error_ledger, job_store};
use crate::job_controller::state::JobsState;
use crate::services::error_response;
use actix_web::{web, HttpResponse, Responder};
use common::model::import_error::{ImportErrorCount, ImportErrorEntry};
use common::requests::ListErrorsQuery;

const DEFAULT_LIMIT: usize = 100;

pub(crate) async fn list(
    job_id: web::Path<i64>,
    query: web::Query<ListErrorsQuery>,
    state: web::Data<JobsState>,
) -> impl Responder {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    match list_errors(job_id.into_inner(), limit, &state).await {
        Ok(entries) => HttpResponse::Ok().json(entries),
        Err(e) => error_response(&e),
    }
}

pub(crate) async fn count(job_id: web::Path<i64>, state: web::Data<JobsState>) -> impl Responder {
    match count_errors(job_id.into_inner(), &state).await {
        Ok(count) => HttpResponse::Ok().json(count),
        Err(e) => error_response(&e),
    }
}

async fn list_errors(
    job_id: i64,
    limit: usize,
    state: &JobsState,
) -> Result<Vec<ImportErrorEntry>, ImportError> {
    state
        .run_blocking(move |conn| {
            let job = job_store::get(conn, job_id)?;
            Ok(error_ledger::list_recent(conn, &job.session_id, limit)?)
        })
        .await
}

async fn count_errors(job_id: i64, state: &JobsState) -> Result<ImportErrorCount, ImportError> {
    state
        .run_blocking(move |conn| {
            let job = job_store::get(conn, job_id)?;
            Ok(ImportErrorCount {
                job_id,
                count: error_ledger::count(conn, &job.session_id)?,
                session_id: job.session_id,
            })
        })
        .await
}
