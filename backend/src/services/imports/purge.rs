use crate::import::purge::purge_imports;
use crate::job_controller::state::JobsState;
use crate::services::error_response;
use actix_web::{web, HttpResponse, Responder};
use chrono::Utc;
use common::requests::PurgeImportsQuery;

pub(crate) async fn process(
    query: web::Query<PurgeImportsQuery>,
    state: web::Data<JobsState>,
) -> impl Responder {
    let older_than_days = query.older_than_days;
    let result = state
        .run_blocking(move |conn| purge_imports(conn, older_than_days, Utc::now()))
        .await;
    match result {
        Ok(report) => HttpResponse::Ok().json(report),
        Err(e) => error_response(&e),
    }
}
