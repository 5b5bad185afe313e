use crate::import::archive::list_archives;
use crate::job_controller::state::JobsState;
use crate::services::error_response;
use actix_web::{web, HttpResponse, Responder};

pub(crate) async fn process(state: web::Data<JobsState>) -> impl Responder {
    let result = state
        .run_blocking(|conn| Ok(list_archives(conn)?))
        .await;
    match result {
        Ok(archives) => HttpResponse::Ok().json(archives),
        Err(e) => error_response(&e),
    }
}
