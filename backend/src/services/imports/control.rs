use crate::error::ImportError;
use crate::job_controller::control;
use crate::job_controller::state::JobsState;
use crate::services::error_response;
use actix_web::{web, HttpResponse, Responder};
use common::model::import_job::ControlResponse;

fn respond(result: Result<ControlResponse, ImportError>) -> HttpResponse {
    match result {
        Ok(response) if response.success => HttpResponse::Ok().json(response),
        Ok(response) => HttpResponse::Conflict().json(response),
        Err(e) => error_response(&e),
    }
}

pub(crate) async fn pause(job_id: web::Path<i64>, state: web::Data<JobsState>) -> impl Responder {
    respond(control::request_pause(&state, job_id.into_inner()).await)
}

pub(crate) async fn resume(job_id: web::Path<i64>, state: web::Data<JobsState>) -> impl Responder {
    respond(control::request_resume(&state, job_id.into_inner()).await)
}

pub(crate) async fn cancel(job_id: web::Path<i64>, state: web::Data<JobsState>) -> impl Responder {
    respond(control::request_cancel(&state, job_id.into_inner()).await)
}

pub(crate) async fn finalize(job_id: web::Path<i64>, state: web::Data<JobsState>) -> impl Responder {
    respond(control::finalize(&state, job_id.into_inner()).await)
}
