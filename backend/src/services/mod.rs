pub mod archives;
pub mod imports;

use crate::error::ImportError;
use actix_web::HttpResponse;
use common::jobs::ImportStatus;
use common::model::import_job::ControlResponse;
use log::error;

/// Maps a failed operation onto an HTTP response.
///
/// - `404` for an unknown job,
/// - `409` with a `ControlResponse` body when the job is in the wrong state,
/// - `400` for unusable input,
/// - `500` otherwise.
pub(crate) fn error_response(err: &ImportError) -> HttpResponse {
    match err {
        ImportError::JobNotFound(_) => HttpResponse::NotFound().body(err.to_string()),
        err if err.is_conflict() => {
            let status: Option<ImportStatus> = match err {
                ImportError::InvalidTransition { from, .. } => Some(*from),
                _ => None,
            };
            HttpResponse::Conflict().json(ControlResponse::rejected(status, err.to_string()))
        }
        err if err.is_bad_request() => HttpResponse::BadRequest().body(format!("Error: {}", err)),
        err => {
            error!("Request failed: {}", err);
            HttpResponse::InternalServerError().body(format!("Error: {}", err))
        }
    }
}
