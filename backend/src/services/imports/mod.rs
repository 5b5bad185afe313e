//! HTTP endpoints for import jobs.
//!
//! - `POST /api/imports`: multipart upload. A `json` part carrying a
//!   `SubmitImportRequest` must come first, then a `file` part with the CSV.
//!   The file is stored under the upload directory, a `pending` job is
//!   created and its worker scheduled. Returns `{job_id, session_id}`.
//! - `GET /api/imports`: recent jobs, newest first.
//! - `GET /api/imports/{job_id}`: the job's status, progress and whether a
//!   worker is alive for it.
//! - `POST /api/imports/{job_id}/pause|resume|cancel|finalize`: control
//!   requests, answered with a `ControlResponse` (`409` when rejected).
//! - `GET /api/imports/{job_id}/errors?limit=`: latest row errors.
//! - `GET /api/imports/{job_id}/errors/count`
//! - `POST /api/imports/purge?older_than_days=`: retention cleanup.

mod control;
mod errors;
mod get_status;
mod list;
mod purge;
mod upload;

use actix_web::web::{get, post, scope};
use actix_web::Scope;

const API_PATH: &str = "/api/imports";

pub fn configure_routes() -> Scope {
    scope(API_PATH)
        .route("", post().to(upload::process))
        .route("", get().to(list::process))
        .route("/purge", post().to(purge::process))
        .route("/{job_id}", get().to(get_status::process))
        .route("/{job_id}/pause", post().to(control::pause))
        .route("/{job_id}/resume", post().to(control::resume))
        .route("/{job_id}/cancel", post().to(control::cancel))
        .route("/{job_id}/finalize", post().to(control::finalize))
        .route("/{job_id}/errors", get().to(errors::list))
        .route("/{job_id}/errors/count", get().to(errors::count))
}
