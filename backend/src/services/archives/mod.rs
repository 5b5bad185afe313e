//! # Archive Service Module
//!
//! Archive tables are frozen copies of the live subscriber table taken by
//! finalize. These routes list them and prune them.
//!
//! ## Registered Routes:
//!
//! *   **`GET /api/archives`**: every archive table, newest first, with its
//!     column and row counts.
//! *   **`POST /api/archives/cleanup?keep=&dry_run=`**: keeps the `keep`
//!     newest archives (default from `IMPORT_ARCHIVE_KEEP`) and drops the
//!     rest. With `dry_run=true` nothing is dropped.

mod cleanup;
mod list;

use actix_web::web::{get, post, scope};
use actix_web::Scope;

const API_PATH: &str = "/api/archives";

pub fn configure_routes() -> Scope {
    scope(API_PATH)
        .route("", get().to(list::process))
        .route("/cleanup", post().to(cleanup::process))
}
