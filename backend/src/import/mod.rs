//! The subscriber import pipeline: line reconstruction, record parsing,
//! staging, the error ledger, finalize and retention.
//!
//! Everything here is synchronous and works on a borrowed
//! `rusqlite::Connection`; scheduling lives in `job_controller`.

pub mod archive;
pub mod encoding;
pub mod error_ledger;
pub mod job_store;
pub mod purge;
pub mod reconstructor;
pub mod record;
pub mod staging;
pub mod submit;
