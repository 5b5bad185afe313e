pub mod archive;
pub mod import_error;
pub mod import_job;
