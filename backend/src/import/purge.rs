use crate::db::schema::{self, STAGING_PREFIX};
use crate::error::ImportError;
use crate::import::staging::staging_table_name;
use crate::import::{error_ledger, job_store};
use chrono::{DateTime, Duration, Utc};
use common::model::import_job::PurgeReport;
use log::{info, warn};
use rusqlite::Connection;
use std::io;

/// Removes terminal jobs created more than `older_than_days` before `now`,
/// together with their error records, stored uploads and any staging table
/// left behind. Staging tables whose job no longer exists are dropped too.
pub fn purge_imports(
    conn: &Connection,
    older_than_days: i64,
    now: DateTime<Utc>,
) -> Result<PurgeReport, ImportError> {
    if older_than_days < 0 {
        return Err(ImportError::InvalidRequest(format!(
            "older_than_days must not be negative, got {}",
            older_than_days
        )));
    }
    let threshold = Duration::try_days(older_than_days)
        .and_then(|age| now.checked_sub_signed(age))
        .ok_or_else(|| {
            ImportError::InvalidRequest(format!(
                "older_than_days is out of range, got {}",
                older_than_days
            ))
        })?;
    let mut report = PurgeReport::default();

    for job in job_store::find_expired(conn, threshold)? {
        report.errors_deleted += error_ledger::delete_session(conn, &job.session_id)?;

        let staging = job
            .staging_table_name
            .clone()
            .unwrap_or_else(|| staging_table_name(job.id));
        if schema::table_exists(conn, &staging)? {
            schema::drop_table(conn, &staging)?;
            report.staging_tables_dropped += 1;
        }

        match std::fs::remove_file(&job.upload_path) {
            Ok(()) => report.files_deleted += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Could not remove upload {} of import job {}: {}",
                job.upload_path.display(),
                job.id,
                e
            ),
        }

        report.jobs_deleted += job_store::delete(conn, job.id)?;
    }

    for table in schema::tables_with_prefix(conn, STAGING_PREFIX)? {
        let owner = table
            .strip_prefix(STAGING_PREFIX)
            .and_then(|id| id.parse::<i64>().ok());
        let orphaned = match owner {
            Some(job_id) => job_store::find(conn, job_id)?.is_none(),
            None => false,
        };
        if orphaned {
            schema::drop_table(conn, &table)?;
            report.staging_tables_dropped += 1;
        }
    }

    info!(
        "Purged {} import jobs older than {} days ({} error records, {} files, {} staging tables)",
        report.jobs_deleted,
        older_than_days,
        report.errors_deleted,
        report.files_deleted,
        report.staging_tables_dropped
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::import::job_store::{phase, test_support::new_job};
    use common::jobs::ImportStatus;

    #[test]
    fn purges_only_old_terminal_jobs() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();

        let upload = dir.path().join("old.csv");
        std::fs::write(&upload, "1,99312345678,A,B,,,,\n").unwrap();
        let old = job_store::create(&conn, &new_job("imp_old", upload.clone())).unwrap();
        job_store::transition(&conn, old.id, ImportStatus::Cancelled, phase::CANCELLED).unwrap();
        error_ledger::record(&conn, Some(old.id), "imp_old", 1, "bad", None).unwrap();

        let active = job_store::create(&conn, &new_job("imp_active", dir.path().join("b.csv"))).unwrap();
        conn.execute_batch(&schema::subscriber_table_ddl(&staging_table_name(9_999)))
            .unwrap();

        let later = Utc::now() + Duration::days(40);
        let report = purge_imports(&conn, 30, later).unwrap();
        assert_eq!(
            report,
            PurgeReport {
                jobs_deleted: 1,
                errors_deleted: 1,
                files_deleted: 1,
                staging_tables_dropped: 1,
            }
        );
        assert!(!upload.exists());
        assert!(job_store::find(&conn, old.id).unwrap().is_none());
        assert!(job_store::find(&conn, active.id).unwrap().is_some());
        assert_eq!(error_ledger::count(&conn, "imp_old").unwrap(), 0);
    }

    #[test]
    fn recent_jobs_survive() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = job_store::create(&conn, &new_job("imp_new", dir.path().join("a.csv"))).unwrap();
        job_store::transition(&conn, job.id, ImportStatus::Cancelled, phase::CANCELLED).unwrap();

        let report = purge_imports(&conn, 30, Utc::now()).unwrap();
        assert_eq!(report.jobs_deleted, 0);
        assert!(purge_imports(&conn, -1, Utc::now()).is_err());
    }

    #[test]
    fn huge_ages_are_rejected_not_panicking() {
        let (_dir, db) = temp_database();
        let conn = db.connect().unwrap();

        let err = purge_imports(&conn, 100_000_000, Utc::now()).unwrap_err();
        assert!(matches!(err, ImportError::InvalidRequest(_)));
        assert!(err.is_bad_request());
        assert!(purge_imports(&conn, i64::MAX, Utc::now()).is_err());
    }
}
