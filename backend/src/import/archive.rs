//! Finalize and archive retention.
//!
//! Finalize replaces the live subscriber table with a job's staged rows,
//! keeping the previous live contents in a `subscribers_archive_<unix secs>`
//! table. Snapshot, clear, copy and staging drop run inside one SQLite
//! transaction: either all of them happen or the live table is untouched and
//! the staged rows are still there for a retry.

use crate::db::schema::{self, quote_ident, ARCHIVE_PREFIX, LIVE_TABLE};
use crate::error::ImportError;
use crate::import::job_store::{self, phase};
use chrono::Utc;
use common::jobs::ImportStatus;
use common::model::archive::{ArchiveCleanupReport, ArchiveTableInfo};
use log::{error, info, warn};
use rusqlite::{params, Connection};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub archive_table: String,
    pub rows_archived: i64,
    pub rows_loaded: i64,
}

fn archive_suffix(name: &str) -> Option<i64> {
    name.strip_prefix(ARCHIVE_PREFIX)?.parse().ok()
}

/// A fresh archive name whose timestamp sorts after every existing archive.
fn next_archive_name(conn: &Connection) -> rusqlite::Result<String> {
    let newest = schema::tables_with_prefix(conn, ARCHIVE_PREFIX)?
        .iter()
        .filter_map(|name| archive_suffix(name))
        .max();
    let mut stamp = Utc::now().timestamp();
    if let Some(newest) = newest {
        stamp = stamp.max(newest + 1);
    }
    loop {
        let name = format!("{}{}", ARCHIVE_PREFIX, stamp);
        if !schema::table_exists(conn, &name)? {
            return Ok(name);
        }
        stamp += 1;
    }
}

pub fn finalize(conn: &mut Connection, job_id: i64) -> Result<FinalizeOutcome, ImportError> {
    let job = job_store::get(conn, job_id)?;
    if job.status != ImportStatus::TempCompleted {
        return Err(ImportError::NotFinalizable {
            job_id,
            reason: format!("status is '{}', expected 'temp_completed'", job.status),
        });
    }
    let staging = match job.staging_table_name.clone() {
        Some(table) if schema::table_exists(conn, &table)? => table,
        Some(table) => {
            return Err(ImportError::NotFinalizable {
                job_id,
                reason: format!("staging table {} does not exist", table),
            })
        }
        None => {
            return Err(ImportError::NotFinalizable {
                job_id,
                reason: "no staging table recorded".to_string(),
            })
        }
    };

    job_store::transition(conn, job_id, ImportStatus::Processing, phase::FINALIZING)?;
    info!("Finalizing import job {} from {}", job_id, staging);

    match swap_in(conn, job_id, &staging) {
        Ok(outcome) => {
            job_store::transition(conn, job_id, ImportStatus::Completed, phase::FINALIZED)?;
            job_store::set_error_message(conn, job_id, None)?;
            info!(
                "Import job {} finalized: {} rows loaded, {} rows archived to {}",
                job_id, outcome.rows_loaded, outcome.rows_archived, outcome.archive_table
            );
            Ok(outcome)
        }
        Err(e) => {
            error!("Finalize of import job {} failed: {}", job_id, e);
            job_store::transition(
                conn,
                job_id,
                ImportStatus::TempCompleted,
                phase::WAITING_FINALIZATION,
            )?;
            job_store::set_error_message(conn, job_id, Some(&format!("finalize failed: {}", e)))?;
            Err(e)
        }
    }
}

fn swap_in(conn: &mut Connection, job_id: i64, staging: &str) -> Result<FinalizeOutcome, ImportError> {
    let tx = conn.transaction()?;
    let archive = next_archive_name(&tx)?;
    let columns = schema::data_column_list();

    tx.execute_batch(&schema::subscriber_table_ddl(&archive))?;
    let rows_archived = tx.execute(
        &format!(
            "INSERT INTO {} SELECT * FROM {}",
            quote_ident(&archive),
            quote_ident(LIVE_TABLE)
        ),
        [],
    )? as i64;
    tx.execute(&format!("DELETE FROM {}", quote_ident(LIVE_TABLE)), [])?;
    let rows_loaded = tx.execute(
        &format!(
            "INSERT INTO {} ({cols}) SELECT {cols} FROM {} ORDER BY id",
            quote_ident(LIVE_TABLE),
            quote_ident(staging),
            cols = columns
        ),
        [],
    )? as i64;
    schema::drop_table(&tx, staging)?;
    tx.execute(
        "UPDATE import_jobs SET archive_table_name = ?1, staging_table_name = NULL, updated_at = ?2
         WHERE id = ?3",
        params![archive, Utc::now(), job_id],
    )?;
    tx.commit()?;

    Ok(FinalizeOutcome {
        archive_table: archive,
        rows_archived,
        rows_loaded,
    })
}

/// Archive tables, newest first.
pub fn list_archives(conn: &Connection) -> rusqlite::Result<Vec<ArchiveTableInfo>> {
    let mut names = schema::tables_with_prefix(conn, ARCHIVE_PREFIX)?;
    names.sort_by(|a, b| {
        archive_suffix(b)
            .cmp(&archive_suffix(a))
            .then_with(|| b.cmp(a))
    });

    names
        .into_iter()
        .map(|name| {
            Ok(ArchiveTableInfo {
                columns: schema::column_count(conn, &name)?,
                rows: schema::row_count(conn, &name)?,
                name,
            })
        })
        .collect()
}

/// Keeps the `keep` newest archive tables and drops the rest. With
/// `dry_run` nothing is dropped and the report says what would be.
pub fn cleanup_archives(
    conn: &Connection,
    keep: usize,
    dry_run: bool,
) -> rusqlite::Result<ArchiveCleanupReport> {
    let archives = list_archives(conn)?;
    let mut report = ArchiveCleanupReport {
        dry_run,
        ..ArchiveCleanupReport::default()
    };

    for (idx, archive) in archives.into_iter().enumerate() {
        if idx < keep {
            report.kept_tables.push(archive.name);
            continue;
        }
        if !dry_run {
            schema::drop_table(conn, &archive.name)?;
            info!("Dropped archive table {} ({} rows)", archive.name, archive.rows);
        }
        report.deleted_tables.push(archive.name);
    }

    report.total_kept = report.kept_tables.len();
    report.total_deleted = report.deleted_tables.len();
    if report.total_deleted > 0 && dry_run {
        warn!(
            "Dry run: {} archive tables would be deleted",
            report.total_deleted
        );
    }
    Ok(report)
}

pub fn cleanup_summary(report: &ArchiveCleanupReport) -> String {
    format!(
        "Kept {} archive tables, deleted {}",
        report.total_kept, report.total_deleted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::import::job_store::test_support::new_job;
    use crate::import::record::SubscriberRecord;
    use crate::import::staging::StagingWriter;

    fn live_numbers(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare(&format!("SELECT number FROM {} ORDER BY id", LIVE_TABLE))
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn seed_live(conn: &Connection, numbers: &[&str]) {
        for number in numbers {
            conn.execute(
                "INSERT INTO subscribers (number, last_name, first_name, created_at) VALUES (?1, 'Old', 'Row', ?2)",
                params![number, Utc::now()],
            )
            .unwrap();
        }
    }

    fn staged_job(conn: &Connection, dir: &std::path::Path, numbers: &[&str]) -> i64 {
        let job = job_store::create(conn, &new_job("imp_fin", dir.join("a.csv"))).unwrap();
        let writer = StagingWriter::ensure(conn, &job).unwrap();
        for (i, number) in numbers.iter().enumerate() {
            let record = SubscriberRecord {
                number: number.to_string(),
                ..SubscriberRecord::default()
            };
            writer.insert(conn, i as i64 + 1, &record, number).unwrap().unwrap();
        }
        job_store::transition(conn, job.id, ImportStatus::Processing, phase::STAGING).unwrap();
        job_store::transition(
            conn,
            job.id,
            ImportStatus::TempCompleted,
            phase::WAITING_FINALIZATION,
        )
        .unwrap();
        job.id
    }

    #[test]
    fn finalize_swaps_staging_into_live() {
        let (dir, db) = temp_database();
        let mut conn = db.connect().unwrap();
        seed_live(&conn, &["99300000001", "99300000002"]);
        let job_id = staged_job(&conn, dir.path(), &["99311111111", "99322222222", "99333333333"]);
        let staging = job_store::get(&conn, job_id).unwrap().staging_table_name.unwrap();

        let outcome = finalize(&mut conn, job_id).unwrap();
        assert_eq!(outcome.rows_loaded, 3);
        assert_eq!(outcome.rows_archived, 2);

        assert_eq!(
            live_numbers(&conn),
            vec!["99311111111", "99322222222", "99333333333"]
        );
        assert_eq!(schema::row_count(&conn, &outcome.archive_table).unwrap(), 2);
        assert!(!schema::table_exists(&conn, &staging).unwrap());
        assert_eq!(list_archives(&conn).unwrap().len(), 1);

        let job = job_store::get(&conn, job_id).unwrap();
        assert_eq!(job.status, ImportStatus::Completed);
        assert_eq!(job.archive_table_name.as_deref(), Some(outcome.archive_table.as_str()));
        assert!(job.staging_table_name.is_none());
    }

    #[test]
    fn finalize_requires_temp_completed() {
        let (dir, db) = temp_database();
        let mut conn = db.connect().unwrap();
        let job = job_store::create(&conn, &new_job("imp_nf", dir.path().join("a.csv"))).unwrap();
        let err = finalize(&mut conn, job.id).unwrap_err();
        assert!(matches!(err, ImportError::NotFinalizable { .. }));
        assert!(err.is_conflict());
    }

    #[test]
    fn failed_finalize_keeps_live_and_staging() {
        let (dir, db) = temp_database();
        let mut conn = db.connect().unwrap();
        seed_live(&conn, &["99300000001"]);
        let job_id = staged_job(&conn, dir.path(), &["99311111111"]);
        let staging = job_store::get(&conn, job_id).unwrap().staging_table_name.unwrap();
        conn.execute_batch(
            "CREATE TRIGGER reject_load BEFORE INSERT ON subscribers
             WHEN NEW.number = '99311111111'
             BEGIN SELECT RAISE(ABORT, 'load rejected'); END;",
        )
        .unwrap();

        assert!(finalize(&mut conn, job_id).is_err());
        assert_eq!(live_numbers(&conn), vec!["99300000001"]);
        assert!(schema::table_exists(&conn, &staging).unwrap());
        assert!(list_archives(&conn).unwrap().is_empty());

        let job = job_store::get(&conn, job_id).unwrap();
        assert_eq!(job.status, ImportStatus::TempCompleted);
        assert!(job.error_message.unwrap().contains("load rejected"));
    }

    #[test]
    fn cleanup_keeps_the_newest() {
        let (_dir, db) = temp_database();
        let conn = db.connect().unwrap();
        for stamp in [1_700_000_300, 1_700_000_100, 1_700_000_500, 1_700_000_200, 1_700_000_400] {
            conn.execute_batch(&schema::subscriber_table_ddl(&format!(
                "{}{}",
                ARCHIVE_PREFIX, stamp
            )))
            .unwrap();
        }

        let dry = cleanup_archives(&conn, 3, true).unwrap();
        assert_eq!(dry.total_deleted, 2);
        assert_eq!(list_archives(&conn).unwrap().len(), 5);

        let report = cleanup_archives(&conn, 3, false).unwrap();
        assert_eq!(
            report.kept_tables,
            vec![
                "subscribers_archive_1700000500",
                "subscribers_archive_1700000400",
                "subscribers_archive_1700000300"
            ]
        );
        assert_eq!(
            report.deleted_tables,
            vec!["subscribers_archive_1700000200", "subscribers_archive_1700000100"]
        );
        let remaining: Vec<String> = list_archives(&conn)
            .unwrap()
            .into_iter()
            .map(|a| a.name)
            .collect();
        assert_eq!(remaining, report.kept_tables);
        assert_eq!(cleanup_summary(&report), "Kept 3 archive tables, deleted 2");
    }

    #[test]
    fn archive_names_stay_ordered() {
        let (_dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let future = Utc::now().timestamp() + 1000;
        conn.execute_batch(&schema::subscriber_table_ddl(&format!(
            "{}{}",
            ARCHIVE_PREFIX, future
        )))
        .unwrap();
        let next = next_archive_name(&conn).unwrap();
        assert_eq!(next, format!("{}{}", ARCHIVE_PREFIX, future + 1));
    }
}
