use crate::db::schema::{self, quote_ident, STAGING_PREFIX};
use crate::error::{ImportError, RowError, RowErrorKind};
use crate::import::job_store::{self, ImportJob};
use crate::import::record::SubscriberRecord;
use chrono::Utc;
use log::info;
use rusqlite::{params, Connection, ErrorCode};

pub fn staging_table_name(job_id: i64) -> String {
    format!("{}{}", STAGING_PREFIX, job_id)
}

/// Appends parsed records to one job's staging table. Never reads from or
/// writes to the live table.
pub struct StagingWriter {
    job_id: i64,
    table: String,
    insert_sql: String,
}

impl StagingWriter {
    /// Creates the job's staging table on first use and records its name on
    /// the job. Calling it again for the same job reuses the table.
    pub fn ensure(conn: &Connection, job: &ImportJob) -> Result<Self, ImportError> {
        let table = job
            .staging_table_name
            .clone()
            .unwrap_or_else(|| staging_table_name(job.id));

        if !schema::table_exists(conn, &table)? {
            conn.execute_batch(&schema::subscriber_table_ddl(&table))?;
            info!("Created staging table {} for import job {}", table, job.id);
        }
        if job.staging_table_name.as_deref() != Some(table.as_str()) {
            job_store::set_staging_table(conn, job.id, Some(&table))?;
        }

        let placeholders = (1..=schema::SUBSCRIBER_COLUMNS.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&table),
            schema::data_column_list(),
            placeholders
        );

        Ok(Self {
            job_id: job.id,
            table,
            insert_sql,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Inserts one record. Rejections by the store (duplicate number, type
    /// mismatch, oversized value) come back as a row error; anything else is
    /// a database failure and ends the job.
    pub fn insert(
        &self,
        conn: &Connection,
        row_index: i64,
        record: &SubscriberRecord,
        raw_line: &str,
    ) -> Result<Result<(), RowError>, ImportError> {
        let mut stmt = conn.prepare_cached(&self.insert_sql)?;
        let result = stmt.execute(params![
            record.original_id,
            sanitize(&record.number),
            sanitize(&record.last_name),
            sanitize(&record.first_name),
            record.middle_name.as_deref().map(sanitize),
            record.address.as_deref().map(sanitize),
            record.memo1.as_deref().map(sanitize),
            record.memo2.as_deref().map(sanitize),
            record.birth_place.as_deref().map(sanitize),
            record.birth_date.map(|d| d.format("%Y-%m-%d").to_string()),
            record.imsi.as_deref().map(sanitize),
            self.job_id,
            Utc::now(),
        ]);

        match result {
            Ok(_) => Ok(Ok(())),
            Err(rusqlite::Error::SqliteFailure(e, message))
                if matches!(
                    e.code,
                    ErrorCode::ConstraintViolation | ErrorCode::TypeMismatch | ErrorCode::TooBig
                ) =>
            {
                let message = message.unwrap_or_else(|| e.to_string());
                Ok(Err(RowError::new(row_index, RowErrorKind::Insert, message)
                    .with_raw(raw_line)))
            }
            Err(rusqlite::Error::ToSqlConversionFailure(e)) => Ok(Err(RowError::new(
                row_index,
                RowErrorKind::Insert,
                e.to_string(),
            )
            .with_raw(raw_line))),
            Err(e) => Err(e.into()),
        }
    }
}

/// Strips NUL characters and surrounding whitespace.
fn sanitize(value: &str) -> String {
    value.replace('\0', "").trim().to_string()
}

/// Drops a job's staging table, if any, and clears the name on the job.
pub fn drop_staging(conn: &Connection, job: &ImportJob) -> rusqlite::Result<()> {
    let table = job
        .staging_table_name
        .clone()
        .unwrap_or_else(|| staging_table_name(job.id));
    if schema::table_exists(conn, &table)? {
        schema::drop_table(conn, &table)?;
        info!("Dropped staging table {} of import job {}", table, job.id);
    }
    job_store::set_staging_table(conn, job.id, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_database;
    use crate::import::job_store::test_support::new_job;

    fn record(number: &str) -> SubscriberRecord {
        SubscriberRecord {
            original_id: Some(1),
            number: number.to_string(),
            last_name: " Ivanov\0 ".to_string(),
            first_name: "Ivan".to_string(),
            ..SubscriberRecord::default()
        }
    }

    #[test]
    fn staging_table_is_created_once() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = job_store::create(&conn, &new_job("imp_s", dir.path().join("a.csv"))).unwrap();

        let writer = StagingWriter::ensure(&conn, &job).unwrap();
        assert_eq!(writer.table(), staging_table_name(job.id));
        let job = job_store::get(&conn, job.id).unwrap();
        assert_eq!(job.staging_table_name.as_deref(), Some(writer.table()));

        writer.insert(&conn, 1, &record("99312345678"), "raw").unwrap().unwrap();
        let again = StagingWriter::ensure(&conn, &job).unwrap();
        assert_eq!(again.table(), writer.table());
        assert_eq!(schema::row_count(&conn, writer.table()).unwrap(), 1);
        assert_eq!(schema::row_count(&conn, schema::LIVE_TABLE).unwrap(), 0);
    }

    #[test]
    fn text_is_sanitized() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = job_store::create(&conn, &new_job("imp_n", dir.path().join("a.csv"))).unwrap();
        let writer = StagingWriter::ensure(&conn, &job).unwrap();
        writer.insert(&conn, 1, &record("99312345678"), "raw").unwrap().unwrap();

        let last_name: String = conn
            .query_row(
                &format!("SELECT last_name FROM {}", quote_ident(writer.table())),
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(last_name, "Ivanov");
    }

    #[test]
    fn duplicate_number_is_a_row_error() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = job_store::create(&conn, &new_job("imp_d", dir.path().join("a.csv"))).unwrap();
        let writer = StagingWriter::ensure(&conn, &job).unwrap();

        writer.insert(&conn, 1, &record("99312345678"), "first").unwrap().unwrap();
        let err = writer
            .insert(&conn, 2, &record("99312345678"), "second")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind, RowErrorKind::Insert);
        assert_eq!(err.row_index, 2);
        assert_eq!(err.raw.as_deref(), Some("second"));
    }

    #[test]
    fn drop_clears_the_job() {
        let (dir, db) = temp_database();
        let conn = db.connect().unwrap();
        let job = job_store::create(&conn, &new_job("imp_x", dir.path().join("a.csv"))).unwrap();
        let writer = StagingWriter::ensure(&conn, &job).unwrap();
        let job = job_store::get(&conn, job.id).unwrap();

        drop_staging(&conn, &job).unwrap();
        assert!(!schema::table_exists(&conn, writer.table()).unwrap());
        assert!(job_store::get(&conn, job.id)
            .unwrap()
            .staging_table_name
            .is_none());
    }
}
