use rusqlite::{params, Connection};

/// The live subscriber table. Only finalize writes to it.
pub const LIVE_TABLE: &str = "subscribers";
pub const STAGING_PREFIX: &str = "subscribers_staging_";
pub const ARCHIVE_PREFIX: &str = "subscribers_archive_";

/// A data column of the subscriber schema (the identity column is implicit).
#[derive(Clone, Copy, Debug)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub definition: &'static str,
    /// Maximum length in characters for text columns.
    pub max_len: Option<usize>,
}

pub const SUBSCRIBER_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec { name: "original_id", definition: "INTEGER", max_len: None },
    ColumnSpec { name: "number", definition: "TEXT NOT NULL UNIQUE", max_len: Some(20) },
    ColumnSpec { name: "last_name", definition: "TEXT NOT NULL DEFAULT ''", max_len: Some(100) },
    ColumnSpec { name: "first_name", definition: "TEXT NOT NULL DEFAULT ''", max_len: Some(100) },
    ColumnSpec { name: "middle_name", definition: "TEXT", max_len: Some(100) },
    ColumnSpec { name: "address", definition: "TEXT", max_len: Some(500) },
    ColumnSpec { name: "memo1", definition: "TEXT", max_len: Some(255) },
    ColumnSpec { name: "memo2", definition: "TEXT", max_len: Some(255) },
    ColumnSpec { name: "birth_place", definition: "TEXT", max_len: Some(255) },
    ColumnSpec { name: "birth_date", definition: "TEXT", max_len: None },
    ColumnSpec { name: "imsi", definition: "TEXT", max_len: Some(50) },
    ColumnSpec { name: "import_job_id", definition: "INTEGER", max_len: None },
    ColumnSpec { name: "created_at", definition: "TEXT NOT NULL", max_len: None },
];

pub fn max_len(column: &str) -> Option<usize> {
    SUBSCRIBER_COLUMNS
        .iter()
        .find(|c| c.name == column)
        .and_then(|c| c.max_len)
}

/// Comma-separated data column names, identity excluded.
pub fn data_column_list() -> String {
    SUBSCRIBER_COLUMNS
        .iter()
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// `CREATE TABLE` statement for a table with the subscriber schema.
pub fn subscriber_table_ddl(table: &str) -> String {
    let columns = SUBSCRIBER_COLUMNS
        .iter()
        .map(|c| format!("    {} {}", c.name, c.definition))
        .collect::<Vec<_>>()
        .join(",\n");
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    id INTEGER PRIMARY KEY AUTOINCREMENT,\n{}\n)",
        quote_ident(table),
        columns
    )
}

/// Quotes an SQL identifier. Table names here are generated, never user input,
/// but quoting keeps the statements well-formed regardless.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

const BOOKKEEPING_DDL: &str = "
CREATE TABLE IF NOT EXISTS import_jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL UNIQUE,
    file_name TEXT NOT NULL,
    file_size INTEGER NOT NULL,
    file_md5 TEXT,
    delimiter TEXT NOT NULL,
    encoding TEXT NOT NULL,
    has_header INTEGER NOT NULL,
    upload_path TEXT NOT NULL,
    status TEXT NOT NULL,
    phase TEXT NOT NULL,
    staging_table_name TEXT,
    archive_table_name TEXT,
    records_count INTEGER,
    records_created INTEGER NOT NULL DEFAULT 0,
    records_failed INTEGER NOT NULL DEFAULT 0,
    processed_rows INTEGER NOT NULL DEFAULT 0,
    progress_percent INTEGER NOT NULL DEFAULT 0,
    resume_offset INTEGER NOT NULL DEFAULT 0,
    pause_requested INTEGER NOT NULL DEFAULT 0,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    last_heartbeat_at TEXT,
    stop_reason TEXT,
    error_message TEXT,
    info_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS import_jobs_status_idx ON import_jobs(status);

CREATE TABLE IF NOT EXISTS import_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id INTEGER REFERENCES import_jobs(id) ON DELETE SET NULL,
    session_id TEXT NOT NULL,
    row_index INTEGER NOT NULL,
    message TEXT NOT NULL,
    raw_data TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS import_errors_session_row_idx ON import_errors(session_id, row_index);
CREATE INDEX IF NOT EXISTS import_errors_created_idx ON import_errors(created_at);
";

pub fn init(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(BOOKKEEPING_DDL)?;
    conn.execute_batch(&subscriber_table_ddl(LIVE_TABLE))?;
    conn.execute_batch(&format!(
        "CREATE INDEX IF NOT EXISTS subscribers_name_idx ON {} (last_name, first_name)",
        quote_ident(LIVE_TABLE)
    ))?;
    Ok(())
}

pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get::<_, i64>(0),
    )
    .map(|count| count > 0)
}

/// Names of all tables starting with `prefix`, unordered.
pub fn tables_with_prefix(conn: &Connection, prefix: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND substr(name, 1, length(?1)) = ?1",
    )?;
    let names = stmt
        .query_map(params![prefix], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

pub fn drop_table(conn: &Connection, name: &str) -> rusqlite::Result<()> {
    conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
}

pub fn row_count(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
        [],
        |row| row.get(0),
    )
}

pub fn column_count(conn: &Connection, table: &str) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM pragma_table_info(?1)",
        params![table],
        |row| row.get(0),
    )
}
