//! SQLite access.
//!
//! The database file is the only state shared between the HTTP handlers and
//! the import workers. Each unit of work opens its own `Connection`; control
//! flags written by a handler are observed by the worker on its next
//! checkpoint read.

pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct Database {
    path: PathBuf,
}

impl Database {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connect(&self) -> rusqlite::Result<Connection> {
        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Opens a connection and makes sure the bookkeeping and live tables exist.
    pub fn init(&self) -> rusqlite::Result<()> {
        let conn = self.connect()?;
        schema::init(&conn)
    }
}
