use std::path::Path;

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::error::DocSweepError;

pub const DB_FILENAME: &str = "docsweep.db";
const SCHEMA_VERSION: &str = "1";

const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS endpoints (
    endpoint_id INTEGER PRIMARY KEY AUTOINCREMENT,
    address TEXT NOT NULL,
    label TEXT NOT NULL,
    hostname TEXT NOT NULL UNIQUE COLLATE NOCASE,
    last_seen INTEGER,
    last_metrics_update INTEGER,
    metrics TEXT
);

CREATE TABLE IF NOT EXISTS schedules (
    schedule_id INTEGER PRIMARY KEY AUTOINCREMENT,
    schedule_name TEXT NOT NULL,
    schedule_type INTEGER NOT NULL,
    time_of_day TEXT NOT NULL,
    days_of_week TEXT,
    day_of_month INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    endpoint_ids TEXT NOT NULL,
    email_recipients TEXT NOT NULL DEFAULT '[]',
    last_run INTEGER,
    next_run INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_schedules_next_run ON schedules (enabled, next_run);

INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', '1');
"#;

pub type PooledConn = PooledConnection<SqliteConnectionManager>;

/// Pooled access to the controller's SQLite database
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (creating if needed) the database in `db_folder`
    pub fn open(db_folder: &Path) -> Result<Self, DocSweepError> {
        std::fs::create_dir_all(db_folder)?;
        let db_path = db_folder.join(DB_FILENAME);

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder().max_size(8).build(manager)?;

        let db = Database { pool };
        db.ensure_schema()?;
        info!("Database opened at: {}", db_path.display());

        Ok(db)
    }

    pub fn get_connection(&self) -> Result<PooledConn, DocSweepError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), DocSweepError> {
        let conn = self.get_connection()?;
        conn.execute_batch(CREATE_SCHEMA_SQL)?;

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()),
            Some(other) => Err(DocSweepError::Error(format!(
                "Schema version mismatch: found {}, expected {}",
                other, SCHEMA_VERSION
            ))),
            None => Err(DocSweepError::Error("Schema version missing".to_string())),
        }
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction, committing on success
    pub fn immediate_transaction<T, F>(conn: &Connection, f: F) -> Result<T, DocSweepError>
    where
        F: FnOnce(&Connection) -> Result<T, DocSweepError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                    log::error!("Failed to roll back transaction: {}", rollback_err);
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema_and_reopens() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");

        let db = Database::open(dir.path()).expect("Failed to open database");
        let conn = db.get_connection().unwrap();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name IN ('endpoints', 'schedules')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 2);
        drop(conn);
        drop(db);

        assert!(Database::open(dir.path()).is_ok());
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path()).unwrap();
        let conn = db.get_connection().unwrap();

        let result: Result<(), DocSweepError> = Database::immediate_transaction(&conn, |c| {
            c.execute(
                "INSERT INTO endpoints (address, label, hostname) VALUES ('10.0.0.1', 'a', 'PC1')",
                [],
            )?;
            Err(DocSweepError::Error("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT count(*) FROM endpoints", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
