//! Updraft Database Module
//! SQLite adapter with connection pooling

use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use thiserror::Error;

pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = PooledConnection<SqliteConnectionManager>;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to create database pool: {0}")]
    PoolError(#[from] r2d2::Error),
    #[error("SQLite error: {0}")]
    SqliteError(#[from] rusqlite::Error),
    #[error("Corrupt row in {table}: {reason}")]
    CorruptRow { table: &'static str, reason: String },
}

#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder().max_size(10).build(manager)?;

        let db = Self { pool };
        db.init_schema(true)?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self, DatabaseError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        let db = Self { pool };
        db.init_schema(false)?;
        Ok(db)
    }

    fn init_schema(&self, wal: bool) -> Result<(), DatabaseError> {
        let conn = self.pool.get()?;

        // Single-row table: the current latest artifact for this artifact family
        conn.execute(
            "CREATE TABLE IF NOT EXISTS artifact_meta (
                slot TEXT PRIMARY KEY,
                version_label TEXT NOT NULL,
                artifact_url TEXT NOT NULL,
                file_name TEXT NOT NULL,
                published_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                content_hash TEXT,
                updated_at TEXT NOT NULL,
                last_checked_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS devices (
                endpoint_token TEXT PRIMARY KEY,
                platform TEXT NOT NULL,
                app_version TEXT,
                device_id TEXT,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL
            )",
            [],
        )?;

        if wal {
            let _: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        }

        Ok(())
    }

    pub fn get_connection(&self) -> Result<DbConnection, DatabaseError> {
        Ok(self.pool.get()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_schema_created_on_disk() {
        let dir = tempdir().unwrap();
        let db = Database::new(&dir.path().join("nested").join("updraft.db")).unwrap();
        let conn = db.get_connection().unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tables, vec!["artifact_meta".to_string(), "devices".to_string()]);
    }

    #[test]
    fn test_reopen_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("updraft.db");
        Database::new(&path).unwrap();
        assert!(Database::new(&path).is_ok());
    }
}
