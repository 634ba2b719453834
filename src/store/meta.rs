//! File-provenance metadata store
//!
//! Records which log files have already been imported, keyed by
//! (content fingerprint, target database). The indexer checks new
//! candidates against this registry so the same file content is never
//! imported into the same logical database twice, independent of path
//! or filename changes.

use crate::store::error::StoreResult;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection};
use std::path::PathBuf;
use std::sync::Mutex;

/// One previously imported file
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFileRecord {
    /// Content fingerprint (hash of a fixed-size byte prefix)
    pub fingerprint: String,
    /// Logical database the file was imported into
    pub target_database: String,
    /// Path the file was imported from (informational only)
    pub path: String,
    /// When parsing finished
    pub parsed_at: DateTime<Utc>,
}

/// Durable registry of imported files
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Open (or create) the metadata store at the given path.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             CREATE TABLE IF NOT EXISTS parsed_files (
                fingerprint TEXT NOT NULL,
                target_db TEXT NOT NULL,
                path TEXT NOT NULL,
                parsed_at INTEGER NOT NULL,
                PRIMARY KEY (fingerprint, target_db)
             );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All previously imported file records.
    pub fn get_files(&self) -> StoreResult<Vec<ParsedFileRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT fingerprint, target_db, path, parsed_at FROM parsed_files",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(ParsedFileRecord {
                fingerprint: row.get(0)?,
                target_database: row.get(1)?,
                path: row.get(2)?,
                parsed_at: Utc
                    .timestamp_opt(row.get::<_, i64>(3)?, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
            })
        })?;

        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    /// Durably record a newly completed import batch.
    pub fn add_parsed_files(&self, files: &[ParsedFileRecord]) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO parsed_files
                    (fingerprint, target_db, path, parsed_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for file in files {
                stmt.execute(params![
                    file.fingerprint,
                    file.target_database,
                    file.path,
                    file.parsed_at.timestamp(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(fingerprint: &str, db: &str) -> ParsedFileRecord {
        ParsedFileRecord {
            fingerprint: fingerprint.to_string(),
            target_database: db.to_string(),
            path: "/logs/conn.log".to_string(),
            parsed_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let meta = MetaStore::open(dir.path().join("meta.db")).unwrap();

        assert!(meta.get_files().unwrap().is_empty());

        meta.add_parsed_files(&[record("abc123", "db1"), record("def456", "db2")])
            .unwrap();

        let files = meta.get_files().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|f| f.fingerprint == "abc123"));
    }

    #[test]
    fn test_same_fingerprint_different_database() {
        let dir = tempdir().unwrap();
        let meta = MetaStore::open(dir.path().join("meta.db")).unwrap();

        meta.add_parsed_files(&[record("abc123", "db1"), record("abc123", "db2")])
            .unwrap();

        assert_eq!(meta.get_files().unwrap().len(), 2);
    }

    #[test]
    fn test_reimport_replaces_row() {
        let dir = tempdir().unwrap();
        let meta = MetaStore::open(dir.path().join("meta.db")).unwrap();

        meta.add_parsed_files(&[record("abc123", "db1")]).unwrap();
        meta.add_parsed_files(&[record("abc123", "db1")]).unwrap();

        assert_eq!(meta.get_files().unwrap().len(), 1);
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meta.db");

        {
            let meta = MetaStore::open(&path).unwrap();
            meta.add_parsed_files(&[record("abc123", "db1")]).unwrap();
        }

        let meta = MetaStore::open(&path).unwrap();
        let files = meta.get_files().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].target_database, "db1");
    }
}
