//! SQLite-backed datastore
//!
//! Raw decoded records are buffered in memory by `store` (non-blocking,
//! safe from any number of parse workers) and written in one
//! transaction by `flush`. Secondary indexes are built once, after the
//! bulk load, by `build_indexes`.
//!
//! All records live in a single table keyed by (database, collection);
//! connection records additionally carry their source and destination
//! so strobe extraction can bulk-delete by pair.

use crate::decode::LogRecord;
use crate::store::error::{StoreError, StoreResult};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// One decoded record addressed at a (database, collection) target
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub database: String,
    pub collection: String,
    /// Source address, for connection records
    pub source: Option<String>,
    /// Destination address, for connection records
    pub destination: Option<String>,
    /// JSON body of the decoded record
    pub body: String,
}

impl RawRecord {
    /// Build a storable record from a decoded log record.
    pub fn from_record(
        record: &LogRecord,
        database: &str,
        collection: &str,
    ) -> StoreResult<Self> {
        let (source, destination) = match record {
            LogRecord::Conn(conn) => {
                (Some(conn.source.clone()), Some(conn.destination.clone()))
            }
            _ => (None, None),
        };

        Ok(Self {
            database: database.to_string(),
            collection: collection.to_string(),
            source,
            destination,
            body: serde_json::to_string(record)?,
        })
    }
}

/// The persistence boundary for raw decoded records
///
/// `store` must be safe to call concurrently from multiple parse
/// workers and must not block on persistence; `flush` is the only
/// point at which buffered records become durable.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Accept one record for later persistence. Non-blocking.
    fn store(&self, record: RawRecord);

    /// Durably write every previously stored record.
    async fn flush(&self) -> StoreResult<()>;

    /// Build or rebuild secondary indexes after a bulk load.
    async fn build_indexes(&self) -> StoreResult<()>;
}

/// SQLite implementation of the datastore
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    buffer: Mutex<Vec<RawRecord>>,
    path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the store at the given path and bootstrap the
    /// table schema.
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Self::open_connection(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS raw_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                db TEXT NOT NULL,
                collection TEXT NOT NULL,
                source TEXT,
                destination TEXT,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS uconn (
                db TEXT NOT NULL,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                is_local_src INTEGER NOT NULL,
                is_local_dst INTEGER NOT NULL,
                connection_count INTEGER NOT NULL,
                total_bytes INTEGER NOT NULL,
                avg_bytes REAL NOT NULL,
                total_duration REAL NOT NULL,
                max_duration REAL NOT NULL,
                ts_list TEXT NOT NULL,
                orig_bytes_list TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS host (
                db TEXT NOT NULL,
                ip TEXT NOT NULL,
                local INTEGER NOT NULL,
                ipv4 INTEGER NOT NULL,
                max_duration REAL NOT NULL,
                ipv4_binary INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS exploded_dns (
                db TEXT NOT NULL,
                domain TEXT NOT NULL,
                query_count INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS hostname (
                db TEXT NOT NULL,
                domain TEXT NOT NULL,
                ips TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS freq (
                db TEXT NOT NULL,
                src TEXT NOT NULL,
                dst TEXT NOT NULL,
                connection_count INTEGER NOT NULL
            );",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            buffer: Mutex::new(Vec::new()),
            path,
        })
    }

    /// Open an independent connection to the same database file.
    ///
    /// Writer-pool workers call this so each worker owns its own
    /// session for the lifetime of the pool.
    pub fn open_connection(path: &Path) -> StoreResult<Connection> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(conn)
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared handle to the primary connection, for the repositories.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock_conn(&self) -> StoreResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Serialization(format!("connection lock poisoned: {e}")))
    }

    /// Delete every raw conn entry matching one of the given
    /// (source, destination) selectors. Returns rows deleted.
    pub fn bulk_delete_conns(
        &self,
        database: &str,
        selectors: &[(String, String)],
    ) -> StoreResult<usize> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let mut deleted = 0usize;
        {
            let mut stmt = tx.prepare(
                "DELETE FROM raw_records
                 WHERE db = ?1 AND collection = 'conn'
                   AND source = ?2 AND destination = ?3",
            )?;
            for (src, dst) in selectors {
                deleted += stmt.execute(params![database, src, dst])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Number of stored raw records for a (database, collection).
    pub fn raw_record_count(&self, database: &str, collection: &str) -> StoreResult<i64> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM raw_records WHERE db = ?1 AND collection = ?2",
            params![database, collection],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Number of stored raw conn records for one pair.
    pub fn raw_conn_count(
        &self,
        database: &str,
        src: &str,
        dst: &str,
    ) -> StoreResult<i64> {
        let conn = self.lock_conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM raw_records
             WHERE db = ?1 AND collection = 'conn'
               AND source = ?2 AND destination = ?3",
            params![database, src, dst],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[async_trait]
impl Datastore for SqliteStore {
    fn store(&self, record: RawRecord) {
        // Buffer only; durability happens at flush().
        self.buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    async fn flush(&self) -> StoreResult<()> {
        let pending = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *buffer)
        };

        if pending.is_empty() {
            return Ok(());
        }

        tracing::debug!(records = pending.len(), "Flushing raw records");

        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO raw_records (db, collection, source, destination, body)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for record in &pending {
                stmt.execute(params![
                    record.database,
                    record.collection,
                    record.source,
                    record.destination,
                    record.body,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    async fn build_indexes(&self) -> StoreResult<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "CREATE INDEX IF NOT EXISTS idx_raw_target
                 ON raw_records (db, collection);
             CREATE INDEX IF NOT EXISTS idx_raw_pair
                 ON raw_records (source, destination);",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::{ConnRecord, LogRecord};
    use tempfile::tempdir;

    fn conn_record(src: &str, dst: &str) -> LogRecord {
        LogRecord::Conn(ConnRecord {
            timestamp: 1000,
            source: src.to_string(),
            destination: dst.to_string(),
            local_orig: true,
            local_resp: false,
            duration: 0.5,
            orig_ip_bytes: 100,
            resp_ip_bytes: 200,
        })
    }

    #[tokio::test]
    async fn test_store_flush_and_count() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.db")).unwrap();

        for _ in 0..5 {
            let record = RawRecord::from_record(&conn_record("a", "b"), "testdb", "conn").unwrap();
            store.store(record);
        }

        // Nothing visible before flush
        assert_eq!(store.raw_record_count("testdb", "conn").unwrap(), 0);

        store.flush().await.unwrap();
        assert_eq!(store.raw_record_count("testdb", "conn").unwrap(), 5);
        assert_eq!(store.raw_conn_count("testdb", "a", "b").unwrap(), 5);

        store.build_indexes().await.unwrap();
    }

    #[tokio::test]
    async fn test_bulk_delete_conns() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.db")).unwrap();

        for _ in 0..3 {
            store.store(RawRecord::from_record(&conn_record("a", "b"), "db", "conn").unwrap());
        }
        store.store(RawRecord::from_record(&conn_record("c", "d"), "db", "conn").unwrap());
        store.flush().await.unwrap();

        let deleted = store
            .bulk_delete_conns("db", &[("a".to_string(), "b".to_string())])
            .unwrap();

        assert_eq!(deleted, 3);
        assert_eq!(store.raw_conn_count("db", "a", "b").unwrap(), 0);
        assert_eq!(store.raw_conn_count("db", "c", "d").unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_store_is_safe() {
        let dir = tempdir().unwrap();
        let store = std::sync::Arc::new(SqliteStore::open(dir.path().join("store.db")).unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = std::sync::Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let record =
                        RawRecord::from_record(&conn_record("a", "b"), "db", "conn").unwrap();
                    store.store(record);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        store.flush().await.unwrap();
        assert_eq!(store.raw_record_count("db", "conn").unwrap(), 400);
    }
}
