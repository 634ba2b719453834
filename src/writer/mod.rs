//! Asynchronous writer pool
//!
//! A reusable, channel-fed pool of persistence workers. Producers call
//! `submit` and move on; persistence happens on blocking-pool worker
//! threads, each of which owns an independent store session for the
//! lifetime of the pool. Every dequeued update applies the primary upsert first, then
//! the host-summary upsert; failures are logged and the worker moves to
//! the next item — there is no retry.
//!
//! The queue is bounded, so `submit` applies backpressure once the
//! capacity is reached. `close` is the only synchronization point
//! between producers and the pool: it signals end of submissions and
//! waits for every worker to drain the queue and exit.

use crate::aggregate::UconnPair;
use crate::store::{bump_host_duration, upsert_uconn_row, SqliteStore, StoreResult};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One document destined for a target collection
#[derive(Debug, Clone)]
pub enum WriterDoc {
    /// Full connection-pair aggregate row
    Uconn(UconnPair),
    /// Raise a host's stored max duration
    HostDuration { ip: String, max_duration: f64 },
    /// Nothing to write; keeps an update's second slot explicit
    None,
}

/// A unit of persistence work: a primary update plus a related
/// host-summary update, applied together by one worker
#[derive(Debug, Clone)]
pub struct WriterUpdate {
    pub primary: WriterDoc,
    pub host_summary: WriterDoc,
}

/// A store session owned by exactly one writer worker
pub trait WriterSession: Send + 'static {
    /// Apply one document to the named collection.
    fn apply(&mut self, collection: &str, doc: &WriterDoc) -> StoreResult<()>;
}

/// Writer session backed by its own SQLite connection
pub struct SqliteWriterSession {
    conn: Connection,
    database: String,
}

impl SqliteWriterSession {
    /// Open an independent connection to the store file.
    pub fn open(store_path: &Path, database: &str) -> StoreResult<Self> {
        Ok(Self {
            conn: SqliteStore::open_connection(store_path)?,
            database: database.to_string(),
        })
    }
}

impl WriterSession for SqliteWriterSession {
    fn apply(&mut self, _collection: &str, doc: &WriterDoc) -> StoreResult<()> {
        match doc {
            WriterDoc::Uconn(pair) => upsert_uconn_row(&self.conn, &self.database, pair),
            WriterDoc::HostDuration { ip, max_duration } => {
                bump_host_duration(&self.conn, &self.database, ip, *max_duration)
            }
            WriterDoc::None => Ok(()),
        }
    }
}

/// Channel-fed pool of persistence workers for one target collection
pub struct WriterPool {
    collection: String,
    tx: Option<mpsc::Sender<WriterUpdate>>,
    handles: Vec<JoinHandle<()>>,
}

impl WriterPool {
    /// Start a pool of `workers` feeding the named collection.
    ///
    /// `session_factory` is called once per worker; each worker keeps
    /// its session for the lifetime of the pool. The workers run on
    /// the blocking thread pool, like the indexing and parse stages,
    /// so their store sessions never occupy an executor thread.
    pub fn start<S, F>(
        collection: &str,
        host_collection: &str,
        workers: usize,
        capacity: usize,
        session_factory: F,
    ) -> StoreResult<Self>
    where
        S: WriterSession,
        F: Fn() -> StoreResult<S>,
    {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel::<WriterUpdate>(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for worker in 0..workers {
            let mut session = session_factory()?;
            let rx = Arc::clone(&rx);
            let collection = collection.to_string();
            let host_collection = host_collection.to_string();

            handles.push(tokio::task::spawn_blocking(move || loop {
                // The lock scope covers the receive only; upserts run
                // unlocked so workers persist in parallel.
                let update = {
                    let mut rx = rx.lock().unwrap_or_else(|e| e.into_inner());
                    rx.blocking_recv()
                };
                let Some(update) = update else { break };

                if let Err(e) = session.apply(&collection, &update.primary) {
                    tracing::error!(
                        worker,
                        collection = %collection,
                        error = %e,
                        "Writer upsert failed"
                    );
                }
                if let Err(e) = session.apply(&host_collection, &update.host_summary) {
                    tracing::error!(
                        worker,
                        collection = %host_collection,
                        error = %e,
                        "Host summary upsert failed"
                    );
                }
            }));
        }

        Ok(Self {
            collection: collection.to_string(),
            tx: Some(tx),
            handles,
        })
    }

    /// Enqueue one update. Returns as soon as the update is queued;
    /// awaits only when the queue is at capacity.
    pub async fn submit(&self, update: WriterUpdate) {
        if let Some(tx) = &self.tx {
            if tx.send(update).await.is_err() {
                tracing::error!(collection = %self.collection, "Writer pool already closed");
            }
        }
    }

    /// Signal end of submissions and wait for every worker to drain
    /// the queue and exit.
    pub async fn close(mut self) {
        self.tx.take();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Writer worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HostRepository, UconnRepository};
    use tempfile::tempdir;

    fn prepare(store: &SqliteStore) {
        UconnRepository::new(store.connection(), "db")
            .create_indexes()
            .unwrap();
        HostRepository::new(store.connection(), "db")
            .create_indexes()
            .unwrap();
    }

    fn pair(src: &str, dst: &str, count: i64, max_duration: f64) -> UconnPair {
        UconnPair {
            src: src.to_string(),
            dst: dst.to_string(),
            connection_count: count,
            max_duration,
            ts_list: vec![1],
            orig_bytes_list: vec![1],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pool_applies_primary_and_host_summary() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.db")).unwrap();
        prepare(&store);
        let path = store.path().to_path_buf();

        let pool = WriterPool::start("uconn", "host", 2, 16, || {
            SqliteWriterSession::open(&path, "db")
        })
        .unwrap();

        for i in 0..20 {
            let p = pair(&format!("10.0.0.{i}"), "192.0.2.1", i + 1, 1.5);
            pool.submit(WriterUpdate {
                host_summary: WriterDoc::HostDuration {
                    ip: p.src.clone(),
                    max_duration: p.max_duration,
                },
                primary: WriterDoc::Uconn(p),
            })
            .await;
        }
        pool.close().await;

        let repo = UconnRepository::new(store.connection(), "db");
        assert_eq!(repo.count().unwrap(), 20);
        let stored = repo.get("10.0.0.3", "192.0.2.1").unwrap().unwrap();
        assert_eq!(stored.connection_count, 4);

        let host_repo = crate::store::HostRepository::new(store.connection(), "db");
        let host = host_repo.get("10.0.0.3").unwrap().unwrap();
        assert_eq!(host.max_duration, 1.5);
    }

    #[tokio::test]
    async fn test_close_wakes_idle_workers() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.db")).unwrap();
        prepare(&store);
        let path = store.path().to_path_buf();

        let pool = WriterPool::start("uconn", "host", 4, 4, || {
            SqliteWriterSession::open(&path, "db")
        })
        .unwrap();

        // No submissions: close must still unblock every worker parked
        // on the empty queue
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_drains_everything_queued() {
        let dir = tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("store.db")).unwrap();
        prepare(&store);
        let path = store.path().to_path_buf();

        // Single worker, tiny queue: submissions backpressure but all land
        let pool = WriterPool::start("uconn", "host", 1, 2, || {
            SqliteWriterSession::open(&path, "db")
        })
        .unwrap();

        for i in 0..50 {
            pool.submit(WriterUpdate {
                primary: WriterDoc::Uconn(pair(&format!("h{i}"), "x", 1, 0.0)),
                host_summary: WriterDoc::None,
            })
            .await;
        }
        pool.close().await;

        let repo = UconnRepository::new(store.connection(), "db");
        assert_eq!(repo.count().unwrap(), 50);
    }
}
