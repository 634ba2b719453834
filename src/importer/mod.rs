//! Import orchestration
//!
//! `Importer::run` drives one full import of a directory of log files
//! into a logical database, in fixed stage order:
//!
//! 1. discover and index candidate files, dropping any already imported
//! 2. decode every data line on a parse worker pool, folding conn and
//!    DNS records into the shared aggregation session while raw records
//!    stream into the datastore buffer
//! 3. persist the DNS-derived aggregates
//! 4. flush the datastore, then extract strobe pairs
//! 5. build the uconn collection through the writer pool
//! 6. build the host collection from the surviving pairs
//! 7. record file provenance and build datastore indexes
//!
//! A file that was fully parsed is only recorded as imported after the
//! whole run reaches the provenance stage; a run that dies midway will
//! re-parse its files next time.

use crate::aggregate::{extract_strobes, AggregationSession, ConnDisposition, StrobeStats};
use crate::config::ImportConfig;
use crate::decode::LogRecord;
use crate::indexer::{self, IndexedFile};
use crate::store::{
    Datastore, ExplodedDnsRepository, FrequencyRepository, HostRepository, HostnameRepository,
    MetaStore, RawRecord, SqliteStore, StoreError, UconnRepository,
};
use crate::writer::{SqliteWriterSession, WriterDoc, WriterPool, WriterUpdate};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Errors that abort an import run
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("import worker panicked: {0}")]
    WorkerPanic(String),
}

/// Counters reported after a completed run
#[derive(Debug, Default)]
pub struct ImportStats {
    /// Candidate files found under the import root
    pub files_discovered: usize,
    /// Files parsed by this run (after dedup)
    pub files_imported: usize,
    /// Data lines decoded into records
    pub records_decoded: u64,
    /// Data lines dropped by per-line decode errors
    pub decode_failures: u64,
    /// Connection pairs written to the uconn collection
    pub uconn_pairs: usize,
    /// Host rows written by the host builder
    pub hosts_written: usize,
    /// Distinct domains written to the exploded-dns collection
    pub domains: usize,
    /// Strobe extraction outcome
    pub strobes: StrobeStats,
}

/// One import run against one logical database
pub struct Importer {
    config: ImportConfig,
    database: String,
    store: Arc<SqliteStore>,
    meta: MetaStore,
}

impl Importer {
    pub fn new(
        config: ImportConfig,
        database: &str,
        store: Arc<SqliteStore>,
        meta: MetaStore,
    ) -> Self {
        Self {
            config,
            database: database.to_string(),
            store,
            meta,
        }
    }

    /// Import every new log file under `root`.
    pub async fn run(&self, root: &Path) -> Result<ImportStats, ImportError> {
        let mut stats = ImportStats::default();
        let run_start = Instant::now();

        // Stage 1: discovery, indexing, dedup
        let stage = Instant::now();
        let candidates = indexer::walk_log_files(root);
        stats.files_discovered = candidates.len();

        let indexed = indexer::index_files(
            candidates,
            self.config.indexing_threads,
            &self.database,
        )
        .await;
        let previous = self.meta.get_files()?;
        let mut files = indexer::remove_already_imported(indexed, &previous);
        tracing::info!(
            discovered = stats.files_discovered,
            new = files.len(),
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Indexed log files"
        );

        if files.is_empty() {
            tracing::info!("No new files to import");
            return Ok(stats);
        }
        stats.files_imported = files.len();

        // Stage 2: parse and aggregate
        let stage = Instant::now();
        let session = Arc::new(AggregationSession::new(
            self.config.connection_limit,
            self.config.avg_bytes_mode(),
        ));
        let (decoded, failures) = self.parse_files(&mut files, Arc::clone(&session)).await?;
        stats.records_decoded = decoded;
        stats.decode_failures = failures;
        tracing::info!(
            records = decoded,
            failures,
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Parsed log files"
        );

        let session = Arc::try_unwrap(session)
            .map_err(|_| ImportError::WorkerPanic("aggregation session still shared".into()))?;
        let mut output = session.finish();

        // Stage 3: DNS-derived aggregates
        let stage = Instant::now();
        stats.domains = output.domain_counts.len();
        let dns_repo = ExplodedDnsRepository::new(self.store.connection(), &self.database);
        dns_repo.create_indexes()?;
        dns_repo.upsert(&output.domain_counts)?;

        let hostname_repo = HostnameRepository::new(self.store.connection(), &self.database);
        hostname_repo.create_indexes()?;
        hostname_repo.upsert(&output.hostnames)?;
        tracing::info!(
            domains = stats.domains,
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Wrote DNS aggregates"
        );

        // Stage 4: flush, then strobe extraction. The bulk delete must
        // see every raw record, so the flush comes first.
        let stage = Instant::now();
        self.store.flush().await?;

        let freq_repo = FrequencyRepository::new(self.store.connection(), &self.database);
        stats.strobes = extract_strobes(
            &self.database,
            &output.strobes,
            &mut output.uconns,
            &freq_repo,
            &self.store,
        )?;
        tracing::info!(
            strobes = stats.strobes.pairs_extracted,
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Flushed datastore and extracted strobes"
        );

        // Stage 5: uconn collection, through the writer pool
        let stage = Instant::now();
        stats.uconn_pairs = output.uconns.len();
        let uconn_repo = UconnRepository::new(self.store.connection(), &self.database);
        uconn_repo.create_indexes()?;
        let host_repo = HostRepository::new(self.store.connection(), &self.database);
        host_repo.create_indexes()?;

        let store_path = self.store.path().to_path_buf();
        let database = self.database.clone();
        let pool = WriterPool::start(
            "uconn",
            "host",
            self.config.writer_workers,
            self.config.writer_queue_capacity,
            move || SqliteWriterSession::open(&store_path, &database),
        )?;
        for pair in output.uconns.values() {
            pool.submit(WriterUpdate {
                host_summary: WriterDoc::HostDuration {
                    ip: pair.src.clone(),
                    max_duration: pair.max_duration,
                },
                primary: WriterDoc::Uconn(pair.clone()),
            })
            .await;
        }
        pool.close().await;
        tracing::info!(
            pairs = stats.uconn_pairs,
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Built uconn collection"
        );

        // Stage 6: host collection. Every pair contributes both of its
        // endpoints, with role-specific locality.
        let stage = Instant::now();
        for pair in output.uconns.values() {
            if host_repo.upsert(pair, true)? {
                stats.hosts_written += 1;
            }
            if host_repo.upsert(pair, false)? {
                stats.hosts_written += 1;
            }
        }
        tracing::info!(
            hosts = stats.hosts_written,
            elapsed_ms = stage.elapsed().as_millis() as u64,
            "Built host collection"
        );

        // Stage 7: provenance and datastore indexes. A file the parse
        // stage never finished carries no parse time and stays
        // unrecorded, so the next run picks it up again.
        let provenance: Vec<_> = files
            .iter()
            .filter(|file| file.parse_time.is_some())
            .map(IndexedFile::provenance)
            .collect();
        self.meta.add_parsed_files(&provenance)?;
        self.store.build_indexes().await?;

        tracing::info!(
            files = stats.files_imported,
            records = stats.records_decoded,
            elapsed_ms = run_start.elapsed().as_millis() as u64,
            "Import finished"
        );
        Ok(stats)
    }

    /// Decode every data line of every file on a worker pool.
    ///
    /// Workers take a static round-robin stripe of the file list; each
    /// reports back the parse time of the files it finished so the
    /// provenance rows carry real completion times.
    async fn parse_files(
        &self,
        files: &mut [IndexedFile],
        session: Arc<AggregationSession>,
    ) -> Result<(u64, u64), ImportError> {
        let threads = self.config.parse_threads.max(1);
        let shared: Arc<Vec<IndexedFile>> = Arc::new(files.to_vec());

        let mut handles = Vec::with_capacity(threads);
        for start in 0..threads {
            let shared = Arc::clone(&shared);
            let session = Arc::clone(&session);
            let store = Arc::clone(&self.store);
            let database = self.database.clone();

            handles.push(tokio::task::spawn_blocking(move || {
                let mut finished: Vec<(usize, DateTime<Utc>)> = Vec::new();
                let mut decoded = 0u64;
                let mut failures = 0u64;

                let mut j = start;
                while j < shared.len() {
                    let file = &shared[j];
                    match parse_one_file(file, &session, store.as_ref(), &database) {
                        Ok((ok, failed)) => {
                            decoded += ok;
                            failures += failed;
                            if failed > 0 {
                                tracing::warn!(
                                    file = %file.path.display(),
                                    failed,
                                    "Dropped undecodable lines"
                                );
                            }
                            finished.push((j, Utc::now()));
                        }
                        Err(e) => {
                            tracing::error!(
                                file = %file.path.display(),
                                error = %e,
                                "Failed to read file, skipping"
                            );
                        }
                    }
                    j += threads;
                }
                (finished, decoded, failures)
            }));
        }

        let mut decoded = 0u64;
        let mut failures = 0u64;
        for result in join_all(handles).await {
            let (finished, ok, failed) =
                result.map_err(|e| ImportError::WorkerPanic(e.to_string()))?;
            decoded += ok;
            failures += failed;
            for (j, parse_time) in finished {
                files[j].parse_time = Some(parse_time);
            }
        }
        Ok((decoded, failures))
    }
}

/// Parse one file line by line. Returns (records decoded, lines dropped).
fn parse_one_file(
    file: &IndexedFile,
    session: &AggregationSession,
    store: &SqliteStore,
    database: &str,
) -> std::io::Result<(u64, u64)> {
    let reader = indexer::open_log_reader(&file.path)?;
    let mut decoded = 0u64;
    let mut failures = 0u64;

    for line in std::io::BufRead::lines(reader) {
        let line = line?;
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let record = match file.schema.decode_line(&line) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!(
                    file = %file.path.display(),
                    error = %e,
                    "Dropped line"
                );
                failures += 1;
                continue;
            }
        };
        decoded += 1;

        let keep_raw = match &record {
            LogRecord::Conn(conn) => {
                // Past-ceiling records still aggregate, but their raw
                // entries never reach the store.
                session.apply_conn(conn) == ConnDisposition::Store
            }
            LogRecord::Dns(dns) => {
                // DNS lines live on only as aggregates; the raw record
                // is never stored.
                session.apply_dns(dns);
                false
            }
            LogRecord::Other(_) => true,
        };

        if keep_raw {
            match RawRecord::from_record(&record, database, &file.target_collection) {
                Ok(raw) => store.store(raw),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize record");
                    failures += 1;
                }
            }
        }
    }
    Ok((decoded, failures))
}
