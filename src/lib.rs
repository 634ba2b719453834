//! # Flowsift
//!
//! Network-flow log import and aggregation. Flowsift ingests
//! directories of Zeek-style TSV logs (plain or gzipped) into a local
//! SQLite datastore and derives the query-ready aggregates an analyst
//! works from: per-pair connection statistics, per-host summaries,
//! exploded DNS query counts, and hostname resolutions.
//!
//! ## Pipeline
//!
//! - [`indexer`]: file discovery, content fingerprinting, import dedup
//! - [`decode`]: per-file schema resolution and line decoding
//! - [`aggregate`]: the shared in-memory aggregation session and strobe
//!   extraction
//! - [`store`]: the SQLite datastore, provenance registry, and
//!   per-entity repositories
//! - [`writer`]: the bounded, channel-fed persistence worker pool
//! - [`importer`]: the orchestrator tying the stages together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowsift::config::Config;
//! use flowsift::importer::Importer;
//! use flowsift::store::{MetaStore, SqliteStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::load_default();
//!
//!     let store = Arc::new(SqliteStore::open(config.storage.store_path())?);
//!     let meta = MetaStore::open(config.storage.meta_path())?;
//!
//!     let importer = Importer::new(config.import, "mydb", store, meta);
//!     let stats = importer.run("/var/log/zeek".as_ref()).await?;
//!
//!     println!("Imported {} files", stats.files_imported);
//!     Ok(())
//! }
//! ```

pub mod aggregate;
pub mod config;
pub mod decode;
pub mod importer;
pub mod indexer;
pub mod store;
pub mod writer;

// Re-export top-level types for convenience
pub use aggregate::{
    AggregateOutput, AggregationSession, AvgBytesMode, ConnDisposition, FrequencyRecord,
    HostRecord, StrobeStats, UconnPair,
};

pub use config::{Config, ConfigError, ImportConfig, LoggingConfig, StorageConfig};

pub use decode::{ConnRecord, DecodeError, DnsRecord, LogRecord, LogSchema, RecordKind};

pub use importer::{ImportError, ImportStats, Importer};

pub use indexer::{IndexError, IndexedFile};

pub use store::{
    Datastore, MetaStore, ParsedFileRecord, RawRecord, SqliteStore, StoreError, StoreResult,
};

pub use writer::{WriterDoc, WriterPool, WriterSession, WriterUpdate};
