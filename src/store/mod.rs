//! Persistence boundary
//!
//! - **sqlite**: the `Datastore` trait and its SQLite implementation
//!   (buffered raw-record writes, bulk strobe deletion, index build)
//! - **meta**: the file-provenance registry used for import dedup
//! - **repositories**: per-entity upsert repositories for the derived
//!   aggregates
//! - **error**: store error types

mod error;
mod meta;
mod repositories;
mod sqlite;

pub use error::{StoreError, StoreResult};
pub use meta::{MetaStore, ParsedFileRecord};
pub use repositories::{
    ExplodedDnsRepository, FrequencyRepository, HostRepository, HostnameRepository,
    UconnRepository,
};
pub(crate) use repositories::{bump_host_duration, upsert_uconn_row};
pub use sqlite::{Datastore, RawRecord, SqliteStore};
