//! Strobe extraction
//!
//! A pair whose connection count reached the configured ceiling is a
//! strobe: its statistical value is the count itself, and keeping its
//! raw entries would swamp the conn store. Extraction demotes each
//! marked pair to a frequency record, removes it from the live uconn
//! map so the uconn/host builders never see it, and bulk-deletes its
//! raw stored entries.
//!
//! Callers must flush the datastore first (so the deletes see every
//! prior insert) and must not start the builders until extraction has
//! returned.

use crate::aggregate::types::{FrequencyRecord, UconnPair};
use crate::store::{FrequencyRepository, SqliteStore, StoreResult};
use std::collections::HashMap;

/// Outcome of one extraction pass
#[derive(Debug, Default, PartialEq, Eq)]
pub struct StrobeStats {
    /// Frequency records persisted
    pub pairs_extracted: usize,
    /// Raw conn entries deleted
    pub raw_entries_deleted: usize,
}

/// Extract every marked strobe pair.
///
/// Persists a frequency record per pair, purges the pair from
/// `uconns`, and issues a single bulk deletion for all raw entries.
pub fn extract_strobes(
    database: &str,
    strobes: &[UconnPair],
    uconns: &mut HashMap<String, UconnPair>,
    freq_repo: &FrequencyRepository,
    store: &SqliteStore,
) -> StoreResult<StrobeStats> {
    if strobes.is_empty() {
        return Ok(StrobeStats::default());
    }

    freq_repo.create_indexes()?;

    let mut selectors = Vec::with_capacity(strobes.len());
    for pair in strobes {
        freq_repo.insert(&FrequencyRecord {
            src: pair.src.clone(),
            dst: pair.dst.clone(),
            connection_count: pair.connection_count,
        })?;

        uconns.remove(&UconnPair::key(&pair.src, &pair.dst));
        selectors.push((pair.src.clone(), pair.dst.clone()));
    }

    let raw_entries_deleted = store.bulk_delete_conns(database, &selectors)?;

    tracing::info!(
        pairs = strobes.len(),
        deleted = raw_entries_deleted,
        "Extracted strobes and removed their raw conn entries"
    );

    Ok(StrobeStats {
        pairs_extracted: strobes.len(),
        raw_entries_deleted,
    })
}
