//! In-memory aggregation session
//!
//! One `AggregationSession` exists per import run and is shared by
//! every parse worker. A single mutex serializes all mutations to the
//! three maps (connection pairs, domain counts, hostname resolutions);
//! each record's read-modify-write sequence happens entirely under the
//! lock, and the lock is released before the caller touches the next
//! line. No I/O happens inside the locked section — the caller forwards
//! records for storage based on the returned disposition.

use crate::aggregate::types::UconnPair;
use crate::decode::{ConnRecord, DnsRecord};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

/// What the caller should do with the raw record it just applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnDisposition {
    /// Count is below the ceiling: forward the raw record for storage
    Store,
    /// Count hit the ceiling exactly: pair marked for strobe
    /// extraction, raw record not stored
    Strobe,
    /// Count is past the ceiling: neither stored nor re-marked
    Drop,
}

/// How the running average-bytes value is computed
///
/// The legacy mode reproduces the arithmetic of the system this
/// replaces, including its integer division and its count-after-
/// increment-plus-one denominator. Stored history depends on those
/// values, so legacy is the default; see DESIGN.md before changing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AvgBytesMode {
    Legacy,
    Corrected,
}

#[derive(Default)]
struct AggState {
    uconns: HashMap<String, UconnPair>,
    strobes: Vec<UconnPair>,
    domain_counts: HashMap<String, i64>,
    hostnames: HashMap<String, Vec<String>>,
}

/// Everything the session accumulated, handed to the builder phase
#[derive(Debug, Default)]
pub struct AggregateOutput {
    /// Connection-pair aggregates, keyed by src+dst concatenation
    pub uconns: HashMap<String, UconnPair>,
    /// Pairs that hit the ceiling, in marking order
    pub strobes: Vec<UconnPair>,
    /// Per-domain query counts
    pub domain_counts: HashMap<String, i64>,
    /// Per-domain resolved-IP lists (duplicates preserved)
    pub hostnames: HashMap<String, Vec<String>>,
}

/// Shared aggregation state for one import run
pub struct AggregationSession {
    state: Mutex<AggState>,
    conn_limit: i64,
    avg_mode: AvgBytesMode,
}

impl AggregationSession {
    /// Create a session with the given strobe ceiling.
    pub fn new(conn_limit: i64, avg_mode: AvgBytesMode) -> Self {
        Self {
            state: Mutex::new(AggState::default()),
            conn_limit,
            avg_mode,
        }
    }

    /// Fold one connection record into its pair aggregate.
    ///
    /// Returns the storage disposition for the raw record. The count
    /// comparison happens under the lock, so a pair is marked for
    /// strobe extraction exactly once, at exactly the ceiling.
    pub fn apply_conn(&self, record: &ConnRecord) -> ConnDisposition {
        let key = UconnPair::key(&record.source, &record.destination);
        let bytes = record.orig_ip_bytes + record.resp_ip_bytes;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let pair = state.uconns.entry(key).or_default();

        if pair.connection_count == 0 {
            pair.src = record.source.clone();
            pair.dst = record.destination.clone();
        }
        pair.is_local_src = record.local_orig;
        pair.is_local_dst = record.local_resp;

        let new_count = pair.connection_count + 1;
        pair.connection_count = new_count;

        // Only distinct timestamps are kept; linear scan is fine at the
        // cardinalities one pair sees.
        if !pair.ts_list.contains(&record.timestamp) {
            pair.ts_list.push(record.timestamp);
        }

        pair.orig_bytes_list.push(record.orig_ip_bytes);
        pair.total_bytes += bytes;

        pair.avg_bytes = match self.avg_mode {
            // Integer arithmetic and the (new_count + 1) denominator are
            // load-bearing; stored history was produced by exactly this.
            AvgBytesMode::Legacy => {
                (((pair.avg_bytes as i64) * new_count + bytes) / (new_count + 1)) as f64
            }
            AvgBytesMode::Corrected => pair.total_bytes as f64 / new_count as f64,
        };

        pair.total_duration += record.duration;
        if record.duration > pair.max_duration {
            pair.max_duration = record.duration;
        }

        if new_count < self.conn_limit {
            ConnDisposition::Store
        } else if new_count == self.conn_limit {
            let marked = pair.clone();
            state.strobes.push(marked);
            ConnDisposition::Strobe
        } else {
            ConnDisposition::Drop
        }
    }

    /// Fold one DNS record into the domain maps.
    pub fn apply_dns(&self, record: &DnsRecord) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        *state.domain_counts.entry(record.query.clone()).or_insert(0) += 1;

        let resolutions = state.hostnames.entry(record.query.clone()).or_default();
        if record.qtype_name == "A" {
            for answer in &record.answers {
                if answer.parse::<IpAddr>().is_ok() {
                    resolutions.push(answer.clone());
                }
            }
        }
    }

    /// Consume the session, yielding the accumulated aggregates.
    pub fn finish(self) -> AggregateOutput {
        let state = self
            .state
            .into_inner()
            .unwrap_or_else(|e| e.into_inner());
        AggregateOutput {
            uconns: state.uconns,
            strobes: state.strobes,
            domain_counts: state.domain_counts,
            hostnames: state.hostnames,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn conn(src: &str, dst: &str, ts: i64, orig: i64, resp: i64, duration: f64) -> ConnRecord {
        ConnRecord {
            timestamp: ts,
            source: src.to_string(),
            destination: dst.to_string(),
            local_orig: true,
            local_resp: false,
            duration,
            orig_ip_bytes: orig,
            resp_ip_bytes: resp,
        }
    }

    fn dns(query: &str, qtype: &str, answers: &[&str]) -> DnsRecord {
        DnsRecord {
            query: query.to_string(),
            qtype_name: qtype.to_string(),
            answers: answers.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn test_timestamp_uniqueness() {
        let session = AggregationSession::new(100, AvgBytesMode::Legacy);

        session.apply_conn(&conn("a", "b", 1000, 10, 10, 0.1));
        session.apply_conn(&conn("a", "b", 1000, 10, 10, 0.1));
        session.apply_conn(&conn("a", "b", 2000, 10, 10, 0.1));

        let out = session.finish();
        let pair = &out.uconns[&UconnPair::key("a", "b")];

        assert_eq!(pair.connection_count, 3);
        assert_eq!(pair.ts_list, vec![1000, 2000]);
        // Byte counts are appended unconditionally
        assert_eq!(pair.orig_bytes_list.len(), 3);
    }

    #[test]
    fn test_total_and_max_consistency() {
        let session = AggregationSession::new(100, AvgBytesMode::Legacy);

        session.apply_conn(&conn("a", "b", 1, 100, 200, 1.5));
        session.apply_conn(&conn("a", "b", 2, 50, 25, 4.0));
        session.apply_conn(&conn("a", "b", 3, 10, 5, 2.0));

        let out = session.finish();
        let pair = &out.uconns[&UconnPair::key("a", "b")];

        assert_eq!(pair.total_bytes, 300 + 75 + 15);
        assert_eq!(pair.max_duration, 4.0);
        assert!((pair.total_duration - 7.5).abs() < 1e-9);
        assert_eq!(pair.orig_bytes_list, vec![100, 50, 10]);
    }

    #[test]
    fn test_legacy_avg_bytes_formula() {
        let session = AggregationSession::new(100, AvgBytesMode::Legacy);

        // First record: avg = (0 * 1 + 300) / 2 = 150 (integer divide)
        session.apply_conn(&conn("a", "b", 1, 100, 200, 0.0));
        // Second: avg = (150 * 2 + 100) / 3 = 133
        session.apply_conn(&conn("a", "b", 2, 40, 60, 0.0));

        let out = session.finish();
        let pair = &out.uconns[&UconnPair::key("a", "b")];
        assert_eq!(pair.avg_bytes, 133.0);
    }

    #[test]
    fn test_corrected_avg_bytes_formula() {
        let session = AggregationSession::new(100, AvgBytesMode::Corrected);

        session.apply_conn(&conn("a", "b", 1, 100, 200, 0.0));
        session.apply_conn(&conn("a", "b", 2, 40, 60, 0.0));

        let out = session.finish();
        let pair = &out.uconns[&UconnPair::key("a", "b")];
        assert_eq!(pair.avg_bytes, 200.0); // (300 + 100) / 2
    }

    #[test]
    fn test_strobe_boundary() {
        let session = AggregationSession::new(3, AvgBytesMode::Legacy);

        assert_eq!(
            session.apply_conn(&conn("a", "b", 1, 1, 1, 0.0)),
            ConnDisposition::Store
        );
        assert_eq!(
            session.apply_conn(&conn("a", "b", 2, 1, 1, 0.0)),
            ConnDisposition::Store
        );
        // The ceiling-th connection marks, and stops forwarding
        assert_eq!(
            session.apply_conn(&conn("a", "b", 3, 1, 1, 0.0)),
            ConnDisposition::Strobe
        );
        // Past the ceiling: neither stored nor re-marked
        assert_eq!(
            session.apply_conn(&conn("a", "b", 4, 1, 1, 0.0)),
            ConnDisposition::Drop
        );

        let out = session.finish();
        assert_eq!(out.strobes.len(), 1);
        assert_eq!(out.strobes[0].connection_count, 3);
        // The live aggregate keeps counting past the ceiling
        assert_eq!(out.uconns[&UconnPair::key("a", "b")].connection_count, 4);
    }

    #[test]
    fn test_reversed_direction_is_distinct_pair() {
        let session = AggregationSession::new(100, AvgBytesMode::Legacy);

        session.apply_conn(&conn("a", "b", 1, 1, 1, 0.0));
        session.apply_conn(&conn("b", "a", 2, 1, 1, 0.0));

        let out = session.finish();
        assert_eq!(out.uconns.len(), 2);
        assert_eq!(out.uconns[&UconnPair::key("a", "b")].connection_count, 1);
        assert_eq!(out.uconns[&UconnPair::key("b", "a")].connection_count, 1);
    }

    #[test]
    fn test_dns_a_query_filters_non_ip_answers() {
        let session = AggregationSession::new(100, AvgBytesMode::Legacy);

        session.apply_dns(&dns("example.test", "A", &["93.184.216.34", "not-an-ip"]));

        let out = session.finish();
        assert_eq!(out.domain_counts["example.test"], 1);
        assert_eq!(out.hostnames["example.test"], vec!["93.184.216.34"]);
    }

    #[test]
    fn test_dns_non_a_query_never_populates_resolutions() {
        let session = AggregationSession::new(100, AvgBytesMode::Legacy);

        session.apply_dns(&dns("example.test", "TXT", &["93.184.216.34"]));
        session.apply_dns(&dns("example.test", "AAAA", &["2001:db8::1"]));

        let out = session.finish();
        assert_eq!(out.domain_counts["example.test"], 2);
        // The entry exists but stays empty
        assert!(out.hostnames["example.test"].is_empty());
    }

    #[test]
    fn test_dns_duplicate_answers_preserved() {
        let session = AggregationSession::new(100, AvgBytesMode::Legacy);

        session.apply_dns(&dns("example.test", "A", &["198.51.100.7"]));
        session.apply_dns(&dns("example.test", "A", &["198.51.100.7"]));
        session.apply_dns(&dns("example.test", "A", &["198.51.100.8"]));

        let out = session.finish();
        assert_eq!(out.domain_counts["example.test"], 3);
        assert_eq!(
            out.hostnames["example.test"],
            vec!["198.51.100.7", "198.51.100.7", "198.51.100.8"]
        );
    }

    #[test]
    fn test_concurrent_workers_share_one_session() {
        let session = Arc::new(AggregationSession::new(10_000, AvgBytesMode::Legacy));
        let mut handles = Vec::new();

        for worker in 0..4 {
            let session = Arc::clone(&session);
            handles.push(std::thread::spawn(move || {
                for i in 0..250 {
                    let ts = (worker * 250 + i) as i64;
                    session.apply_conn(&conn("a", "b", ts, 10, 20, 0.1));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let out = Arc::try_unwrap(session).ok().unwrap().finish();
        let pair = &out.uconns[&UconnPair::key("a", "b")];

        assert_eq!(pair.connection_count, 1000);
        assert_eq!(pair.ts_list.len(), 1000);
        assert_eq!(pair.total_bytes, 30 * 1000);
    }
}
