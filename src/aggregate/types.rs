//! Derived aggregate types
//!
//! These are the query-ready shapes the import run produces:
//! - `UconnPair`: running statistics for one ordered (source,
//!   destination) address pair
//! - `HostRecord`: one row per distinct IPv4 address seen in any pair
//! - `FrequencyRecord`: a pair that hit the strobe ceiling, kept as a
//!   count instead of raw entries

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Running statistical summary for one ordered connection pair
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UconnPair {
    /// Originating address
    pub src: String,
    /// Responding address
    pub dst: String,
    /// Whether the source was flagged local-origin
    pub is_local_src: bool,
    /// Whether the destination was flagged local-response
    pub is_local_dst: bool,
    /// Connections folded into this pair so far
    pub connection_count: i64,
    /// Distinct timestamps observed (no duplicates)
    pub ts_list: Vec<i64>,
    /// Originator byte count of every connection, in arrival order
    pub orig_bytes_list: Vec<i64>,
    /// Sum of originator+responder bytes over all connections
    pub total_bytes: i64,
    /// Running average bytes per connection
    pub avg_bytes: f64,
    /// Sum of connection durations
    pub total_duration: f64,
    /// Longest single connection duration
    pub max_duration: f64,
}

impl UconnPair {
    /// The map key for this pair: literal source+destination
    /// concatenation. Order-sensitive; reversed traffic is a
    /// distinct key.
    pub fn key(src: &str, dst: &str) -> String {
        format!("{src}{dst}")
    }
}

/// One row per distinct IPv4 address observed in any pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostRecord {
    /// The address
    pub ip: String,
    /// Locality, taken from the role the address was observed in
    pub local: bool,
    /// Whether the address is IPv4
    pub ipv4: bool,
    /// Longest duration of any pair involving this address
    pub max_duration: f64,
    /// Big-endian 32-bit integer encoding, for sortable storage
    pub ipv4_binary: i64,
}

impl HostRecord {
    /// Build a host record for an address, or `None` when the address
    /// is not a literal IPv4 address.
    pub fn from_address(ip: &str, local: bool, max_duration: f64) -> Option<Self> {
        let parsed: Ipv4Addr = ip.parse().ok()?;
        Some(Self {
            ip: ip.to_string(),
            local,
            ipv4: true,
            max_duration,
            ipv4_binary: ipv4_to_binary(parsed),
        })
    }
}

/// A connection pair whose volume reached the configured ceiling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyRecord {
    pub src: String,
    pub dst: String,
    pub connection_count: i64,
}

/// Encode an IPv4 address as a big-endian 32-bit integer.
pub fn ipv4_to_binary(ip: Ipv4Addr) -> i64 {
    i64::from(u32::from_be_bytes(ip.octets()))
}

/// Decode a big-endian 32-bit integer back into an IPv4 address.
pub fn binary_to_ipv4(value: i64) -> Ipv4Addr {
    Ipv4Addr::from((value as u32).to_be_bytes())
}
