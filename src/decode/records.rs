//! Typed record shapes produced by the line decoder
//!
//! The decoder emits one of a closed set of concrete shapes selected
//! per file from the target collection identifier. Field access is
//! compile-time checked; there is no runtime inspection of a decoded
//! value to discover its shape.

use serde::{Deserialize, Serialize};

/// Which record shape the lines of a file decode into.
///
/// Resolved once per file, before any line is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// Connection records (the `conn` collection)
    Conn,
    /// DNS query records (the `dns` collection)
    Dns,
    /// Any other log type; stored verbatim, never aggregated
    Other,
}

impl RecordKind {
    /// Select the record shape from a target collection identifier.
    pub fn from_collection(collection: &str) -> Self {
        match collection {
            "conn" => RecordKind::Conn,
            "dns" => RecordKind::Dns,
            _ => RecordKind::Other,
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Conn => write!(f, "conn"),
            RecordKind::Dns => write!(f, "dns"),
            RecordKind::Other => write!(f, "other"),
        }
    }
}

/// One decoded connection record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnRecord {
    /// Unix timestamp in seconds
    pub timestamp: i64,
    /// Originating address
    pub source: String,
    /// Responding address
    pub destination: String,
    /// Whether the originator is on a local network
    pub local_orig: bool,
    /// Whether the responder is on a local network
    pub local_resp: bool,
    /// Connection duration in seconds
    pub duration: f64,
    /// IP-level bytes sent by the originator
    pub orig_ip_bytes: i64,
    /// IP-level bytes sent by the responder
    pub resp_ip_bytes: i64,
}

/// One decoded DNS query record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsRecord {
    /// The queried domain name
    pub query: String,
    /// Query type name, e.g. "A", "AAAA", "TXT"
    pub qtype_name: String,
    /// Answer strings as observed; may be empty
    pub answers: Vec<String>,
}

/// A record of any other log type
///
/// Carries the raw field values in header order so the record can be
/// stored verbatim. Nothing downstream aggregates these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericRecord {
    /// (field name, raw value) pairs in header order
    pub fields: Vec<(String, String)>,
}

impl GenericRecord {
    /// Look up a field value by name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A fully decoded log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum LogRecord {
    Conn(ConnRecord),
    Dns(DnsRecord),
    Other(GenericRecord),
}

impl LogRecord {
    /// The shape of this record.
    pub fn kind(&self) -> RecordKind {
        match self {
            LogRecord::Conn(_) => RecordKind::Conn,
            LogRecord::Dns(_) => RecordKind::Dns,
            LogRecord::Other(_) => RecordKind::Other,
        }
    }
}
