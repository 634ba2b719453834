//! Log line decoding
//!
//! This module turns raw log lines into typed records:
//!
//! - **records**: the closed set of record shapes (`ConnRecord`,
//!   `DnsRecord`, `GenericRecord`) and the per-file shape selector
//! - **schema**: Zeek-style header resolution and per-line decoding
//!
//! The shape of every line in a file is decided once, from the file's
//! target collection, before any line is decoded. A line that fails to
//! decode is dropped; the rest of the file continues.

mod records;
mod schema;

pub use records::{ConnRecord, DnsRecord, GenericRecord, LogRecord, RecordKind};
pub use schema::{DecodeError, LogSchema};
