//! Record aggregation
//!
//! This module owns the shared in-memory state of an import run:
//!
//! - **types**: the derived shapes (`UconnPair`, `HostRecord`,
//!   `FrequencyRecord`) and the IPv4 integer encoding
//! - **session**: the mutex-guarded aggregation session every parse
//!   worker folds records into
//! - **strobe**: extraction of pairs that hit the connection-count
//!   ceiling

mod session;
mod strobe;
mod types;

pub use session::{AggregateOutput, AggregationSession, AvgBytesMode, ConnDisposition};
pub use strobe::{extract_strobes, StrobeStats};
pub use types::{binary_to_ipv4, ipv4_to_binary, FrequencyRecord, HostRecord, UconnPair};
