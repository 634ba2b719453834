//! Per-file log schema and line decoding
//!
//! Zeek-style TSV logs carry their own schema in `#`-prefixed header
//! lines: `#separator` names the column separator, `#fields` the column
//! names, and `#path` the collection the file belongs to. The schema is
//! resolved once per file; every data line is then decoded against the
//! same field-name-to-column map into one of the fixed record shapes.
//!
//! Decode failures are per-line: the offending line is dropped and
//! decoding continues with the next one.

use crate::decode::records::{ConnRecord, DnsRecord, GenericRecord, LogRecord, RecordKind};
use std::collections::HashMap;
use std::io::BufRead;

/// The Zeek marker for an unset field
const UNSET: &str = "-";

/// Errors produced while resolving a schema or decoding a line
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The file carries no `#fields` header
    #[error("no fields header found")]
    MissingFieldsHeader,

    /// A field the record shape requires is not in the header
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// The line has fewer columns than the field map expects
    #[error("line has {got} columns, field {field} is at column {expected}")]
    ShortLine {
        field: &'static str,
        expected: usize,
        got: usize,
    },

    /// A field value failed to parse as its declared type
    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// I/O failure while reading headers
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode schema for one log file
///
/// Immutable once resolved; shared by every line of the file.
#[derive(Debug, Clone, PartialEq)]
pub struct LogSchema {
    /// Column separator (tab unless the header says otherwise)
    pub separator: char,
    /// Field names in column order
    pub fields: Vec<String>,
    /// Field name to column index
    pub field_map: HashMap<String, usize>,
    /// Record shape every line of this file decodes into
    pub kind: RecordKind,
    /// Collection identifier from the `#path` header (or filename stem)
    pub collection: String,
}

impl LogSchema {
    /// Resolve a schema from the header lines of a log file.
    ///
    /// Reads `#`-prefixed lines from the start of the reader. `fallback
    /// collection` is used when no `#path` header is present (typically
    /// the filename stem, e.g. `conn` for `conn.log`).
    pub fn from_header<R: BufRead>(
        reader: &mut R,
        fallback_collection: &str,
    ) -> Result<Self, DecodeError> {
        let mut separator = '\t';
        let mut fields: Option<Vec<String>> = None;
        let mut collection: Option<String> = None;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                break;
            }
            if !line.starts_with('#') {
                break;
            }
            let trimmed = line.trim_end();

            if let Some(rest) = trimmed.strip_prefix("#separator ") {
                separator = parse_separator(rest);
            } else if let Some(rest) = strip_directive(trimmed, "#fields", separator) {
                fields = Some(
                    rest.split(separator)
                        .map(|f| f.trim().to_string())
                        .filter(|f| !f.is_empty())
                        .collect(),
                );
            } else if let Some(rest) = strip_directive(trimmed, "#path", separator) {
                collection = Some(rest.trim().to_string());
            }
        }

        let fields = fields.ok_or(DecodeError::MissingFieldsHeader)?;
        let field_map = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), i))
            .collect();
        let collection = collection.unwrap_or_else(|| fallback_collection.to_string());
        let kind = RecordKind::from_collection(&collection);

        Ok(Self {
            separator,
            fields,
            field_map,
            kind,
            collection,
        })
    }

    /// Decode one data line into a typed record.
    pub fn decode_line(&self, line: &str) -> Result<LogRecord, DecodeError> {
        let columns: Vec<&str> = line.split(self.separator).collect();

        match self.kind {
            RecordKind::Conn => Ok(LogRecord::Conn(self.decode_conn(&columns)?)),
            RecordKind::Dns => Ok(LogRecord::Dns(self.decode_dns(&columns)?)),
            RecordKind::Other => Ok(LogRecord::Other(self.decode_other(&columns))),
        }
    }

    fn decode_conn(&self, columns: &[&str]) -> Result<ConnRecord, DecodeError> {
        Ok(ConnRecord {
            timestamp: parse_timestamp(self.column(columns, "ts")?)?,
            source: self.column(columns, "id.orig_h")?.to_string(),
            destination: self.column(columns, "id.resp_h")?.to_string(),
            local_orig: parse_bool(self.column(columns, "local_orig").unwrap_or(UNSET)),
            local_resp: parse_bool(self.column(columns, "local_resp").unwrap_or(UNSET)),
            duration: parse_f64("duration", self.column(columns, "duration")?)?,
            orig_ip_bytes: parse_i64("orig_ip_bytes", self.column(columns, "orig_ip_bytes")?)?,
            resp_ip_bytes: parse_i64("resp_ip_bytes", self.column(columns, "resp_ip_bytes")?)?,
        })
    }

    fn decode_dns(&self, columns: &[&str]) -> Result<DnsRecord, DecodeError> {
        let answers = match self.column(columns, "answers") {
            Ok(UNSET) | Err(_) => Vec::new(),
            Ok(raw) => raw.split(',').map(|a| a.trim().to_string()).collect(),
        };

        Ok(DnsRecord {
            query: self.column(columns, "query")?.to_string(),
            qtype_name: self.column(columns, "qtype_name")?.to_string(),
            answers,
        })
    }

    fn decode_other(&self, columns: &[&str]) -> GenericRecord {
        GenericRecord {
            fields: self
                .fields
                .iter()
                .zip(columns.iter())
                .map(|(name, value)| (name.clone(), value.to_string()))
                .collect(),
        }
    }

    fn column<'a>(&self, columns: &[&'a str], field: &'static str) -> Result<&'a str, DecodeError> {
        let idx = *self
            .field_map
            .get(field)
            .ok_or(DecodeError::MissingField(field))?;
        columns.get(idx).copied().ok_or(DecodeError::ShortLine {
            field,
            expected: idx,
            got: columns.len(),
        })
    }
}

/// Decode a `#separator` value. Zeek writes it as a `\xNN` escape.
fn parse_separator(raw: &str) -> char {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("\\x") {
        if let Ok(byte) = u8::from_str_radix(hex, 16) {
            return byte as char;
        }
    }
    raw.chars().next().unwrap_or('\t')
}

/// Strip a directive name plus one separator from a header line.
fn strip_directive<'a>(line: &'a str, directive: &str, separator: char) -> Option<&'a str> {
    let rest = line.strip_prefix(directive)?;
    rest.strip_prefix(separator).or_else(|| rest.strip_prefix(' '))
}

/// Zeek timestamps are fractional epoch seconds; aggregation works in
/// whole seconds.
fn parse_timestamp(raw: &str) -> Result<i64, DecodeError> {
    if raw == UNSET {
        return Ok(0);
    }
    raw.parse::<f64>()
        .map(|ts| ts as i64)
        .map_err(|_| DecodeError::InvalidValue {
            field: "ts",
            value: raw.to_string(),
        })
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw, "T" | "true" | "1")
}

fn parse_f64(field: &'static str, raw: &str) -> Result<f64, DecodeError> {
    if raw == UNSET {
        return Ok(0.0);
    }
    raw.parse().map_err(|_| DecodeError::InvalidValue {
        field,
        value: raw.to_string(),
    })
}

fn parse_i64(field: &'static str, raw: &str) -> Result<i64, DecodeError> {
    if raw == UNSET {
        return Ok(0);
    }
    raw.parse().map_err(|_| DecodeError::InvalidValue {
        field,
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const CONN_HEADER: &str = "#separator \\x09\n\
#set_separator\t,\n\
#path\tconn\n\
#fields\tts\tuid\tid.orig_h\tid.orig_p\tid.resp_h\tid.resp_p\tproto\tduration\torig_ip_bytes\tresp_ip_bytes\tlocal_orig\tlocal_resp\n\
#types\ttime\tstring\taddr\tport\taddr\tport\tenum\tinterval\tcount\tcount\tbool\tbool\n";

    fn conn_schema() -> LogSchema {
        let mut cursor = Cursor::new(CONN_HEADER.as_bytes());
        LogSchema::from_header(&mut cursor, "conn").unwrap()
    }

    #[test]
    fn test_header_resolution() {
        let schema = conn_schema();

        assert_eq!(schema.separator, '\t');
        assert_eq!(schema.kind, RecordKind::Conn);
        assert_eq!(schema.collection, "conn");
        assert_eq!(schema.field_map["id.orig_h"], 2);
        assert_eq!(schema.field_map["resp_ip_bytes"], 9);
    }

    #[test]
    fn test_decode_conn_line() {
        let schema = conn_schema();
        let line = "1517336042.090842\tCa9X1\t10.55.100.111\t49778\t192.0.2.10\t443\ttcp\t1.5\t1200\t4800\tT\tF";

        let record = schema.decode_line(line).unwrap();
        let conn = match record {
            LogRecord::Conn(c) => c,
            other => panic!("expected conn record, got {other:?}"),
        };

        assert_eq!(conn.timestamp, 1517336042);
        assert_eq!(conn.source, "10.55.100.111");
        assert_eq!(conn.destination, "192.0.2.10");
        assert!(conn.local_orig);
        assert!(!conn.local_resp);
        assert_eq!(conn.duration, 1.5);
        assert_eq!(conn.orig_ip_bytes, 1200);
        assert_eq!(conn.resp_ip_bytes, 4800);
    }

    #[test]
    fn test_unset_fields_decode_to_zero() {
        let schema = conn_schema();
        let line = "1517336042.0\tCa9X1\t10.55.100.111\t49778\t192.0.2.10\t443\ttcp\t-\t-\t-\t-\t-";

        let record = schema.decode_line(line).unwrap();
        if let LogRecord::Conn(conn) = record {
            assert_eq!(conn.duration, 0.0);
            assert_eq!(conn.orig_ip_bytes, 0);
            assert!(!conn.local_orig);
        } else {
            panic!("expected conn record");
        }
    }

    #[test]
    fn test_malformed_line_is_per_line_error() {
        let schema = conn_schema();

        // Too few columns
        assert!(schema.decode_line("1517336042.0\tCa9X1").is_err());

        // Bad numeric
        let bad = "1517336042.0\tCa9X1\ta\t1\tb\t2\ttcp\tabc\t1\t1\tT\tF";
        assert!(matches!(
            schema.decode_line(bad),
            Err(DecodeError::InvalidValue { field: "duration", .. })
        ));

        // A good line after a bad one still decodes
        let good = "1517336043.0\tCa9X2\ta\t1\tb\t2\ttcp\t0.5\t1\t1\tT\tF";
        assert!(schema.decode_line(good).is_ok());
    }

    #[test]
    fn test_decode_dns_line() {
        let header = "#separator \\x09\n#path\tdns\n#fields\tts\tquery\tqtype_name\tanswers\n";
        let mut cursor = Cursor::new(header.as_bytes());
        let schema = LogSchema::from_header(&mut cursor, "dns").unwrap();

        let record = schema
            .decode_line("1517336042.0\texample.test\tA\t198.51.100.7,198.51.100.8")
            .unwrap();
        let dns = match record {
            LogRecord::Dns(d) => d,
            other => panic!("expected dns record, got {other:?}"),
        };

        assert_eq!(dns.query, "example.test");
        assert_eq!(dns.qtype_name, "A");
        assert_eq!(dns.answers, vec!["198.51.100.7", "198.51.100.8"]);

        // Unset answers decode to an empty list
        let record = schema.decode_line("1517336043.0\texample.test\tTXT\t-").unwrap();
        if let LogRecord::Dns(dns) = record {
            assert!(dns.answers.is_empty());
        }
    }

    #[test]
    fn test_fallback_collection_from_filename() {
        let header = "#fields\tts\thost\turi\n";
        let mut cursor = Cursor::new(header.as_bytes());
        let schema = LogSchema::from_header(&mut cursor, "http").unwrap();

        assert_eq!(schema.collection, "http");
        assert_eq!(schema.kind, RecordKind::Other);

        let record = schema.decode_line("1517336042.0\texample.test\t/index").unwrap();
        if let LogRecord::Other(generic) = record {
            assert_eq!(generic.get("host"), Some("example.test"));
        } else {
            panic!("expected generic record");
        }
    }

    #[test]
    fn test_missing_fields_header() {
        let mut cursor = Cursor::new(b"#separator \\x09\n".as_slice());
        assert!(matches!(
            LogSchema::from_header(&mut cursor, "conn"),
            Err(DecodeError::MissingFieldsHeader)
        ));
    }
}
