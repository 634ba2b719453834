//! Log file discovery, fingerprinting, and import dedup
//!
//! Walks a directory tree for `.log` / `.gz` files, resolves each
//! file's decode schema from its header, and fingerprints a fixed-size
//! byte prefix so re-runs can recognize content they have already
//! imported regardless of path or filename changes. Directory symlinks
//! are never traversed — a live log spool typically aliases its
//! current file through one.

use crate::decode::{DecodeError, LogSchema};
use crate::store::ParsedFileRecord;
use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use futures_util::future::join_all;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How many leading bytes of a file feed its fingerprint. Bounds hash
/// cost for very large files.
const FINGERPRINT_PREFIX_LEN: usize = 15_000;

/// Errors that disqualify a single file from the batch
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema error: {0}")]
    Schema(#[from] DecodeError),
}

/// One discovered log file, ready to parse
#[derive(Debug, Clone)]
pub struct IndexedFile {
    /// Absolute path the file was found at
    pub path: PathBuf,
    /// Content fingerprint over the leading bytes
    pub fingerprint: String,
    /// Logical database this import targets
    pub target_database: String,
    /// Collection the file's records belong to
    pub target_collection: String,
    /// Decode schema resolved from the file's header
    pub schema: LogSchema,
    /// Set once parsing of this file finishes
    pub parse_time: Option<DateTime<Utc>>,
}

impl IndexedFile {
    /// The provenance row recorded after a successful import.
    pub fn provenance(&self) -> ParsedFileRecord {
        ParsedFileRecord {
            fingerprint: self.fingerprint.clone(),
            target_database: self.target_database.clone(),
            path: self.path.display().to_string(),
            parsed_at: self.parse_time.unwrap_or_else(Utc::now),
        }
    }
}

/// Recursively collect every recognized log file under `root`.
pub fn walk_log_files(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    walk_dir(root, &mut found);
    found.sort();
    found
}

fn walk_dir(dir: &Path, found: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::error!(path = %dir.display(), error = %e, "Error reading directory");
            return;
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::error!(path = %dir.display(), error = %e, "Error reading directory entry");
                continue;
            }
        };
        let path = entry.path();
        let Ok(file_type) = entry.file_type() else {
            continue;
        };

        if file_type.is_symlink() {
            // A symlinked directory is a rotating-log alias; never
            // traverse it. Symlinked plain files are still candidates.
            if !path.is_dir() && has_log_suffix(&path) {
                found.push(path);
            }
        } else if file_type.is_dir() {
            walk_dir(&path, found);
        } else if has_log_suffix(&path) {
            found.push(path);
        }
    }
}

fn has_log_suffix(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with(".log") || n.ends_with(".gz"))
        .unwrap_or(false)
}

/// Open a log file for line reading, decompressing `.gz` on the fly.
pub fn open_log_reader(path: &Path) -> std::io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Hash the leading bytes of a file into a fingerprint.
fn fingerprint_file(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut prefix = vec![0u8; FINGERPRINT_PREFIX_LEN];
    let mut filled = 0usize;
    while filled < prefix.len() {
        let n = file.read(&mut prefix[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&prefix[..filled]);
    Ok(format!("{:08x}-{filled}", hasher.finalize()))
}

/// Filename stem before the first dot, e.g. `conn` for
/// `conn.00:00:00-01:00:00.log.gz`. Used when a file carries no
/// `#path` header.
fn collection_from_filename(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.split('.').next())
        .unwrap_or("")
        .to_string()
}

/// Index a single candidate file.
fn index_file(path: &Path, target_database: &str) -> Result<IndexedFile, IndexError> {
    let fingerprint = fingerprint_file(path)?;
    let mut reader = open_log_reader(path)?;
    let schema = LogSchema::from_header(&mut reader, &collection_from_filename(path))?;

    Ok(IndexedFile {
        path: path.to_path_buf(),
        fingerprint,
        target_database: target_database.to_string(),
        target_collection: schema.collection.clone(),
        schema,
        parse_time: None,
    })
}

/// Index a batch of candidate files on a bounded worker pool.
///
/// Workers take a static round-robin stripe of the file list
/// (`i, i+N, i+2N, …`); the stage completes when every worker has
/// returned. A file that errors is logged and dropped; the rest of the
/// batch continues.
pub async fn index_files(
    files: Vec<PathBuf>,
    threads: usize,
    target_database: &str,
) -> Vec<IndexedFile> {
    let threads = threads.max(1);
    let files = Arc::new(files);
    let target_database = target_database.to_string();

    let mut handles = Vec::with_capacity(threads);
    for start in 0..threads {
        let files = Arc::clone(&files);
        let target_database = target_database.clone();

        handles.push(tokio::task::spawn_blocking(move || {
            let mut indexed = Vec::new();
            let mut j = start;
            while j < files.len() {
                match index_file(&files[j], &target_database) {
                    Ok(file) => indexed.push((j, file)),
                    Err(e) => {
                        tracing::warn!(
                            file = %files[j].display(),
                            error = %e,
                            "An error was encountered while indexing a file"
                        );
                    }
                }
                j += threads;
            }
            indexed
        }));
    }

    let mut merged: Vec<(usize, IndexedFile)> = Vec::new();
    for result in join_all(handles).await {
        match result {
            Ok(partial) => merged.extend(partial),
            Err(e) => tracing::error!(error = %e, "Indexing worker panicked"),
        }
    }
    merged.sort_by_key(|(j, _)| *j);
    merged.into_iter().map(|(_, file)| file).collect()
}

/// Drop every candidate already imported into the same database.
///
/// Candidates are matched on (fingerprint, target database), so the
/// same content is refused even after a rename or move.
pub fn remove_already_imported(
    indexed: Vec<IndexedFile>,
    previous: &[ParsedFileRecord],
) -> Vec<IndexedFile> {
    indexed
        .into_iter()
        .filter(|candidate| {
            let seen = previous.iter().any(|old| {
                old.fingerprint == candidate.fingerprint
                    && old.target_database == candidate.target_database
            });
            if seen {
                tracing::warn!(
                    path = %candidate.path.display(),
                    target_database = %candidate.target_database,
                    "Refusing to import file into the same database twice"
                );
            }
            !seen
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::RecordKind;
    use std::io::Write;
    use tempfile::tempdir;

    const CONN_HEADER: &str = "#separator \\x09\n#path\tconn\n#fields\tts\tid.orig_h\tid.resp_h\tduration\torig_ip_bytes\tresp_ip_bytes\n";

    fn write_log(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_walk_recognizes_suffixes_and_recurses() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("2024-01-01");
        std::fs::create_dir(&nested).unwrap();

        write_log(dir.path(), "conn.log", CONN_HEADER);
        write_log(&nested, "dns.log.gz", "");
        write_log(dir.path(), "notes.txt", "ignored");

        let files = walk_log_files(dir.path());
        assert_eq!(files.len(), 2);
        assert!(files.iter().any(|p| p.ends_with("conn.log")));
        assert!(files.iter().any(|p| p.ends_with("dns.log.gz")));
    }

    #[cfg(unix)]
    #[test]
    fn test_walk_skips_symlinked_directories() {
        let dir = tempdir().unwrap();
        let spool = dir.path().join("spool");
        std::fs::create_dir(&spool).unwrap();
        write_log(&spool, "conn.log", CONN_HEADER);

        // "current" alias into the spool, as a rotating logger leaves
        std::os::unix::fs::symlink(&spool, dir.path().join("current")).unwrap();

        let files = walk_log_files(dir.path());
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn test_fingerprint_depends_on_content_not_name() {
        let dir = tempdir().unwrap();
        let a = write_log(dir.path(), "a.log", "same content");
        let b = write_log(dir.path(), "b.log", "same content");
        let c = write_log(dir.path(), "c.log", "different content");

        assert_eq!(
            fingerprint_file(&a).unwrap(),
            fingerprint_file(&b).unwrap()
        );
        assert_ne!(
            fingerprint_file(&a).unwrap(),
            fingerprint_file(&c).unwrap()
        );
    }

    #[tokio::test]
    async fn test_index_files_resolves_schema_and_skips_bad_files() {
        let dir = tempdir().unwrap();
        let good = write_log(dir.path(), "conn.log", CONN_HEADER);
        // No #fields header: file-level error, dropped with a warning
        write_log(dir.path(), "broken.log", "#separator \\x09\n");

        let files = walk_log_files(dir.path());
        assert_eq!(files.len(), 2);

        let indexed = index_files(files, 2, "testdb").await;
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].path, good);
        assert_eq!(indexed[0].target_collection, "conn");
        assert_eq!(indexed[0].schema.kind, RecordKind::Conn);
        assert_eq!(indexed[0].target_database, "testdb");
    }

    #[tokio::test]
    async fn test_gzip_files_are_indexed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conn.log.gz");
        {
            let file = File::create(&path).unwrap();
            let mut encoder =
                flate2::write::GzEncoder::new(file, flate2::Compression::default());
            encoder.write_all(CONN_HEADER.as_bytes()).unwrap();
            encoder.finish().unwrap();
        }

        let indexed = index_files(vec![path], 1, "testdb").await;
        assert_eq!(indexed.len(), 1);
        assert_eq!(indexed[0].target_collection, "conn");
    }

    #[tokio::test]
    async fn test_remove_already_imported() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "conn.log", CONN_HEADER);

        let indexed = index_files(walk_log_files(dir.path()), 1, "db1").await;
        assert_eq!(indexed.len(), 1);
        let fingerprint = indexed[0].fingerprint.clone();

        // Same fingerprint, same database: dropped
        let previous = vec![ParsedFileRecord {
            fingerprint: fingerprint.clone(),
            target_database: "db1".to_string(),
            path: "/elsewhere/renamed.log".to_string(),
            parsed_at: Utc::now(),
        }];
        assert!(remove_already_imported(indexed.clone(), &previous).is_empty());

        // Same fingerprint, different database: kept
        let other_db = vec![ParsedFileRecord {
            fingerprint,
            target_database: "db2".to_string(),
            path: String::new(),
            parsed_at: Utc::now(),
        }];
        assert_eq!(remove_already_imported(indexed, &other_db).len(), 1);
    }
}
