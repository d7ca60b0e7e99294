//! Fingerprint directory indexer
//!
//! Walks a directory tree of fingerprint records and summarises each one as a
//! CSV row: `file,type,station_or_device,timestamp,datetime,length`.
//! Unreadable or non-JSON files are reported and skipped.

use crate::fingerprint::record::FingerprintRecord;
use radiolytics_common::time::{normalize_epoch_secs, secs_to_datetime};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::{DirEntry, WalkDir};

pub const CSV_HEADER: &str = "file,type,station_or_device,timestamp,datetime,length";

/// Indexer errors
#[derive(Debug, Error)]
pub enum IndexError {
    /// Root does not exist
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Root is a file
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),

    /// Output could not be written
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// Client recording or station reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexedKind {
    App,
    Reference,
}

impl IndexedKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexedKind::App => "app",
            IndexedKind::Reference => "reference",
        }
    }
}

/// Summary of one record file
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    /// Path relative to the indexed root, `/`-separated
    pub file: String,
    pub kind: IndexedKind,
    pub station_or_device: String,
    pub timestamp: Option<i64>,
    /// RFC 3339 capture time, empty when the timestamp is missing
    pub datetime: String,
    /// Frame count
    pub length: usize,
}

impl IndexRow {
    pub fn to_csv_line(&self) -> String {
        [
            csv_field(&self.file),
            self.kind.as_str().to_string(),
            csv_field(&self.station_or_device),
            self.timestamp.map(|t| t.to_string()).unwrap_or_default(),
            self.datetime.clone(),
            self.length.to_string(),
        ]
        .join(",")
    }
}

/// Quote a field when it holds a delimiter or quote
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Result of an index run
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    pub rows: Vec<IndexRow>,
    /// Files that looked like records but could not be read
    pub errors: Vec<String>,
}

/// Recursive record indexer
pub struct FingerprintIndexer {
    ignore_patterns: Vec<String>,
    max_depth: Option<usize>,
}

impl FingerprintIndexer {
    /// Indexer skipping VCS and OS metadata entries
    pub fn new() -> Self {
        Self {
            ignore_patterns: vec![".DS_Store".to_string(), ".git".to_string(), "Thumbs.db".to_string()],
            max_depth: None,
        }
    }

    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Index every `.json` file below `root`, rows sorted by file path
    pub fn index(&self, root: &Path) -> Result<IndexReport, IndexError> {
        if !root.exists() {
            return Err(IndexError::PathNotFound(root.to_path_buf()));
        }
        if !root.is_dir() {
            return Err(IndexError::NotADirectory(root.to_path_buf()));
        }

        let mut report = IndexReport::default();
        let mut visited = HashSet::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .max_depth(self.max_depth.unwrap_or(usize::MAX))
            .into_iter()
            .filter_entry(|e| self.should_process_entry(e, &mut visited));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("Error accessing entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_json(entry.path()) {
                continue;
            }

            match index_file(root, entry.path()) {
                Ok(row) => report.rows.push(row),
                Err(e) => {
                    tracing::warn!("Error reading {}: {}", entry.path().display(), e);
                    report.errors.push(format!("{}: {}", entry.path().display(), e));
                }
            }
        }

        report.rows.sort_by(|a, b| a.file.cmp(&b.file));
        tracing::debug!(
            "Indexed {} fingerprint file(s) under {} ({} errors)",
            report.rows.len(),
            root.display(),
            report.errors.len()
        );
        Ok(report)
    }

    fn should_process_entry(&self, entry: &DirEntry, visited: &mut HashSet<PathBuf>) -> bool {
        let name = entry.file_name().to_string_lossy();
        if self.ignore_patterns.iter().any(|p| name.contains(p.as_str())) {
            return false;
        }
        if entry.file_type().is_symlink() {
            if let Ok(canonical) = entry.path().canonicalize() {
                if !visited.insert(canonical) {
                    tracing::warn!("Symlink loop detected: {}", entry.path().display());
                    return false;
                }
            }
        }
        true
    }
}

impl Default for FingerprintIndexer {
    fn default() -> Self {
        Self::new()
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

/// Summarise one file; lenient about missing fields, strict about JSON syntax
fn index_file(root: &Path, path: &Path) -> Result<IndexRow, String> {
    let bytes = std::fs::read(path).map_err(|e| e.to_string())?;
    let record: FingerprintRecord = serde_json::from_slice(&bytes).map_err(|e| e.to_string())?;

    let kind = if record.device_id.is_some() {
        IndexedKind::App
    } else {
        IndexedKind::Reference
    };
    let station_or_device = record
        .station
        .clone()
        .or_else(|| record.device_id.clone())
        .unwrap_or_default();
    let timestamp = record.raw_timestamp();
    let datetime = timestamp
        .filter(|t| *t > 0)
        .and_then(|t| secs_to_datetime(normalize_epoch_secs(t)))
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_default();

    let file = path
        .strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");

    Ok(IndexRow {
        file,
        kind,
        station_or_device,
        timestamp,
        datetime,
        length: record.fingerprint.as_ref().map(Vec::len).unwrap_or(0),
    })
}

/// Write rows as CSV with a header line
pub fn write_csv(rows: &[IndexRow], out: &Path) -> Result<(), IndexError> {
    let io_err = |e| IndexError::Io(out.to_path_buf(), e);
    let mut file = std::io::BufWriter::new(std::fs::File::create(out).map_err(io_err)?);
    writeln!(file, "{}", CSV_HEADER).map_err(io_err)?;
    for row in rows {
        writeln!(file, "{}", row.to_csv_line()).map_err(io_err)?;
    }
    file.flush().map_err(io_err)
}
