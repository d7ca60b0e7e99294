//! Append-only match log
//!
//! One line per accepted match:
//!
//! ```text
//! query_id,reference_id,similarity,offset,query_length,time_offset,wall_clock_time
//! incoming_fingerprints/1700000005_phone.json,reference_fingerprints/1700000000_KFM.json,0.9132,20,140,1.000,2023-11-14T22:13:25Z
//! ```
//!
//! Commas inside identifiers are written as `;` so every line keeps seven fields.

use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Number of fields on every line
pub const FIELD_COUNT: usize = 7;

/// Header written when a log file is created
pub const HEADER: &str = "query_id,reference_id,similarity,offset,query_length,time_offset,wall_clock_time";

/// One accepted match
#[derive(Debug, Clone, PartialEq)]
pub struct MatchLogEntry {
    pub query_id: String,
    pub reference_id: String,
    pub similarity: f32,
    /// Frame offset in the reference
    pub offset: usize,
    /// Query length in frames
    pub query_length: usize,
    /// Offset in seconds
    pub time_offset: f64,
    pub wall_clock_time: DateTime<Utc>,
}

impl MatchLogEntry {
    pub fn to_line(&self) -> String {
        format!(
            "{},{},{:.4},{},{},{:.3},{}",
            escape(&self.query_id),
            escape(&self.reference_id),
            self.similarity,
            self.offset,
            self.query_length,
            self.time_offset,
            self.wall_clock_time.to_rfc3339_opts(SecondsFormat::Secs, true)
        )
    }

    /// Parse one line; returns a description of the problem on failure
    pub fn parse_line(line: &str) -> Result<Self, String> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();
        if fields.len() != FIELD_COUNT {
            return Err(format!("expected {} fields, found {}", FIELD_COUNT, fields.len()));
        }

        let similarity = fields[2]
            .parse::<f32>()
            .map_err(|e| format!("similarity '{}': {}", fields[2], e))?;
        if !similarity.is_finite() {
            return Err(format!("similarity '{}' is not finite", fields[2]));
        }
        let offset = fields[3]
            .parse::<usize>()
            .map_err(|e| format!("offset '{}': {}", fields[3], e))?;
        let query_length = fields[4]
            .parse::<usize>()
            .map_err(|e| format!("query_length '{}': {}", fields[4], e))?;
        let time_offset = fields[5]
            .parse::<f64>()
            .map_err(|e| format!("time_offset '{}': {}", fields[5], e))?;
        let wall_clock_time = DateTime::parse_from_rfc3339(fields[6])
            .map_err(|e| format!("wall_clock_time '{}': {}", fields[6], e))?
            .with_timezone(&Utc);

        Ok(Self {
            query_id: fields[0].to_string(),
            reference_id: fields[1].to_string(),
            similarity,
            offset,
            query_length,
            time_offset,
            wall_clock_time,
        })
    }
}

fn escape(id: &str) -> String {
    id.replace([',', '\n', '\r'], ";")
}

/// Log file handle; each append opens, writes one line and closes
#[derive(Debug, Clone)]
pub struct MatchLog {
    path: PathBuf,
}

impl MatchLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, entry: &MatchLogEntry) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let is_new = tokio::fs::metadata(&self.path).await.is_err();
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;

        let mut text = String::new();
        if is_new {
            text.push_str(HEADER);
            text.push('\n');
        }
        text.push_str(&entry.to_line());
        text.push('\n');

        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn entry() -> MatchLogEntry {
        MatchLogEntry {
            query_id: "incoming_fingerprints/1700000005_phone.json".to_string(),
            reference_id: "reference_fingerprints/1700000000_KFM.json".to_string(),
            similarity: 0.91321,
            offset: 20,
            query_length: 140,
            time_offset: 1.0,
            wall_clock_time: Utc.timestamp_opt(1_700_000_005, 0).unwrap(),
        }
    }

    #[test]
    fn test_line_format() {
        assert_eq!(
            entry().to_line(),
            "incoming_fingerprints/1700000005_phone.json,reference_fingerprints/1700000000_KFM.json,0.9132,20,140,1.000,2023-11-14T22:13:25Z"
        );
    }

    #[test]
    fn test_commas_in_ids_are_replaced() {
        let mut e = entry();
        e.reference_id = "weird,name.json".to_string();
        let parsed = MatchLogEntry::parse_line(&e.to_line()).unwrap();
        assert_eq!(parsed.reference_id, "weird;name.json");
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert!(MatchLogEntry::parse_line("a,b,c").is_err());
        assert!(MatchLogEntry::parse_line("q,r,high,1,2,0.1,2023-11-14T22:13:25Z").is_err());
        assert!(MatchLogEntry::parse_line("q,r,0.5,-1,2,0.1,2023-11-14T22:13:25Z").is_err());
        assert!(MatchLogEntry::parse_line("q,r,0.5,1,2,0.1,yesterday").is_err());
        assert!(MatchLogEntry::parse_line(HEADER).is_err());
    }

    #[tokio::test]
    async fn test_append_writes_header_once() {
        let temp = TempDir::new().unwrap();
        let log = MatchLog::new(temp.path().join("logs/matches.csv"));
        log.append(&entry()).await.unwrap();
        log.append(&entry()).await.unwrap();

        let content = std::fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert_eq!(MatchLogEntry::parse_line(lines[2]).unwrap().offset, 20);
    }
}
