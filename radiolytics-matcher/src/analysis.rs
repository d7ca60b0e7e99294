//! Offline match log analysis
//!
//! Groups accepted matches by query length, by offset, by reference and by
//! the combination of all three, and reports which grouping historically
//! produced the highest mean similarity. Used to tune recording length and
//! window size; it has no effect on the running service.

use crate::match_log::{MatchLogEntry, HEADER};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Aggregate similarity for one group
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GroupStat {
    pub count: usize,
    pub sum: f64,
    pub max: f32,
}

impl GroupStat {
    fn record(&mut self, similarity: f32) {
        if self.count == 0 || similarity > self.max {
            self.max = similarity;
        }
        self.count += 1;
        self.sum += similarity as f64;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// (query length, offset, reference id)
pub type ConfigurationKey = (usize, usize, String);

#[derive(Debug, Clone, Default)]
pub struct AnalysisReport {
    pub entries: usize,
    pub skipped_lines: usize,
    pub by_query_length: BTreeMap<usize, GroupStat>,
    pub by_offset: BTreeMap<usize, GroupStat>,
    pub by_reference: BTreeMap<String, GroupStat>,
    pub by_configuration: BTreeMap<ConfigurationKey, GroupStat>,
}

impl AnalysisReport {
    pub fn add(&mut self, entry: &MatchLogEntry) {
        self.entries += 1;
        self.by_query_length
            .entry(entry.query_length)
            .or_default()
            .record(entry.similarity);
        self.by_offset.entry(entry.offset).or_default().record(entry.similarity);
        self.by_reference
            .entry(entry.reference_id.clone())
            .or_default()
            .record(entry.similarity);
        self.by_configuration
            .entry((entry.query_length, entry.offset, entry.reference_id.clone()))
            .or_default()
            .record(entry.similarity);
    }

    pub fn best_query_length(&self) -> Option<(&usize, &GroupStat)> {
        best_of(&self.by_query_length)
    }

    pub fn best_offset(&self) -> Option<(&usize, &GroupStat)> {
        best_of(&self.by_offset)
    }

    pub fn best_reference(&self) -> Option<(&String, &GroupStat)> {
        best_of(&self.by_reference)
    }

    pub fn best_configuration(&self) -> Option<(&ConfigurationKey, &GroupStat)> {
        best_of(&self.by_configuration)
    }
}

/// Highest mean; ties keep the smallest key
fn best_of<K: Ord>(groups: &BTreeMap<K, GroupStat>) -> Option<(&K, &GroupStat)> {
    groups
        .iter()
        .fold(None, |best: Option<(&K, &GroupStat)>, (k, stat)| match best {
            Some((_, b)) if b.mean() >= stat.mean() => best,
            _ => Some((k, stat)),
        })
}

impl fmt::Display for AnalysisReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Match log analysis: {} entries ({} lines skipped)", self.entries, self.skipped_lines)?;
        if self.entries == 0 {
            return writeln!(f, "No matches recorded");
        }

        writeln!(f, "\nBy query length (frames):")?;
        for (len, stat) in &self.by_query_length {
            writeln!(f, "  {:>6}  mean {:.4}  max {:.4}  n={}", len, stat.mean(), stat.max, stat.count)?;
        }
        writeln!(f, "\nBy offset (frames):")?;
        for (offset, stat) in &self.by_offset {
            writeln!(f, "  {:>6}  mean {:.4}  max {:.4}  n={}", offset, stat.mean(), stat.max, stat.count)?;
        }
        writeln!(f, "\nBy reference:")?;
        for (reference, stat) in &self.by_reference {
            writeln!(f, "  {}  mean {:.4}  max {:.4}  n={}", reference, stat.mean(), stat.max, stat.count)?;
        }

        writeln!(f, "\nBest:")?;
        if let Some((len, stat)) = self.best_query_length() {
            writeln!(f, "  query length {} (mean {:.4})", len, stat.mean())?;
        }
        if let Some((offset, stat)) = self.best_offset() {
            writeln!(f, "  offset {} (mean {:.4})", offset, stat.mean())?;
        }
        if let Some((reference, stat)) = self.best_reference() {
            writeln!(f, "  reference {} (mean {:.4})", reference, stat.mean())?;
        }
        if let Some(((len, offset, reference), stat)) = self.best_configuration() {
            writeln!(
                f,
                "  configuration length={} offset={} reference={} (mean {:.4}, n={})",
                len,
                offset,
                reference,
                stat.mean(),
                stat.count
            )?;
        }
        Ok(())
    }
}

/// Aggregate log lines; blank lines and the header are ignored, malformed lines counted and skipped
pub fn analyze_lines<'a>(lines: impl IntoIterator<Item = &'a str>) -> AnalysisReport {
    let mut report = AnalysisReport::default();
    for (index, line) in lines.into_iter().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed == HEADER {
            continue;
        }
        match MatchLogEntry::parse_line(trimmed) {
            Ok(entry) => report.add(&entry),
            Err(e) => {
                warn!("Skipping match log line {}: {}", index + 1, e);
                report.skipped_lines += 1;
            }
        }
    }
    report
}

/// Read and aggregate a match log file
pub async fn analyze_match_log(path: &Path) -> std::io::Result<AnalysisReport> {
    let content = tokio::fs::read_to_string(path).await?;
    let report = analyze_lines(content.lines());
    info!(
        "Analyzed {}: {} entries, {} skipped",
        path.display(),
        report.entries,
        report.skipped_lines
    );
    Ok(report)
}
