//! Storage seams
//!
//! The matcher talks to two external systems:
//! - a [`WorkQueue`]: a flat object namespace holding reference and query
//!   records under name prefixes (listing, reading, writing, deleting)
//! - a [`ResultSink`]: a keyed store the client polls for its match result
//!
//! Both are traits so the ingestion loop can run against the local
//! filesystem ([`fs`]) or in memory ([`memory`]) for tests.

pub mod fs;
pub mod memory;

use crate::engine::MatchOutcome;
use crate::error::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Station reported when no reference matched
pub const UNKNOWN_STATION: &str = "Unknown";

/// Full object name inside the work queue, prefix included
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(String);

impl ObjectHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path component, e.g. `1700000000_KFM.json`
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Same name relocated under another prefix
    pub fn with_prefix(&self, prefix: &str) -> ObjectHandle {
        ObjectHandle(format!("{}{}", prefix, self.name()))
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectHandle {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Object store holding fingerprint records
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Handles of every object whose name starts with `prefix`, in name order
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectHandle>, StorageError>;

    async fn get(&self, handle: &ObjectHandle) -> Result<Vec<u8>, StorageError>;

    /// Create or overwrite an object
    async fn put(&self, handle: &ObjectHandle, bytes: &[u8]) -> Result<(), StorageError>;

    /// Remove an object; removing a missing object succeeds
    async fn delete(&self, handle: &ObjectHandle) -> Result<(), StorageError>;

    /// Make an object publicly readable and return its URL, if the store supports it
    async fn mark_public(&self, _handle: &ObjectHandle) -> Result<Option<String>, StorageError> {
        Ok(None)
    }
}

/// Value written for each processed query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    /// When the result was produced, epoch milliseconds
    pub matched_at: i64,
    /// Matched station or [`UNKNOWN_STATION`]
    pub station: String,
    /// Similarity of the accepted match, 0 when none
    pub confidence: f32,
    /// Capture timestamp of the matched reference, epoch seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_timestamp: Option<i64>,
    /// Offset of the query inside the matched reference, seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
    /// Diagnostic summary of the search
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,
}

impl ResultRecord {
    /// Build the sink record for an outcome; `frame_secs` converts frame offsets to seconds
    pub fn from_outcome(outcome: &MatchOutcome, matched_at_ms: i64, frame_secs: f64) -> Self {
        match &outcome.result {
            Some(result) => Self {
                matched_at: matched_at_ms,
                station: result.source.clone(),
                confidence: result.similarity,
                match_timestamp: Some(result.reference_timestamp),
                offset: Some(result.offset as f64 * frame_secs),
                trace: Some(outcome.trace()),
            },
            None => Self {
                matched_at: matched_at_ms,
                station: UNKNOWN_STATION.to_string(),
                confidence: 0.0,
                match_timestamp: None,
                offset: None,
                trace: Some(outcome.trace()),
            },
        }
    }

    pub fn is_match(&self) -> bool {
        self.station != UNKNOWN_STATION
    }
}

/// Keyed store the client reads results from
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Write (or overwrite) the result under `key`
    async fn set(&self, key: &str, record: &ResultRecord) -> Result<(), StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Candidate, MatchResult};
    use chrono::Utc;

    #[test]
    fn test_handle_name_and_prefix() {
        let handle = ObjectHandle::new("incoming_fingerprints/1700000000_phone.json");
        assert_eq!(handle.name(), "1700000000_phone.json");
        assert_eq!(
            handle.with_prefix("processed_fingerprints/").as_str(),
            "processed_fingerprints/1700000000_phone.json"
        );
        assert_eq!(ObjectHandle::from("bare.json").name(), "bare.json");
    }

    #[test]
    fn test_result_record_for_no_match() {
        let outcome = MatchOutcome::default();
        let record = ResultRecord::from_outcome(&outcome, 1_700_000_000_000, 0.05);
        assert_eq!(record.station, UNKNOWN_STATION);
        assert_eq!(record.confidence, 0.0);
        assert!(!record.is_match());

        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("match_timestamp").is_none());
        assert_eq!(json["station"], "Unknown");
    }

    #[test]
    fn test_result_record_for_match() {
        let outcome = MatchOutcome {
            result: Some(MatchResult {
                source: "KFM".to_string(),
                reference_id: "reference_fingerprints/1700000000_KFM.json".to_string(),
                reference_timestamp: 1_700_000_000,
                offset: 20,
                similarity: 0.9,
                frames_above_threshold: 20,
                query_length: 20,
                matched_at: Utc::now(),
            }),
            best: Some(Candidate {
                source: "KFM".to_string(),
                reference_id: "reference_fingerprints/1700000000_KFM.json".to_string(),
                reference_timestamp: 1_700_000_000,
                offset: 20,
                score: 0.9,
                frames_above_threshold: 20,
            }),
            alignments: 1,
            references_considered: 1,
            references_skipped: 0,
        };

        let record = ResultRecord::from_outcome(&outcome, 1_700_000_010_000, 0.05);
        assert!(record.is_match());
        assert_eq!(record.station, "KFM");
        assert_eq!(record.match_timestamp, Some(1_700_000_000));
        assert!((record.offset.unwrap() - 1.0).abs() < 1e-9);
        assert!(record.trace.unwrap().starts_with("match best=0.900"));
    }

    #[test]
    fn test_result_document_field_names() {
        let record = ResultRecord {
            matched_at: 1_700_000_010_000,
            station: "KFM".to_string(),
            confidence: 0.9,
            match_timestamp: Some(1_700_000_000),
            offset: Some(1.5),
            trace: None,
        };
        let doc = serde_json::to_value(&record).unwrap();
        assert_eq!(doc["station"], "KFM");
        assert_eq!(doc["match_timestamp"], 1_700_000_000_i64);
        assert_eq!(doc["offset"], 1.5);
        assert!(doc.get("trace").is_none());

        let unknown = serde_json::to_value(ResultRecord {
            station: UNKNOWN_STATION.to_string(),
            confidence: 0.0,
            match_timestamp: None,
            offset: None,
            ..record
        })
        .unwrap();
        assert!(unknown.get("offset").is_none());
    }
}
