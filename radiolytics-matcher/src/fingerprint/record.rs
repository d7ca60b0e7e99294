//! Fingerprint record wire format
//!
//! ```json
//! {
//!   "fingerprint": [[rms, centroid, energy, dB], ...],
//!   "timestamp": 1700000000,
//!   "station": "KFM"            // reference records
//!   "device_id": "a1b2c3"       // query records
//! }
//! ```
//!
//! Identity comes only from these fields, never from the object name.

use super::extractor::FrameLayout;
use super::{FingerprintFrame, FingerprintSequence, FRAME_DIMENSIONS};
use crate::error::RecordError;
use radiolytics_common::time::normalize_epoch_secs;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a record is a station reference or a client query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    Reference,
    Query,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKind::Reference => write!(f, "reference"),
            RecordKind::Query => write!(f, "query"),
        }
    }
}

/// Raw JSON shape; every field optional so validation can name what is missing
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FingerprintRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<Vec<Vec<f64>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<serde_json::Number>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
}

impl FingerprintRecord {
    /// Encode a sequence as a reference record (`station` = sequence source)
    pub fn reference(sequence: &FingerprintSequence) -> Self {
        Self {
            station: Some(sequence.source.clone()),
            ..Self::with_frames(sequence)
        }
    }

    /// Encode a sequence as a query record (`device_id` = sequence source)
    pub fn query(sequence: &FingerprintSequence) -> Self {
        Self {
            device_id: Some(sequence.source.clone()),
            ..Self::with_frames(sequence)
        }
    }

    fn with_frames(sequence: &FingerprintSequence) -> Self {
        Self {
            fingerprint: Some(
                sequence
                    .frames
                    .iter()
                    .map(|f| f.to_array().iter().map(|v| *v as f64).collect())
                    .collect(),
            ),
            timestamp: Some(sequence.timestamp.into()),
            station: None,
            device_id: None,
        }
    }

    pub fn to_json_bytes(&self) -> Vec<u8> {
        // Serializing plain numbers and strings cannot fail
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Kind implied by the identifier fields, if any is present and non-empty
    pub fn kind(&self) -> Option<RecordKind> {
        if non_empty(&self.station).is_some() {
            Some(RecordKind::Reference)
        } else if non_empty(&self.device_id).is_some() {
            Some(RecordKind::Query)
        } else {
            None
        }
    }

    /// Raw timestamp as an integer; fractional values are truncated
    pub fn raw_timestamp(&self) -> Option<i64> {
        let number = self.timestamp.as_ref()?;
        number
            .as_i64()
            .or_else(|| number.as_f64().filter(|v| v.is_finite()).map(|v| v as i64))
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Validated record ready for the buffer or the engine
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub kind: RecordKind,
    /// Timestamp exactly as sent (seconds or milliseconds)
    pub raw_timestamp: i64,
    /// Sequence with timestamp normalised to seconds
    pub sequence: FingerprintSequence,
}

/// Parse and validate one record payload
pub fn parse_record(bytes: &[u8], layout: &FrameLayout) -> Result<ParsedRecord, RecordError> {
    let record: FingerprintRecord =
        serde_json::from_slice(bytes).map_err(|e| RecordError::InvalidJson(e.to_string()))?;

    let raw_frames = record
        .fingerprint
        .as_ref()
        .ok_or(RecordError::MissingField("fingerprint"))?;
    if raw_frames.is_empty() {
        return Err(RecordError::EmptyFingerprint);
    }

    if record.timestamp.is_none() {
        return Err(RecordError::MissingField("timestamp"));
    }
    let raw_timestamp = record
        .raw_timestamp()
        .filter(|ts| *ts > 0)
        .ok_or_else(|| {
            RecordError::InvalidTimestamp(
                record
                    .timestamp
                    .as_ref()
                    .map(|n| n.to_string())
                    .unwrap_or_default(),
            )
        })?;

    let (kind, source) = if let Some(station) = non_empty(&record.station) {
        (RecordKind::Reference, station.to_string())
    } else if let Some(device) = non_empty(&record.device_id) {
        (RecordKind::Query, device.to_string())
    } else {
        return Err(RecordError::MissingField("station or device_id"));
    };

    let mut frames = Vec::with_capacity(raw_frames.len());
    for (index, raw) in raw_frames.iter().enumerate() {
        if raw.len() != FRAME_DIMENSIONS {
            return Err(RecordError::FrameWidth {
                index,
                len: raw.len(),
            });
        }
        let values = [raw[0] as f32, raw[1] as f32, raw[2] as f32, raw[3] as f32];
        if values.iter().any(|v| !v.is_finite()) {
            return Err(RecordError::NonFiniteValue { index });
        }
        frames.push(FingerprintFrame::from_array(values));
    }

    let sequence = FingerprintSequence::new(source, normalize_epoch_secs(raw_timestamp), frames)
        .with_declared_frames(layout.expected_frames());

    Ok(ParsedRecord {
        kind,
        raw_timestamp,
        sequence,
    })
}

/// Parse a record and require a particular kind
pub fn parse_record_of_kind(
    bytes: &[u8],
    layout: &FrameLayout,
    expected: RecordKind,
) -> Result<ParsedRecord, RecordError> {
    let parsed = parse_record(bytes, layout)?;
    if parsed.kind != expected {
        return Err(RecordError::UnexpectedKind {
            expected,
            actual: parsed.kind,
        });
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> FrameLayout {
        FrameLayout::new(1, 500) // 2 frames declared
    }

    #[test]
    fn test_parse_reference_record() {
        let json = br#"{"fingerprint": [[0.5, 0.5, 0.5, -5.0], [0.1, 0.2, 0.3, -20.0]],
                        "timestamp": 1700000000, "station": "KFM",
                        "sample_rate": 8000, "channels": 1}"#;
        let parsed = parse_record(json, &layout()).unwrap();
        assert_eq!(parsed.kind, RecordKind::Reference);
        assert_eq!(parsed.sequence.source, "KFM");
        assert_eq!(parsed.sequence.timestamp, 1_700_000_000);
        assert_eq!(parsed.sequence.len(), 2);
        assert!(parsed.sequence.is_conformant());
        assert_eq!(parsed.sequence.frames[1].level_db, -20.0);
    }

    #[test]
    fn test_parse_query_with_millisecond_timestamp() {
        let json = br#"{"fingerprint": [[0.5, 0.5, 0.5, -5.0]],
                        "timestamp": 1700000000123, "device_id": "phone-1"}"#;
        let parsed = parse_record(json, &layout()).unwrap();
        assert_eq!(parsed.kind, RecordKind::Query);
        assert_eq!(parsed.raw_timestamp, 1_700_000_000_123);
        assert_eq!(parsed.sequence.timestamp, 1_700_000_000);
        assert!(!parsed.sequence.is_conformant());
    }

    #[test]
    fn test_station_takes_precedence_over_device() {
        let json = br#"{"fingerprint": [[1,1,1,1]], "timestamp": 5,
                        "station": "Smile FM", "device_id": "phone-1"}"#;
        assert_eq!(parse_record(json, &layout()).unwrap().kind, RecordKind::Reference);
    }

    #[test]
    fn test_missing_fields_rejected() {
        let cases: [(&[u8], &str); 4] = [
            (br#"{"timestamp": 5, "station": "KFM"}"#, "fingerprint"),
            (br#"{"fingerprint": [[1,1,1,1]], "station": "KFM"}"#, "timestamp"),
            (br#"{"fingerprint": [[1,1,1,1]], "timestamp": 5}"#, "station or device_id"),
            (br#"{"fingerprint": [[1,1,1,1]], "timestamp": 5, "station": "  "}"#, "station or device_id"),
        ];
        for (json, field) in cases {
            match parse_record(json, &layout()) {
                Err(RecordError::MissingField(f)) => assert_eq!(f, field),
                other => panic!("expected missing {field}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_malformed_frames_rejected() {
        let json = br#"{"fingerprint": [[1,1,1,1],[1,1,1]], "timestamp": 5, "station": "KFM"}"#;
        assert!(matches!(
            parse_record(json, &layout()),
            Err(RecordError::FrameWidth { index: 1, len: 3 })
        ));

        let json = br#"{"fingerprint": [], "timestamp": 5, "station": "KFM"}"#;
        assert!(matches!(parse_record(json, &layout()), Err(RecordError::EmptyFingerprint)));

        let json = br#"{"fingerprint": [[1,1,1,1]], "timestamp": 0, "station": "KFM"}"#;
        assert!(matches!(parse_record(json, &layout()), Err(RecordError::InvalidTimestamp(_))));

        assert!(matches!(parse_record(b"not json", &layout()), Err(RecordError::InvalidJson(_))));
    }

    #[test]
    fn test_unexpected_kind() {
        let json = br#"{"fingerprint": [[1,1,1,1]], "timestamp": 5, "station": "KFM"}"#;
        let err = parse_record_of_kind(json, &layout(), RecordKind::Query).unwrap_err();
        assert_eq!(err.to_string(), "expected a query record, found a reference record");
    }

    #[test]
    fn test_encode_then_parse_query() {
        let seq = FingerprintSequence::new(
            "phone-7",
            1_700_000_050,
            vec![FingerprintFrame::new(0.25, 0.5, 0.125, -12.0); 2],
        );
        let bytes = FingerprintRecord::query(&seq).to_json_bytes();
        let parsed = parse_record_of_kind(&bytes, &layout(), RecordKind::Query).unwrap();
        assert_eq!(parsed.sequence, seq);
    }
}
