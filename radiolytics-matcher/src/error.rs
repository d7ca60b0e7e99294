//! Error types for radiolytics-matcher
//!
//! Errors fall into four groups:
//! - **Transient storage** ([`StorageError`]): queue or sink unreachable. The
//!   ingestion loop logs it and retries on the next cycle.
//! - **Record** ([`RecordError`]): one malformed fingerprint record. Only that
//!   record is skipped.
//! - **Configuration**: rejected at startup, before the loop runs.
//! - **Cancelled**: a stop request interrupted an in-flight wait.
//!
//! "No match" is not an error; see [`crate::engine::MatchOutcome`].

use crate::fingerprint::record::RecordKind;
use thiserror::Error;

/// Convenience Result type using [`MatcherError`]
pub type Result<T> = std::result::Result<T, MatcherError>;

/// Malformed or incomplete fingerprint record
#[derive(Debug, Error)]
pub enum RecordError {
    /// Payload is not valid JSON or has the wrong shape
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// Required field absent or empty
    #[error("missing field '{0}'")]
    MissingField(&'static str),

    /// Timestamp present but not a positive integer
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// `fingerprint` is an empty array
    #[error("fingerprint has no frames")]
    EmptyFingerprint,

    /// A frame does not have exactly four values
    #[error("frame {index} has {len} values, expected 4")]
    FrameWidth { index: usize, len: usize },

    /// A frame holds NaN or infinity
    #[error("frame {index} contains a non-finite value")]
    NonFiniteValue { index: usize },

    /// Record kind does not match the queue it came from
    #[error("expected a {expected} record, found a {actual} record")]
    UnexpectedKind {
        expected: RecordKind,
        actual: RecordKind,
    },
}

/// WorkQueue / ResultSink failure
#[derive(Debug, Error)]
pub enum StorageError {
    /// Object does not exist (possibly deleted concurrently)
    #[error("object not found: {0}")]
    NotFound(String),

    /// Underlying filesystem or transport error
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Backend refused or could not be reached
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Value could not be encoded for storage
    #[error("encode error: {0}")]
    Encode(String),
}

impl StorageError {
    /// Wrap an I/O error with the path it happened on
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Main error type for radiolytics-matcher
#[derive(Debug, Error)]
pub enum MatcherError {
    /// Queue or sink unavailable; retried next cycle
    #[error("Transient storage error: {0}")]
    Storage(#[from] StorageError),

    /// A single record was rejected
    #[error("Invalid record {handle}: {source}")]
    Record {
        handle: String,
        #[source]
        source: RecordError,
    },

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Stop requested while waiting on I/O
    #[error("Operation cancelled")]
    Cancelled,

    /// Local file I/O (match log, mirror, index output)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// radiolytics-common error
    #[error("Common error: {0}")]
    Common(#[from] radiolytics_common::Error),
}

impl MatcherError {
    /// Attach the offending handle to a record error
    pub fn record(handle: impl Into<String>, source: RecordError) -> Self {
        MatcherError::Record {
            handle: handle.into(),
            source,
        }
    }

    /// True for errors the loop recovers from by waiting for the next cycle
    pub fn is_transient(&self) -> bool {
        matches!(self, MatcherError::Storage(_) | MatcherError::Io(_))
    }
}
