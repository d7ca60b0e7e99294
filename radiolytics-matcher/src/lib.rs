//! radiolytics-matcher library interface
//!
//! Identifies which radio station a client recording matches by sliding its
//! fingerprint across a rolling window of station reference fingerprints.
//!
//! - [`fingerprint`]: frame/sequence model, extractor contract, wire records
//! - [`buffer`]: per-station, time-windowed reference store
//! - [`engine`]: sliding-window matcher
//! - [`ingest`]: work-queue polling loop feeding buffer and engine
//! - [`service`]: start/stop lifecycle around the loop
//! - [`storage`]: work queue and result sink seams
//! - [`match_log`], [`analysis`], [`indexer`]: offline tooling

pub mod analysis;
pub mod buffer;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod indexer;
pub mod ingest;
pub mod match_log;
pub mod service;
pub mod storage;

pub use crate::buffer::{BufferSnapshot, ReferenceBuffer, ReferenceEntry};
pub use crate::engine::{MatchEngine, MatchOutcome, MatchPolicy, MatchResult, MatchSettings};
pub use crate::error::{MatcherError, Result};
pub use crate::fingerprint::{FingerprintFrame, FingerprintSequence};
pub use crate::ingest::{CycleReport, IngestionLedger, IngestionLoop};
pub use crate::service::MatcherService;
