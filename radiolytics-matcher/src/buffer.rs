//! Rolling per-station reference buffer
//!
//! Holds the reference fingerprints captured within the last `window` for
//! every station. Entries are keyed by (station, capture timestamp), so
//! inserting the same reference twice is a no-op. Expired entries are swept on
//! every mutation, and [`ReferenceBuffer::snapshot`] filters by the window at
//! read time as well, so a snapshot never contains an entry older than the
//! window even if no insert happened recently.
//!
//! # Concurrency
//!
//! One writer (the reference refresh step) and any number of readers (match
//! calls). The map sits behind an `RwLock` and entries are `Arc`-shared, so a
//! snapshot is a cheap clone of fully-formed lists taken under the read lock;
//! matching then runs on the snapshot without holding any lock.

use crate::fingerprint::FingerprintSequence;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, trace};

/// Source of "now" for window arithmetic, in epoch seconds
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> i64;
}

/// Wall-clock time
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        radiolytics_common::time::unix_now_secs()
    }
}

/// Manually driven clock for tests and replays
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_secs: i64) -> Self {
        Self {
            now: AtomicI64::new(start_secs),
        }
    }

    pub fn set(&self, secs: i64) {
        self.now.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A reference fingerprint plus bookkeeping, owned by the buffer
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceEntry {
    /// Upstream record name, used as the reference id in logs and the match log
    pub record_id: String,
    pub sequence: FingerprintSequence,
    inserted_at: Option<i64>,
}

impl ReferenceEntry {
    pub fn new(record_id: impl Into<String>, sequence: FingerprintSequence) -> Self {
        Self {
            record_id: record_id.into(),
            sequence,
            inserted_at: None,
        }
    }

    pub fn source(&self) -> &str {
        &self.sequence.source
    }

    /// Capture timestamp, epoch seconds
    pub fn timestamp(&self) -> i64 {
        self.sequence.timestamp
    }

    /// When the buffer accepted this entry (None until inserted)
    pub fn inserted_at(&self) -> Option<i64> {
        self.inserted_at
    }
}

/// Result of [`ReferenceBuffer::insert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Same (source, timestamp) already buffered
    Duplicate,
    /// Entry was already older than the window
    Expired,
}

type SourceMap = BTreeMap<String, Vec<Arc<ReferenceEntry>>>;

/// Read-consistent view of the buffer for one match operation.
///
/// Sources iterate in ascending name order and entries in ascending
/// timestamp order.
#[derive(Debug, Clone, Default)]
pub struct BufferSnapshot {
    taken_at: i64,
    sources: SourceMap,
}

impl BufferSnapshot {
    /// Build a snapshot directly, e.g. for replaying a recorded buffer.
    ///
    /// Entries are grouped by source and sorted; no window filtering applies.
    pub fn from_entries(taken_at: i64, entries: impl IntoIterator<Item = ReferenceEntry>) -> Self {
        let mut sources = SourceMap::new();
        for entry in entries {
            sources
                .entry(entry.source().to_string())
                .or_default()
                .push(Arc::new(entry));
        }
        for list in sources.values_mut() {
            list.sort_by_key(|e| e.timestamp());
        }
        Self { taken_at, sources }
    }

    pub fn taken_at(&self) -> i64 {
        self.taken_at
    }

    pub fn sources(&self) -> impl Iterator<Item = (&str, &[Arc<ReferenceEntry>])> {
        self.sources.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn get(&self, source: &str) -> Option<&[Arc<ReferenceEntry>]> {
        self.sources.get(source).map(Vec::as_slice)
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    pub fn entry_count(&self) -> usize {
        self.sources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entry_count() == 0
    }
}

/// Time-windowed, deduplicated store of reference fingerprints
pub struct ReferenceBuffer {
    window_secs: i64,
    clock: Arc<dyn Clock>,
    sources: RwLock<SourceMap>,
}

impl ReferenceBuffer {
    /// Buffer using the system clock
    pub fn new(window: Duration) -> Self {
        Self::with_clock(window, Arc::new(SystemClock))
    }

    pub fn with_clock(window: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            window_secs: window.as_secs() as i64,
            clock,
            sources: RwLock::new(SourceMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(0) as u64)
    }

    pub fn now_secs(&self) -> i64 {
        self.clock.now_secs()
    }

    /// Oldest capture timestamp still inside the window at `now`
    pub fn cutoff(&self, now: i64) -> i64 {
        now - self.window_secs
    }

    /// True when a capture at `timestamp` is outside the window right now
    pub fn is_expired(&self, timestamp: i64) -> bool {
        timestamp < self.cutoff(self.clock.now_secs())
    }

    /// Pre-create an empty partition for a configured station
    pub fn register_source(&self, source: &str) {
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        sources.entry(source.to_string()).or_default();
    }

    /// Insert one reference, then sweep that source's expired entries.
    pub fn insert(&self, mut entry: ReferenceEntry) -> InsertOutcome {
        let now = self.clock.now_secs();
        let cutoff = self.cutoff(now);
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let list = sources.entry(entry.source().to_string()).or_default();

        let before = list.len();
        list.retain(|e| e.timestamp() >= cutoff);
        if list.len() < before {
            debug!(
                "Evicted {} expired reference(s) for {}",
                before - list.len(),
                entry.source()
            );
        }

        if entry.timestamp() < cutoff {
            trace!(
                "Reference {} for {} already expired (ts {} < cutoff {})",
                entry.record_id,
                entry.source(),
                entry.timestamp(),
                cutoff
            );
            return InsertOutcome::Expired;
        }

        // Entries are kept sorted by timestamp, so a binary search finds both the
        // duplicate and the insertion point.
        match list.binary_search_by_key(&entry.timestamp(), |e| e.timestamp()) {
            Ok(_) => InsertOutcome::Duplicate,
            Err(pos) => {
                entry.inserted_at = Some(now);
                list.insert(pos, Arc::new(entry));
                InsertOutcome::Inserted
            }
        }
    }

    /// Sweep expired entries from every source, returning how many were removed
    pub fn evict_expired(&self) -> usize {
        let cutoff = self.cutoff(self.clock.now_secs());
        let mut sources = self.sources.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for list in sources.values_mut() {
            let before = list.len();
            list.retain(|e| e.timestamp() >= cutoff);
            removed += before - list.len();
        }
        removed
    }

    /// Consistent copy of all in-window entries
    pub fn snapshot(&self) -> BufferSnapshot {
        let now = self.clock.now_secs();
        let cutoff = self.cutoff(now);
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        let sources = sources
            .iter()
            .map(|(source, list)| {
                let live: Vec<_> = list
                    .iter()
                    .filter(|e| e.timestamp() >= cutoff)
                    .cloned()
                    .collect();
                (source.clone(), live)
            })
            .collect();
        BufferSnapshot {
            taken_at: now,
            sources,
        }
    }

    /// Number of buffered entries, including any not yet swept
    pub fn len(&self) -> usize {
        let sources = self.sources.read().unwrap_or_else(PoisonError::into_inner);
        sources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
