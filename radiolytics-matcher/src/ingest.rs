//! Ingestion loop
//!
//! One cycle walks the phases `Idle → PollingReferences → PollingQueries →
//! Processing → Idle`:
//!
//! 1. **Reference refresh**: new reference records are read from the work
//!    queue, validated and inserted into the [`ReferenceBuffer`].
//! 2. **Query polling**: new query records are read and grouped by device;
//!    only the newest record per device is selected, older ones are marked
//!    superseded and never matched.
//! 3. **Processing**: each selected query is matched against a buffer
//!    snapshot, the result is written to the [`ResultSink`] under the query's
//!    raw timestamp, and the record is archived (copy, publish, delete).
//!
//! Per-handle ledgers make the cycle idempotent: a handle that has been
//! matched is never written to the sink again, and an archive interrupted
//! half way resumes from the step that failed. Ledgers only keep handles
//! present in the latest listing. They live in an [`IngestionLedger`] shared
//! through an `Arc`, so a loop restarted on the same ledger picks up where
//! the previous one stopped.
//!
//! Storage failures abort the cycle with [`MatcherError::Storage`]; the run
//! loop logs them, backs off and tries again. Malformed records are logged and
//! skipped without failing the cycle.

use crate::buffer::{InsertOutcome, ReferenceBuffer, ReferenceEntry};
use crate::config::MatcherConfig;
use crate::engine::MatchEngine;
use crate::error::{MatcherError, Result, StorageError};
use crate::fingerprint::extractor::FrameLayout;
use crate::fingerprint::record::{parse_record_of_kind, ParsedRecord, RecordKind};
use crate::match_log::{MatchLog, MatchLogEntry};
use crate::storage::{ObjectHandle, ResultRecord, ResultSink, WorkQueue};
use radiolytics_common::time::unix_now_millis;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Where the loop currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPhase {
    Idle,
    PollingReferences,
    PollingQueries,
    Processing,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopPhase::Idle => "idle",
            LoopPhase::PollingReferences => "polling references",
            LoopPhase::PollingQueries => "polling queries",
            LoopPhase::Processing => "processing",
        };
        f.write_str(name)
    }
}

/// Progress of moving a matched query out of the incoming prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveState {
    /// Nothing copied yet
    Pending,
    /// Archive copy written, original not yet deleted
    Copied,
    Done,
}

/// What the loop has done with a query handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryState {
    /// Result written to the sink
    Matched { device: String, archive: ArchiveState },
    /// A newer record from the same device was matched instead
    Superseded { device: String, timestamp: i64 },
    /// Record could not be parsed; left in place
    Rejected,
}

/// Handles the loop has already dealt with
#[derive(Debug, Default)]
pub struct IngestionLedger {
    /// Reference handles already read, with their capture time when valid
    seen_references: HashMap<ObjectHandle, Option<i64>>,
    queries: HashMap<ObjectHandle, QueryState>,
}

impl IngestionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shareable empty ledger
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::new()))
    }

    pub fn query_state(&self, handle: &ObjectHandle) -> Option<QueryState> {
        self.queries.get(handle).cloned()
    }

    pub fn has_seen_reference(&self, handle: &ObjectHandle) -> bool {
        self.seen_references.contains_key(handle)
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }
}

/// Counts for one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle_id: Uuid,
    pub references_loaded: usize,
    pub references_duplicate: usize,
    pub references_expired: usize,
    pub references_rejected: usize,
    /// Expired references deleted upstream
    pub references_pruned: usize,
    /// Buffer entries evicted by the end-of-refresh sweep
    pub references_evicted: usize,
    pub queries_matched: usize,
    pub queries_unmatched: usize,
    pub queries_superseded: usize,
    pub queries_rejected: usize,
    pub archives_completed: usize,
    pub archive_failures: usize,
    /// Superseded records deleted by the per-device retention cap
    pub retained_deleted: usize,
}

impl CycleReport {
    fn new(cycle_id: Uuid) -> Self {
        Self {
            cycle_id,
            references_loaded: 0,
            references_duplicate: 0,
            references_expired: 0,
            references_rejected: 0,
            references_pruned: 0,
            references_evicted: 0,
            queries_matched: 0,
            queries_unmatched: 0,
            queries_superseded: 0,
            queries_rejected: 0,
            archives_completed: 0,
            archive_failures: 0,
            retained_deleted: 0,
        }
    }

    /// Queries that produced a sink write this cycle
    pub fn queries_processed(&self) -> usize {
        self.queries_matched + self.queries_unmatched
    }

    pub fn is_quiet(&self) -> bool {
        *self == Self::new(self.cycle_id)
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "references +{} dup={} expired={} rejected={} pruned={} evicted={}; \
             queries matched={} unmatched={} superseded={} rejected={}; \
             archived={} archive_failures={} retained_deleted={}",
            self.references_loaded,
            self.references_duplicate,
            self.references_expired,
            self.references_rejected,
            self.references_pruned,
            self.references_evicted,
            self.queries_matched,
            self.queries_unmatched,
            self.queries_superseded,
            self.queries_rejected,
            self.archives_completed,
            self.archive_failures,
            self.retained_deleted
        )
    }
}

/// Query picked for matching this cycle
struct SelectedQuery {
    handle: ObjectHandle,
    bytes: Vec<u8>,
    parsed: ParsedRecord,
}

/// Polls the work queue, feeds the buffer and matches queries
pub struct IngestionLoop {
    queue: Arc<dyn WorkQueue>,
    sink: Arc<dyn ResultSink>,
    buffer: Arc<ReferenceBuffer>,
    engine: MatchEngine,
    config: MatcherConfig,
    layout: FrameLayout,
    match_log: Option<MatchLog>,
    phase: LoopPhase,
    ledger: Arc<Mutex<IngestionLedger>>,
}

impl IngestionLoop {
    pub fn new(
        config: MatcherConfig,
        queue: Arc<dyn WorkQueue>,
        sink: Arc<dyn ResultSink>,
        buffer: Arc<ReferenceBuffer>,
    ) -> Self {
        Self::with_ledger(config, queue, sink, buffer, IngestionLedger::shared())
    }

    /// Continue from a ledger kept by an earlier loop
    pub fn with_ledger(
        config: MatcherConfig,
        queue: Arc<dyn WorkQueue>,
        sink: Arc<dyn ResultSink>,
        buffer: Arc<ReferenceBuffer>,
        ledger: Arc<Mutex<IngestionLedger>>,
    ) -> Self {
        for station in &config.stations {
            buffer.register_source(station);
        }
        Self {
            queue,
            sink,
            buffer,
            engine: MatchEngine::new(config.match_settings()),
            layout: config.frame_layout(),
            match_log: config.match_log.clone().map(MatchLog::new),
            config,
            phase: LoopPhase::Idle,
            ledger,
        }
    }

    pub fn phase(&self) -> LoopPhase {
        self.phase
    }

    pub fn buffer(&self) -> &Arc<ReferenceBuffer> {
        &self.buffer
    }

    pub fn ledger(&self) -> &Arc<Mutex<IngestionLedger>> {
        &self.ledger
    }

    pub fn query_state(&self, handle: &ObjectHandle) -> Option<QueryState> {
        self.lock_ledger().query_state(handle)
    }

    // Never held across an await
    fn lock_ledger(&self) -> MutexGuard<'_, IngestionLedger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one full cycle
    pub async fn run_cycle(&mut self, token: &CancellationToken) -> Result<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let span = info_span!("cycle", id = %cycle_id);

        async {
            let mut report = CycleReport::new(cycle_id);
            let result = self.run_phases(token, &mut report).await;
            if let Err(e) = &result {
                if !matches!(e, MatcherError::Cancelled) {
                    error!("Ingestion cycle failed during {}: {}", self.phase, e);
                }
            }
            self.phase = LoopPhase::Idle;
            result.map(|()| report)
        }
        .instrument(span)
        .await
    }

    async fn run_phases(&mut self, token: &CancellationToken, report: &mut CycleReport) -> Result<()> {
        self.phase = LoopPhase::PollingReferences;
        self.refresh_references(token, report).await?;

        self.phase = LoopPhase::PollingQueries;
        let selected = self.poll_queries(token, report).await?;

        self.phase = LoopPhase::Processing;
        self.process_queries(token, selected, report).await
    }

    /// Read new reference records into the buffer
    pub async fn refresh_references(&mut self, token: &CancellationToken, report: &mut CycleReport) -> Result<()> {
        let handles = self.list_records(token, &self.config.reference_prefix).await?;
        self.lock_ledger().seen_references.retain(|h, _| handles.contains(h));

        for handle in &handles {
            if self.lock_ledger().has_seen_reference(handle) {
                continue;
            }

            let Some(bytes) = self.fetch(token, handle).await? else {
                continue;
            };

            let parsed = match parse_record_of_kind(&bytes, &self.layout, RecordKind::Reference) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("{}", MatcherError::record(handle.as_str(), e));
                    report.references_rejected += 1;
                    self.lock_ledger().seen_references.insert(handle.clone(), None);
                    continue;
                }
            };

            if !self.config.is_station(&parsed.sequence.source) {
                warn!(
                    "Reference {} is for unconfigured station '{}', skipping",
                    handle, parsed.sequence.source
                );
                report.references_rejected += 1;
                self.lock_ledger().seen_references.insert(handle.clone(), None);
                continue;
            }

            if !parsed.sequence.is_conformant() {
                debug!(
                    "Reference {} has {} frames, expected {}",
                    handle,
                    parsed.sequence.len(),
                    parsed.sequence.declared_frames
                );
            }

            let timestamp = parsed.sequence.timestamp;
            match self.buffer.insert(ReferenceEntry::new(handle.as_str(), parsed.sequence)) {
                InsertOutcome::Inserted => {
                    debug!("Loaded reference {} ({})", handle, timestamp);
                    report.references_loaded += 1;
                }
                InsertOutcome::Duplicate => report.references_duplicate += 1,
                InsertOutcome::Expired => {
                    debug!("Reference {} is older than the window", handle);
                    report.references_expired += 1;
                }
            }
            self.lock_ledger().seen_references.insert(handle.clone(), Some(timestamp));
        }

        if self.config.prune_expired_references {
            self.prune_expired_references(token, report).await?;
        }

        report.references_evicted = self.buffer.evict_expired();
        Ok(())
    }

    /// Delete upstream references that left the window
    async fn prune_expired_references(&mut self, token: &CancellationToken, report: &mut CycleReport) -> Result<()> {
        let mut expired: Vec<ObjectHandle> = self
            .lock_ledger()
            .seen_references
            .iter()
            .filter(|(_, ts)| ts.map(|t| self.buffer.is_expired(t)).unwrap_or(false))
            .map(|(h, _)| h.clone())
            .collect();
        expired.sort();

        for handle in expired {
            guarded(token, self.queue.delete(&handle)).await?;
            debug!("Deleted expired reference {}", handle);
            self.lock_ledger().seen_references.remove(&handle);
            report.references_pruned += 1;
        }
        Ok(())
    }

    /// List new queries and pick the newest per device
    async fn poll_queries(&mut self, token: &CancellationToken, report: &mut CycleReport) -> Result<Vec<SelectedQuery>> {
        let handles = self.list_records(token, &self.config.incoming_prefix).await?;
        self.lock_ledger().queries.retain(|h, _| handles.contains(h));

        let mut by_device: BTreeMap<String, Vec<SelectedQuery>> = BTreeMap::new();
        for handle in &handles {
            if self.lock_ledger().queries.contains_key(handle) {
                continue;
            }

            let Some(bytes) = self.fetch(token, handle).await? else {
                continue;
            };

            match parse_record_of_kind(&bytes, &self.layout, RecordKind::Query) {
                Ok(parsed) => by_device
                    .entry(parsed.sequence.source.clone())
                    .or_default()
                    .push(SelectedQuery {
                        handle: handle.clone(),
                        bytes,
                        parsed,
                    }),
                Err(e) => {
                    warn!("{}", MatcherError::record(handle.as_str(), e));
                    report.queries_rejected += 1;
                    self.lock_ledger().queries.insert(handle.clone(), QueryState::Rejected);
                }
            }
        }

        let mut selected = Vec::with_capacity(by_device.len());
        for (device, mut records) in by_device {
            // Newest last; name breaks timestamp ties
            records.sort_by(|a, b| {
                (a.parsed.sequence.timestamp, a.parsed.raw_timestamp, &a.handle)
                    .cmp(&(b.parsed.sequence.timestamp, b.parsed.raw_timestamp, &b.handle))
            });
            let Some(newest) = records.pop() else {
                continue;
            };

            for older in records {
                debug!("Query {} superseded by {}", older.handle, newest.handle);
                report.queries_superseded += 1;
                self.lock_ledger().queries.insert(
                    older.handle,
                    QueryState::Superseded {
                        device: device.clone(),
                        timestamp: older.parsed.sequence.timestamp,
                    },
                );
            }
            selected.push(newest);
        }

        Ok(selected)
    }

    /// Finish archives left over from earlier cycles, then match and archive the selected queries
    async fn process_queries(
        &mut self,
        token: &CancellationToken,
        selected: Vec<SelectedQuery>,
        report: &mut CycleReport,
    ) -> Result<()> {
        let mut unfinished: Vec<ObjectHandle> = self
            .lock_ledger()
            .queries
            .iter()
            .filter(|(_, state)| {
                matches!(state, QueryState::Matched { archive, .. } if *archive != ArchiveState::Done)
            })
            .map(|(h, _)| h.clone())
            .collect();
        unfinished.sort();
        for handle in unfinished {
            debug!("Retrying archive of {}", handle);
            self.archive_query(token, &handle, None, report).await?;
        }

        for query in selected {
            self.match_query(token, &query, report).await?;
            self.archive_query(token, &query.handle, Some(&query.bytes), report).await?;
        }
        Ok(())
    }

    async fn match_query(&mut self, token: &CancellationToken, query: &SelectedQuery, report: &mut CycleReport) -> Result<()> {
        let sequence = &query.parsed.sequence;
        if !sequence.is_conformant() {
            debug!(
                "Query {} has {} frames, expected {}",
                query.handle,
                sequence.len(),
                sequence.declared_frames
            );
        }

        let snapshot = self.buffer.snapshot();
        let outcome = self.engine.find_best_match(sequence, &snapshot);
        let record = ResultRecord::from_outcome(&outcome, unix_now_millis(), self.layout.frames_to_secs(1));

        let key = query.parsed.raw_timestamp.to_string();
        guarded(token, self.sink.set(&key, &record)).await?;

        self.lock_ledger().queries.insert(
            query.handle.clone(),
            QueryState::Matched {
                device: sequence.source.clone(),
                archive: ArchiveState::Pending,
            },
        );

        match &outcome.result {
            Some(result) => {
                info!(
                    "Matched {} to {} with confidence {:.2}",
                    query.handle, result.source, result.similarity
                );
                report.queries_matched += 1;

                if let Some(log) = &self.match_log {
                    let entry = MatchLogEntry {
                        query_id: query.handle.to_string(),
                        reference_id: result.reference_id.clone(),
                        similarity: result.similarity,
                        offset: result.offset,
                        query_length: result.query_length,
                        time_offset: self.layout.frames_to_secs(result.offset),
                        wall_clock_time: result.matched_at,
                    };
                    if let Err(e) = log.append(&entry).await {
                        warn!("Failed to append to match log {}: {}", log.path().display(), e);
                    }
                }
            }
            None => {
                info!(
                    "No match found for {} (best {:.3})",
                    query.handle,
                    outcome.best_score()
                );
                report.queries_unmatched += 1;
            }
        }

        if let Some(dir) = &self.config.local_mirror_dir {
            mirror_locally(dir, &query.handle, &query.bytes).await;
        }
        Ok(())
    }

    /// Advance the archive state machine for one matched query.
    ///
    /// Storage failures are logged and left for the next cycle; only
    /// cancellation propagates.
    async fn archive_query(
        &mut self,
        token: &CancellationToken,
        handle: &ObjectHandle,
        bytes: Option<&[u8]>,
        report: &mut CycleReport,
    ) -> Result<()> {
        match self.try_archive(token, handle, bytes).await {
            Ok(Some(device)) => {
                report.archives_completed += 1;
                self.enforce_retention(token, &device, report).await
            }
            Ok(None) => Ok(()),
            Err(MatcherError::Cancelled) => Err(MatcherError::Cancelled),
            Err(e) => {
                warn!("Archive of {} incomplete, will retry: {}", handle, e);
                report.archive_failures += 1;
                Ok(())
            }
        }
    }

    /// Returns the device once the archive completes
    async fn try_archive(
        &mut self,
        token: &CancellationToken,
        handle: &ObjectHandle,
        bytes: Option<&[u8]>,
    ) -> Result<Option<String>> {
        let current = self.lock_ledger().query_state(handle);
        let Some(QueryState::Matched { device, archive }) = current else {
            return Ok(None);
        };
        let archived = handle.with_prefix(&self.config.archive_prefix);

        let mut state = archive;
        if state == ArchiveState::Pending {
            let payload = match bytes {
                Some(b) => b.to_vec(),
                None => match self.fetch(token, handle).await? {
                    Some(b) => b,
                    None => {
                        // Original vanished before it was copied; nothing left to archive
                        warn!("Query {} disappeared before archiving", handle);
                        self.set_archive_state(handle, &device, ArchiveState::Done);
                        return Ok(None);
                    }
                },
            };
            guarded(token, self.queue.put(&archived, &payload)).await?;
            state = ArchiveState::Copied;
            self.set_archive_state(handle, &device, state);
        }

        if state == ArchiveState::Copied {
            if self.config.publish_archived {
                match guarded(token, self.queue.mark_public(&archived)).await {
                    Ok(Some(url)) => info!("Moved {} to {} - Public URL: {}", handle, archived, url),
                    Ok(None) => info!("Moved {} to {}", handle, archived),
                    Err(MatcherError::Cancelled) => return Err(MatcherError::Cancelled),
                    Err(e) => warn!("Could not publish {}: {}", archived, e),
                }
            } else {
                info!("Moved {} to {}", handle, archived);
            }

            guarded(token, self.queue.delete(handle)).await?;
            self.set_archive_state(handle, &device, ArchiveState::Done);
            return Ok(Some(device));
        }

        Ok(None)
    }

    fn set_archive_state(&self, handle: &ObjectHandle, device: &str, archive: ArchiveState) {
        self.lock_ledger().queries.insert(
            handle.clone(),
            QueryState::Matched {
                device: device.to_string(),
                archive,
            },
        );
    }

    /// Keep only the newest `retained_per_device` superseded records of a device upstream
    async fn enforce_retention(&mut self, token: &CancellationToken, device: &str, report: &mut CycleReport) -> Result<()> {
        let mut retained: Vec<(i64, ObjectHandle)> = self
            .lock_ledger()
            .queries
            .iter()
            .filter_map(|(h, state)| match state {
                QueryState::Superseded { device: d, timestamp } if d == device => Some((*timestamp, h.clone())),
                _ => None,
            })
            .collect();
        if retained.len() <= self.config.retained_per_device {
            return Ok(());
        }

        // Newest first
        retained.sort_by(|a, b| b.cmp(a));
        for (_, handle) in retained.split_off(self.config.retained_per_device) {
            guarded(token, self.queue.delete(&handle)).await?;
            debug!("Deleted superseded query {} (retention cap)", handle);
            self.lock_ledger().queries.remove(&handle);
            report.retained_deleted += 1;
        }
        Ok(())
    }

    /// `.json` handles under `prefix`, minus ignored names
    async fn list_records(&self, token: &CancellationToken, prefix: &str) -> Result<Vec<ObjectHandle>> {
        let handles = guarded(token, self.queue.list(prefix)).await?;
        Ok(handles
            .into_iter()
            .filter(|h| h.name().ends_with(".json"))
            .filter(|h| !self.config.ignored_names.iter().any(|n| n == h.name()))
            .collect())
    }

    /// Read an object; `None` if it was removed since listing
    async fn fetch(&self, token: &CancellationToken, handle: &ObjectHandle) -> Result<Option<Vec<u8>>> {
        match guarded(token, self.queue.get(handle)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(MatcherError::Storage(StorageError::NotFound(_))) => {
                debug!("{} vanished before it could be read", handle);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Run cycles until `token` is cancelled
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            "Starting ingestion loop (interval: {}s, window: {}s, stations: {})",
            self.config.poll_interval_secs,
            self.config.buffer_window_secs,
            self.config.stations.join(", ")
        );

        let mut timer = interval(self.config.poll_interval());
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = timer.tick() => {}
            }

            match self.run_cycle(&token).await {
                Ok(report) if report.is_quiet() => debug!("Cycle {} idle", report.cycle_id),
                Ok(report) => info!("Cycle {}: {}", report.cycle_id, report),
                Err(MatcherError::Cancelled) => break,
                Err(_) => {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.config.error_backoff()) => {}
                    }
                }
            }
        }

        info!("Ingestion loop stopped");
    }
}

/// Await a storage call unless cancellation comes first
async fn guarded<T>(
    token: &CancellationToken,
    fut: impl Future<Output = std::result::Result<T, StorageError>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(MatcherError::Cancelled),
        result = fut => result.map_err(MatcherError::from),
    }
}

async fn mirror_locally(dir: &Path, handle: &ObjectHandle, bytes: &[u8]) {
    let path = dir.join(handle.name());
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, bytes).await
    }
    .await;
    match result {
        Ok(()) => info!("Saved incoming fingerprint locally at {}", path.display()),
        Err(e) => warn!("Failed to save {} locally: {}", path.display(), e),
    }
}
