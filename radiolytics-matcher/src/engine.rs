//! Sliding-window fingerprint matcher
//!
//! Finds the reference segment best aligned with a query:
//!
//! 1. Every query frame is normalised to unit L2 norm.
//! 2. Every reference entry at least as long as the query is normalised once.
//! 3. For each offset `o` in `0..=R-Q`, frame `i` of the query is compared with
//!    frame `o+i` of the reference (dot product of unit vectors) and the `Q`
//!    values are averaged.
//! 4. The highest average wins. Iteration order is source name, then entry
//!    timestamp, then offset, all ascending, and a later equal score never
//!    replaces an earlier one, so identical buffers give identical results.
//!
//! Two acceptance policies are available because they trade false positives
//! against false negatives differently:
//! - [`MatchPolicy::MeanSimilarity`]: accept when the average reaches the threshold.
//! - [`MatchPolicy::FrameCountGated`]: accept when at least `min_frames`
//!   individual frame pairs reach the threshold; the average is the score.
//!
//! Frames at or below the silence floor contribute zero similarity: after
//! normalisation a silent frame is dominated by its dB component and would
//! otherwise look like any loud frame with a negative dB level.
//!
//! Cost is O(sources × entries × (R−Q+1) × Q), fine for a handful of stations
//! and a window of a few minutes.

use crate::buffer::{BufferSnapshot, ReferenceEntry};
use crate::fingerprint::{dot, FingerprintSequence, FRAME_DIMENSIONS};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, trace};

/// Default acceptance threshold for similarity
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.75;

/// Default frame count for the gated policy
pub const DEFAULT_MIN_FRAMES_MATCH: usize = 10;

/// Frames at or below this level are treated as silence
pub const DEFAULT_SILENCE_FLOOR_DB: f32 = -60.0;

/// How an alignment qualifies as a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPolicy {
    /// Mean frame similarity must reach the threshold
    MeanSimilarity,
    /// At least `min_frames` frame pairs must individually reach the threshold
    FrameCountGated { min_frames: usize },
}

impl Default for MatchPolicy {
    fn default() -> Self {
        MatchPolicy::MeanSimilarity
    }
}

/// Matcher tuning
#[derive(Debug, Clone, PartialEq)]
pub struct MatchSettings {
    pub threshold: f32,
    pub policy: MatchPolicy,
    /// None disables the silence gate
    pub silence_floor_db: Option<f32>,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self {
            threshold: DEFAULT_MATCH_THRESHOLD,
            policy: MatchPolicy::default(),
            silence_floor_db: Some(DEFAULT_SILENCE_FLOOR_DB),
        }
    }
}

/// Accepted match for one query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    /// Matched station
    pub source: String,
    /// Upstream record name of the matched reference
    pub reference_id: String,
    /// Capture timestamp of the matched reference, epoch seconds
    pub reference_timestamp: i64,
    /// Frame index in the reference where the query starts
    pub offset: usize,
    /// Mean frame similarity, 0.0-1.0
    pub similarity: f32,
    /// Frame pairs at or above the threshold
    pub frames_above_threshold: usize,
    pub query_length: usize,
    /// When the result was produced
    pub matched_at: DateTime<Utc>,
}

/// Best alignment seen, kept for diagnostics whether or not it was accepted
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub source: String,
    pub reference_id: String,
    pub reference_timestamp: i64,
    pub offset: usize,
    pub score: f32,
    pub frames_above_threshold: usize,
}

/// Everything one [`MatchEngine::find_best_match`] call learned
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MatchOutcome {
    /// Accepted match, None when nothing qualified
    pub result: Option<MatchResult>,
    /// Highest-scoring alignment overall
    pub best: Option<Candidate>,
    /// Alignments scored
    pub alignments: usize,
    /// Reference entries scanned
    pub references_considered: usize,
    /// Reference entries shorter than the query
    pub references_skipped: usize,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        self.result.is_some()
    }

    /// Best score seen, 0.0 if nothing could be aligned
    pub fn best_score(&self) -> f32 {
        self.best.as_ref().map(|c| c.score).unwrap_or(0.0)
    }

    /// One-line diagnostic summary written alongside results
    pub fn trace(&self) -> String {
        let verdict = if self.is_match() { "match" } else { "no-match" };
        match &self.best {
            Some(best) => format!(
                "{verdict} best={:.3} source={} ref={} offset={} frames_above={} alignments={} refs={} skipped={}",
                best.score,
                best.source,
                best.reference_id,
                best.offset,
                best.frames_above_threshold,
                self.alignments,
                self.references_considered,
                self.references_skipped
            ),
            None => format!(
                "{verdict} best=none alignments=0 refs={} skipped={}",
                self.references_considered, self.references_skipped
            ),
        }
    }
}

/// Normalised frames plus silence mask
struct PreparedSequence {
    frames: Vec<[f64; FRAME_DIMENSIONS]>,
    silent: Vec<bool>,
}

#[derive(Debug, Clone, Copy)]
struct Alignment {
    mean: f64,
    frames_above: usize,
}

/// Stateless matcher; share freely
#[derive(Debug, Clone, Default)]
pub struct MatchEngine {
    settings: MatchSettings,
}

impl MatchEngine {
    pub fn new(settings: MatchSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &MatchSettings {
        &self.settings
    }

    /// Search the snapshot for the alignment best matching `query`
    pub fn find_best_match(&self, query: &FingerprintSequence, snapshot: &BufferSnapshot) -> MatchOutcome {
        let mut outcome = MatchOutcome::default();
        let q_len = query.len();
        if q_len == 0 {
            debug!("Empty query from {}, nothing to align", query.source);
            return outcome;
        }

        let prepared_query = self.prepare(query);
        let mut best_accepted: Option<(Alignment, Candidate)> = None;
        let mut best_overall: Option<f64> = None;

        for (source, entries) in snapshot.sources() {
            trace!("Checking {} reference(s) for {}", entries.len(), source);

            for entry in entries {
                outcome.references_considered += 1;
                let r_len = entry.sequence.len();
                if r_len < q_len {
                    outcome.references_skipped += 1;
                    continue;
                }

                let prepared_ref = self.prepare(&entry.sequence);
                for offset in 0..=(r_len - q_len) {
                    let alignment = self.score_alignment(&prepared_query, &prepared_ref, offset);
                    outcome.alignments += 1;

                    if best_overall.map_or(true, |best| alignment.mean > best) {
                        best_overall = Some(alignment.mean);
                        outcome.best = Some(candidate(entry, offset, alignment));
                    }

                    if self.accepts(&alignment)
                        && best_accepted
                            .as_ref()
                            .map_or(true, |(best, _)| alignment.mean > best.mean)
                    {
                        trace!(
                            "New best match: {} at {} offset {} score {:.3}",
                            source,
                            entry.timestamp(),
                            offset,
                            alignment.mean
                        );
                        best_accepted = Some((alignment, candidate(entry, offset, alignment)));
                    }
                }
            }
        }

        outcome.result = best_accepted.map(|(_, c)| MatchResult {
            source: c.source,
            reference_id: c.reference_id,
            reference_timestamp: c.reference_timestamp,
            offset: c.offset,
            similarity: c.score,
            frames_above_threshold: c.frames_above_threshold,
            query_length: q_len,
            matched_at: Utc::now(),
        });

        debug!("Match search for {}: {}", query.source, outcome.trace());
        outcome
    }

    fn accepts(&self, alignment: &Alignment) -> bool {
        match self.settings.policy {
            MatchPolicy::MeanSimilarity => alignment.mean >= self.settings.threshold as f64,
            MatchPolicy::FrameCountGated { min_frames } => alignment.frames_above >= min_frames,
        }
    }

    fn prepare(&self, sequence: &FingerprintSequence) -> PreparedSequence {
        let frames = sequence.frames.iter().map(|f| f.normalized()).collect();
        let silent = sequence
            .frames
            .iter()
            .map(|f| match self.settings.silence_floor_db {
                Some(floor) => f.level_db <= floor,
                None => false,
            })
            .collect();
        PreparedSequence { frames, silent }
    }

    fn score_alignment(&self, query: &PreparedSequence, reference: &PreparedSequence, offset: usize) -> Alignment {
        let threshold = self.settings.threshold as f64;
        let mut total = 0.0;
        let mut frames_above = 0;

        for i in 0..query.frames.len() {
            let j = offset + i;
            let sim = if query.silent[i] || reference.silent[j] {
                0.0
            } else {
                dot(&query.frames[i], &reference.frames[j])
            };
            if sim >= threshold {
                frames_above += 1;
            }
            total += sim;
        }

        Alignment {
            mean: total / query.frames.len() as f64,
            frames_above,
        }
    }
}

fn candidate(entry: &ReferenceEntry, offset: usize, alignment: Alignment) -> Candidate {
    Candidate {
        source: entry.source().to_string(),
        reference_id: entry.record_id.clone(),
        reference_timestamp: entry.timestamp(),
        offset,
        score: alignment.mean.clamp(0.0, 1.0) as f32,
        frames_above_threshold: alignment.frames_above,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::FingerprintFrame;

    const TS: i64 = 1_234_567_890;

    fn constant(frame: [f32; 4], n: usize) -> Vec<FingerprintFrame> {
        vec![FingerprintFrame::from_array(frame); n]
    }

    /// Frames that point in clearly different directions from one another
    fn distinct_frames(n: usize, seed: usize) -> Vec<FingerprintFrame> {
        (0..n)
            .map(|i| {
                let k = (i * 7 + seed * 13) % 29;
                let a = (k as f32 * 0.37).sin().abs() + 0.05;
                let b = (k as f32 * 0.71).cos().abs() + 0.05;
                let c = ((k * 3) % 11) as f32 / 11.0 + 0.05;
                FingerprintFrame::new(a, b, c, -5.0 - (k % 17) as f32)
            })
            .collect()
    }

    /// Frames pointing away from anything `distinct_frames` produces
    fn background(n: usize, seed: usize) -> Vec<FingerprintFrame> {
        distinct_frames(n, seed)
            .into_iter()
            .map(|f| FingerprintFrame::new(f.centroid, f.energy * 3.0, f.rms * 0.1, f.level_db - 20.0))
            .collect()
    }

    fn snapshot_of(entries: Vec<(&str, i64, Vec<FingerprintFrame>)>) -> BufferSnapshot {
        BufferSnapshot::from_entries(
            TS + 10,
            entries.into_iter().map(|(source, ts, frames)| {
                ReferenceEntry::new(format!("{ts}_{source}.json"), FingerprintSequence::new(source, ts, frames))
            }),
        )
    }

    #[test]
    fn test_true_positive_identical_query() {
        let snap = snapshot_of(vec![("TestStation", TS, constant([0.5, 0.5, 0.5, -5.0], 20))]);
        let query = FingerprintSequence::new("device-1", TS, constant([0.5, 0.5, 0.5, -5.0], 20));

        let outcome = MatchEngine::default().find_best_match(&query, &snap);
        let result = outcome.result.expect("identical query should match");
        assert_eq!(result.source, "TestStation");
        assert_eq!(result.offset, 0);
        assert_eq!(result.reference_timestamp, TS);
        assert!(result.similarity >= DEFAULT_MATCH_THRESHOLD);
        assert!((result.similarity - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_false_positive_silent_query() {
        let snap = snapshot_of(vec![("TestStation", TS, constant([0.5, 0.5, 0.5, -5.0], 20))]);
        let query = FingerprintSequence::new("device-1", TS, constant([0.0, 0.0, 0.0, -200.0], 20));

        let outcome = MatchEngine::default().find_best_match(&query, &snap);
        assert!(outcome.result.is_none());
        assert_eq!(outcome.best_score(), 0.0);
        assert_eq!(outcome.alignments, 1);
    }

    #[test]
    fn test_silence_gate_disabled_reproduces_raw_cosine() {
        // Without the gate a silent query is nearly parallel to a loud frame with negative dB
        let settings = MatchSettings {
            silence_floor_db: None,
            ..MatchSettings::default()
        };
        let snap = snapshot_of(vec![("TestStation", TS, constant([0.5, 0.5, 0.5, -5.0], 20))]);
        let query = FingerprintSequence::new("device-1", TS, constant([0.0, 0.0, 0.0, -200.0], 20));

        let outcome = MatchEngine::new(settings).find_best_match(&query, &snap);
        assert!(outcome.best_score() > 0.98);
        assert!(outcome.is_match());
    }

    #[test]
    fn test_embedded_offset_recovered_for_every_k() {
        let q_len = 12;
        let r_len = 40;
        let query_frames = distinct_frames(q_len, 1);
        let filler = background(r_len, 5);

        for k in 0..=(r_len - q_len) {
            let mut reference = filler.clone();
            reference[k..k + q_len].copy_from_slice(&query_frames);
            let snap = snapshot_of(vec![("KFM", TS, reference)]);
            let query = FingerprintSequence::new("device-1", TS, query_frames.clone());

            let outcome = MatchEngine::default().find_best_match(&query, &snap);
            let result = outcome.result.unwrap_or_else(|| panic!("no match for k={k}"));
            assert_eq!(result.offset, k, "wrong offset for k={k}");
            assert!((result.similarity - 1.0).abs() < 1e-5, "k={k} sim={}", result.similarity);
            assert_eq!(outcome.alignments, r_len - q_len + 1);
        }
    }

    #[test]
    fn test_shorter_references_skipped() {
        let snap = snapshot_of(vec![
            ("KFM", TS, constant([0.5, 0.5, 0.5, -5.0], 5)),
            ("Smile FM", TS, constant([0.5, 0.5, 0.5, -5.0], 8)),
        ]);
        let query = FingerprintSequence::new("device-1", TS, constant([0.5, 0.5, 0.5, -5.0], 10));

        let outcome = MatchEngine::default().find_best_match(&query, &snap);
        assert!(outcome.result.is_none());
        assert!(outcome.best.is_none());
        assert_eq!(outcome.references_considered, 2);
        assert_eq!(outcome.references_skipped, 2);
        assert_eq!(outcome.alignments, 0);
    }

    #[test]
    fn test_empty_query_and_empty_buffer() {
        let engine = MatchEngine::default();
        let empty_query = FingerprintSequence::new("device-1", TS, Vec::new());
        let snap = snapshot_of(vec![("KFM", TS, constant([0.5, 0.5, 0.5, -5.0], 5))]);
        assert!(!engine.find_best_match(&empty_query, &snap).is_match());

        let query = FingerprintSequence::new("device-1", TS, constant([0.5, 0.5, 0.5, -5.0], 5));
        let outcome = engine.find_best_match(&query, &BufferSnapshot::default());
        assert!(!outcome.is_match());
        assert_eq!(outcome.trace(), "no-match best=none alignments=0 refs=0 skipped=0");
    }

    #[test]
    fn test_ties_keep_first_in_deterministic_order() {
        let frames = constant([0.5, 0.5, 0.5, -5.0], 10);
        let snap = snapshot_of(vec![
            ("Smile FM", TS - 20, frames.clone()),
            ("KFM", TS, frames.clone()),
            ("KFM", TS - 30, frames.clone()),
        ]);
        let query = FingerprintSequence::new("device-1", TS, constant([0.5, 0.5, 0.5, -5.0], 4));

        for _ in 0..3 {
            let result = MatchEngine::default().find_best_match(&query, &snap).result.unwrap();
            // "KFM" sorts before "Smile FM"; TS-30 before TS; offset 0 before the rest
            assert_eq!(result.source, "KFM");
            assert_eq!(result.reference_timestamp, TS - 30);
            assert_eq!(result.offset, 0);
        }
    }

    #[test]
    fn test_best_source_wins_across_stations() {
        let query_frames = distinct_frames(10, 2);
        let snap = snapshot_of(vec![
            ("KFM", TS, background(30, 9)),
            ("Smile FM", TS, {
                let mut r = background(30, 4);
                r[7..17].copy_from_slice(&query_frames);
                r
            }),
        ]);
        let query = FingerprintSequence::new("device-1", TS, query_frames);

        let result = MatchEngine::default().find_best_match(&query, &snap).result.unwrap();
        assert_eq!(result.source, "Smile FM");
        assert_eq!(result.offset, 7);
    }

    #[test]
    fn test_below_threshold_reports_best_effort_score() {
        // Orthogonal-ish frames: centroid-only vs rms-only
        let snap = snapshot_of(vec![("KFM", TS, constant([0.0, 1.0, 0.0, -1.0], 10))]);
        let query = FingerprintSequence::new("device-1", TS, constant([1.0, 0.0, 0.0, -1.0], 10));

        let outcome = MatchEngine::default().find_best_match(&query, &snap);
        assert!(outcome.result.is_none());
        let best = outcome.best.as_ref().unwrap();
        assert!((best.score - 0.5).abs() < 1e-4, "score {}", best.score);
        assert_eq!(best.source, "KFM");
        assert!(outcome.trace().starts_with("no-match best=0.500 source=KFM"));
    }

    #[test]
    fn test_frame_count_gate_requires_enough_frames() {
        // Half the frames identical, half orthogonal: mean 0.5 with 10 frames above
        let good = [0.5, 0.5, 0.5, -5.0];
        let mut reference = constant(good, 20);
        let mut query = constant(good, 20);
        for i in 10..20 {
            reference[i] = FingerprintFrame::new(1.0, 0.0, 0.0, 0.0);
            query[i] = FingerprintFrame::new(0.0, 1.0, 0.0, 0.0);
        }
        let snap = snapshot_of(vec![("KFM", TS, reference)]);
        let query = FingerprintSequence::new("device-1", TS, query);

        let mean_engine = MatchEngine::default();
        let outcome = mean_engine.find_best_match(&query, &snap);
        assert!(outcome.result.is_none(), "mean 0.5 is below 0.75");

        let gated = |min_frames| {
            MatchEngine::new(MatchSettings {
                policy: MatchPolicy::FrameCountGated { min_frames },
                ..MatchSettings::default()
            })
        };
        let accepted = gated(10).find_best_match(&query, &snap).result.unwrap();
        assert_eq!(accepted.frames_above_threshold, 10);
        assert!((accepted.similarity - 0.5).abs() < 1e-4);

        assert!(gated(11).find_best_match(&query, &snap).result.is_none());
    }

    #[test]
    fn test_gated_policy_rejects_high_mean_with_few_frames() {
        let snap = snapshot_of(vec![("KFM", TS, constant([0.5, 0.5, 0.5, -5.0], 5))]);
        let query = FingerprintSequence::new("device-1", TS, constant([0.5, 0.5, 0.5, -5.0], 5));
        let engine = MatchEngine::new(MatchSettings {
            policy: MatchPolicy::FrameCountGated { min_frames: DEFAULT_MIN_FRAMES_MATCH },
            ..MatchSettings::default()
        });

        let outcome = engine.find_best_match(&query, &snap);
        assert!(outcome.result.is_none());
        assert!((outcome.best_score() - 1.0).abs() < 1e-5);
    }
}
