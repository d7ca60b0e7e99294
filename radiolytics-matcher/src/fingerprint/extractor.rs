//! Feature extractor contract
//!
//! Extraction itself (decoding, FFT, feature math) lives outside this crate.
//! What this module fixes is the output shape every extractor must honour:
//! a recording of `recording_interval_secs` becomes exactly
//! [`FrameLayout::expected_frames`] frames, evenly subsampled when the raw
//! extraction produced more and zero-padded when it produced fewer.

use super::{FingerprintFrame, FingerprintSequence};

/// Default recording length of one fingerprint, seconds
pub const DEFAULT_RECORDING_INTERVAL_SECS: u32 = 7;

/// Default duration represented by one frame, milliseconds
pub const DEFAULT_FRAME_DURATION_MS: u32 = 50;

/// Recording interval and frame rate shared by references and queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLayout {
    pub recording_interval_secs: u32,
    pub frame_duration_ms: u32,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            recording_interval_secs: DEFAULT_RECORDING_INTERVAL_SECS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
        }
    }
}

impl FrameLayout {
    pub fn new(recording_interval_secs: u32, frame_duration_ms: u32) -> Self {
        Self {
            recording_interval_secs,
            frame_duration_ms,
        }
    }

    /// Declared frame count: 7 s at 50 ms per frame gives 140
    pub fn expected_frames(&self) -> usize {
        if self.frame_duration_ms == 0 {
            return 0;
        }
        (self.recording_interval_secs as u64 * 1000 / self.frame_duration_ms as u64) as usize
    }

    /// Seconds spanned by `frames` frames
    pub fn frames_to_secs(&self, frames: usize) -> f64 {
        frames as f64 * self.frame_duration_ms as f64 / 1000.0
    }
}

/// Bring a raw frame list to exactly `target` frames.
///
/// Longer input keeps `target` evenly spaced frames (indices spread linearly
/// from first to last, truncated); shorter input is padded with
/// [`FingerprintFrame::ZERO`].
pub fn conform_frames(mut frames: Vec<FingerprintFrame>, target: usize) -> Vec<FingerprintFrame> {
    if frames.len() > target {
        if target == 0 {
            return Vec::new();
        }
        if target == 1 {
            return vec![frames[0]];
        }
        let last = (frames.len() - 1) as f64;
        let step = last / (target - 1) as f64;
        return (0..target)
            .map(|i| frames[((i as f64 * step) as usize).min(frames.len() - 1)])
            .collect();
    }

    frames.resize(target, FingerprintFrame::ZERO);
    frames
}

/// Turns one fixed-duration block of PCM audio into fingerprint frames
pub trait FeatureExtractor: Send + Sync {
    /// Layout this extractor produces
    fn layout(&self) -> FrameLayout;

    /// Raw frames for one block, before length conformance
    fn extract_frames(&self, block: &[f32], sample_rate: u32) -> Vec<FingerprintFrame>;

    /// Extract and conform one block into a tagged sequence
    fn extract(
        &self,
        block: &[f32],
        sample_rate: u32,
        source: &str,
        timestamp: i64,
    ) -> FingerprintSequence {
        let layout = self.layout();
        let target = layout.expected_frames();
        let frames = conform_frames(self.extract_frames(block, sample_rate), target);
        FingerprintSequence::new(source, timestamp, frames).with_declared_frames(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numbered(n: usize) -> Vec<FingerprintFrame> {
        (0..n)
            .map(|i| FingerprintFrame::new(i as f32, 0.0, 0.0, 0.0))
            .collect()
    }

    #[test]
    fn test_expected_frames_default_layout() {
        assert_eq!(FrameLayout::default().expected_frames(), 140);
        assert_eq!(FrameLayout::new(10, 50).expected_frames(), 200);
        assert_eq!(FrameLayout::new(10, 0).expected_frames(), 0);
    }

    #[test]
    fn test_frames_to_secs() {
        assert!((FrameLayout::default().frames_to_secs(20) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_conform_pads_short_input() {
        let out = conform_frames(numbered(3), 5);
        assert_eq!(out.len(), 5);
        assert_eq!(out[2].rms, 2.0);
        assert_eq!(out[3], FingerprintFrame::ZERO);
        assert_eq!(out[4], FingerprintFrame::ZERO);
    }

    #[test]
    fn test_conform_subsamples_evenly() {
        // linspace(0, 9, 4) = [0, 3, 6, 9]
        let out = conform_frames(numbered(10), 4);
        let picked: Vec<f32> = out.iter().map(|f| f.rms).collect();
        assert_eq!(picked, vec![0.0, 3.0, 6.0, 9.0]);
    }

    #[test]
    fn test_conform_exact_length_untouched() {
        let out = conform_frames(numbered(6), 6);
        assert_eq!(out, numbered(6));
    }

    struct ChunkRms {
        chunk: usize,
    }

    impl FeatureExtractor for ChunkRms {
        fn layout(&self) -> FrameLayout {
            FrameLayout::new(1, 100)
        }

        fn extract_frames(&self, block: &[f32], _sample_rate: u32) -> Vec<FingerprintFrame> {
            block
                .chunks(self.chunk)
                .map(|c| {
                    let rms = (c.iter().map(|s| s * s).sum::<f32>() / c.len() as f32).sqrt();
                    let energy = c.iter().map(|s| s.abs()).sum::<f32>() / c.len() as f32;
                    FingerprintFrame::new(rms, 0.5, energy, FingerprintFrame::level_db_for(rms))
                })
                .collect()
        }
    }

    #[test]
    fn test_extract_conforms_to_layout() {
        let extractor = ChunkRms { chunk: 4 };
        let block = vec![0.5f32; 64]; // 16 raw frames, layout wants 10
        let seq = extractor.extract(&block, 8000, "KFM", 1_700_000_000);
        assert_eq!(seq.len(), 10);
        assert_eq!(seq.declared_frames, 10);
        assert!(seq.is_conformant());
        assert_eq!(seq.source, "KFM");
        assert!((seq.frames[0].rms - 0.5).abs() < 1e-6);
    }
}
