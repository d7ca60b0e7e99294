//! Fingerprint data model
//!
//! A fingerprint is an ordered sequence of 4-dimensional feature frames
//! `[rms, spectral centroid, energy, level dB]`, one per sub-interval of audio,
//! tagged with the source it came from and its capture time.

pub mod extractor;
pub mod record;

/// Number of features in every frame
pub const FRAME_DIMENSIONS: usize = 4;

/// Added to the L2 norm so a silent (all-zero) frame normalises to zero instead of NaN
pub const NORM_EPSILON: f64 = 1e-10;

/// One feature vector for one sub-interval of audio
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FingerprintFrame {
    /// RMS energy magnitude
    pub rms: f32,
    /// Spectral centroid normalised to 0-1 of Nyquist
    pub centroid: f32,
    /// Time-domain energy (mean absolute amplitude)
    pub energy: f32,
    /// Log-magnitude level in dB
    pub level_db: f32,
}

impl FingerprintFrame {
    /// All-zero frame used to pad short sequences
    pub const ZERO: FingerprintFrame = FingerprintFrame {
        rms: 0.0,
        centroid: 0.0,
        energy: 0.0,
        level_db: 0.0,
    };

    pub fn new(rms: f32, centroid: f32, energy: f32, level_db: f32) -> Self {
        Self {
            rms,
            centroid,
            energy,
            level_db,
        }
    }

    pub fn from_array(values: [f32; FRAME_DIMENSIONS]) -> Self {
        Self::new(values[0], values[1], values[2], values[3])
    }

    pub fn to_array(&self) -> [f32; FRAME_DIMENSIONS] {
        [self.rms, self.centroid, self.energy, self.level_db]
    }

    /// dB level for an RMS value, guarded against log of zero (silence gives -200 dB)
    pub fn level_db_for(rms: f32) -> f32 {
        (20.0 * (rms as f64 + NORM_EPSILON).log10()) as f32
    }

    /// Frame scaled to unit L2 norm (f64 for accumulation)
    pub fn normalized(&self) -> [f64; FRAME_DIMENSIONS] {
        let values = self.to_array().map(|v| v as f64);
        let norm = values.iter().map(|v| v * v).sum::<f64>().sqrt() + NORM_EPSILON;
        values.map(|v| v / norm)
    }
}

/// Cosine similarity of two frames after unit-norm normalisation
pub fn frame_similarity(a: &FingerprintFrame, b: &FingerprintFrame) -> f64 {
    dot(&a.normalized(), &b.normalized())
}

pub(crate) fn dot(a: &[f64; FRAME_DIMENSIONS], b: &[f64; FRAME_DIMENSIONS]) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Ordered, fixed-length fingerprint of one recording
#[derive(Debug, Clone, PartialEq)]
pub struct FingerprintSequence {
    /// Station name for references, device id for queries
    pub source: String,
    /// Capture time in whole seconds since the Unix epoch
    pub timestamp: i64,
    /// Frame count expected for the recording interval configuration
    pub declared_frames: usize,
    pub frames: Vec<FingerprintFrame>,
}

impl FingerprintSequence {
    /// Create a sequence whose declared length is its actual length
    pub fn new(source: impl Into<String>, timestamp: i64, frames: Vec<FingerprintFrame>) -> Self {
        let declared_frames = frames.len();
        Self {
            source: source.into(),
            timestamp,
            declared_frames,
            frames,
        }
    }

    pub fn with_declared_frames(mut self, declared_frames: usize) -> Self {
        self.declared_frames = declared_frames;
        self
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// True when the extractor honoured the declared frame count
    pub fn is_conformant(&self) -> bool {
        self.frames.len() == self.declared_frames
    }
}
