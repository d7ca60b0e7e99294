//! Matcher service configuration
//!
//! Loaded from the `radiolytics.toml` bootstrap file (see
//! [`radiolytics_common::config`] for how the file is located):
//!
//! ```toml
//! root_folder = "/var/lib/radiolytics"
//!
//! [logging]
//! level = "info"
//!
//! [matcher]
//! stations = ["KFM", "Smile FM"]
//! match_threshold = 0.75
//! policy = "frame-count-gated"
//! min_frames_match = 10
//! ```
//!
//! Every `[matcher]` key except `stations` has a default. [`MatcherConfig::validate`]
//! rejects unusable values before the service starts.

use crate::engine::{
    MatchPolicy, MatchSettings, DEFAULT_MATCH_THRESHOLD, DEFAULT_MIN_FRAMES_MATCH, DEFAULT_SILENCE_FLOOR_DB,
};
use crate::error::{MatcherError, Result};
use crate::fingerprint::extractor::{FrameLayout, DEFAULT_FRAME_DURATION_MS, DEFAULT_RECORDING_INTERVAL_SECS};
use radiolytics_common::config::{load_toml_config, resolve_config_path, resolve_root_folder, LoggingConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Bootstrap file name looked up in the config directories
pub const CONFIG_FILE_NAME: &str = "radiolytics.toml";

/// Acceptance policy as written in TOML
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    MeanSimilarity,
    FrameCountGated,
}

/// `[matcher]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Stations whose references are accepted; required
    pub stations: Vec<String>,
    pub match_threshold: f32,
    pub policy: PolicyKind,
    /// Frame count for the gated policy
    pub min_frames_match: usize,
    /// Frames at or below this level score zero; `-inf` disables the gate
    pub silence_floor_db: f32,
    /// Reference retention window
    pub buffer_window_secs: u64,
    pub poll_interval_secs: u64,
    /// Extra sleep after a failed cycle
    pub error_backoff_secs: u64,
    pub shutdown_timeout_secs: u64,
    /// Newest query records kept upstream per device
    pub retained_per_device: usize,
    pub recording_interval_secs: u32,
    pub frame_duration_ms: u32,
    pub reference_prefix: String,
    pub incoming_prefix: String,
    pub archive_prefix: String,
    /// Object names never processed (e.g. files the client rewrites in place)
    pub ignored_names: Vec<String>,
    /// Call `mark_public` on archived queries
    pub publish_archived: bool,
    /// Delete upstream references once they leave the window
    pub prune_expired_references: bool,
    /// Append accepted matches here
    pub match_log: Option<PathBuf>,
    /// Keep a local copy of every processed query record
    pub local_mirror_dir: Option<PathBuf>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            stations: Vec::new(),
            match_threshold: DEFAULT_MATCH_THRESHOLD,
            policy: PolicyKind::default(),
            min_frames_match: DEFAULT_MIN_FRAMES_MATCH,
            silence_floor_db: DEFAULT_SILENCE_FLOOR_DB,
            buffer_window_secs: 180,
            poll_interval_secs: 5,
            error_backoff_secs: 5,
            shutdown_timeout_secs: 10,
            retained_per_device: 3,
            recording_interval_secs: DEFAULT_RECORDING_INTERVAL_SECS,
            frame_duration_ms: DEFAULT_FRAME_DURATION_MS,
            reference_prefix: "reference_fingerprints/".to_string(),
            incoming_prefix: "incoming_fingerprints/".to_string(),
            archive_prefix: "processed_fingerprints/".to_string(),
            ignored_names: vec!["latest.json".to_string()],
            publish_archived: true,
            prune_expired_references: false,
            match_log: None,
            local_mirror_dir: None,
        }
    }
}

impl MatcherConfig {
    /// Defaults with the given stations
    pub fn with_stations<S: Into<String>>(stations: impl IntoIterator<Item = S>) -> Self {
        Self {
            stations: stations.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(MatcherError::Config(msg));

        if self.stations.iter().all(|s| s.trim().is_empty()) {
            return fail("matcher.stations must name at least one station".to_string());
        }
        if !(self.match_threshold > 0.0 && self.match_threshold <= 1.0) {
            return fail(format!(
                "matcher.match_threshold must be in (0, 1], got {}",
                self.match_threshold
            ));
        }
        if self.policy == PolicyKind::FrameCountGated && self.min_frames_match == 0 {
            return fail("matcher.min_frames_match must be at least 1 for frame-count-gated".to_string());
        }
        if self.silence_floor_db.is_nan() {
            return fail("matcher.silence_floor_db must be a number".to_string());
        }
        if self.buffer_window_secs == 0 {
            return fail("matcher.buffer_window_secs must be positive".to_string());
        }
        if self.poll_interval_secs == 0 {
            return fail("matcher.poll_interval_secs must be positive".to_string());
        }
        if self.frame_duration_ms == 0 {
            return fail("matcher.frame_duration_ms must be positive".to_string());
        }
        if self.incoming_prefix == self.archive_prefix {
            return fail(format!(
                "matcher.incoming_prefix and matcher.archive_prefix are both '{}'",
                self.incoming_prefix
            ));
        }
        if self.reference_prefix == self.incoming_prefix {
            return fail(format!(
                "matcher.reference_prefix and matcher.incoming_prefix are both '{}'",
                self.reference_prefix
            ));
        }
        Ok(())
    }

    pub fn match_policy(&self) -> MatchPolicy {
        match self.policy {
            PolicyKind::MeanSimilarity => MatchPolicy::MeanSimilarity,
            PolicyKind::FrameCountGated => MatchPolicy::FrameCountGated {
                min_frames: self.min_frames_match,
            },
        }
    }

    pub fn match_settings(&self) -> MatchSettings {
        MatchSettings {
            threshold: self.match_threshold,
            policy: self.match_policy(),
            silence_floor_db: Some(self.silence_floor_db).filter(|db| db.is_finite()),
        }
    }

    pub fn frame_layout(&self) -> FrameLayout {
        FrameLayout::new(self.recording_interval_secs, self.frame_duration_ms)
    }

    pub fn buffer_window(&self) -> Duration {
        Duration::from_secs(self.buffer_window_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn is_station(&self, name: &str) -> bool {
        self.stations.iter().any(|s| s == name)
    }
}

/// Raw bootstrap file
#[derive(Debug, Clone, Default, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    root_folder: Option<PathBuf>,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    matcher: MatcherConfig,
}

/// Resolved service configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Holds the work queue (`queue/`) and result (`results/`) directories
    pub root_folder: PathBuf,
    pub logging: LoggingConfig,
    pub matcher: MatcherConfig,
}

impl ServiceConfig {
    /// Resolve, read and validate configuration.
    ///
    /// A missing bootstrap file is tolerated (defaults apply) but the
    /// resulting matcher section must still validate.
    pub fn load(cli_config: Option<&Path>, cli_root: Option<&Path>) -> Result<Self> {
        let file = match resolve_config_path(cli_config, CONFIG_FILE_NAME) {
            Some(path) => {
                let file: ConfigFile = load_toml_config(&path)?;
                info!("Loaded configuration from {}", path.display());
                file
            }
            None => {
                warn!("No {} found, using built-in defaults", CONFIG_FILE_NAME);
                ConfigFile::default()
            }
        };

        let config = Self {
            root_folder: resolve_root_folder(cli_root, file.root_folder.as_deref()),
            logging: file.logging,
            matcher: file.matcher,
        };
        config.matcher.validate()?;
        Ok(config)
    }

    /// Directory backing the work queue
    pub fn queue_dir(&self) -> PathBuf {
        self.root_folder.join("queue")
    }

    /// Directory backing the result sink
    pub fn results_dir(&self) -> PathBuf {
        self.root_folder.join("results")
    }
}
