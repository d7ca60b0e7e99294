//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration is a TOML file. Its location resolves in priority order:
//! 1. Command-line argument (highest priority)
//! 2. `RADIOLYTICS_CONFIG` environment variable
//! 3. User config directory (`~/.config/radiolytics/<file>`)
//! 4. System config directory (`/etc/radiolytics/<file>`, Linux only)
//!
//! A missing file is not fatal here; callers fall back to built-in defaults and
//! decide for themselves which settings are mandatory.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "RADIOLYTICS_CONFIG";

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV_VAR: &str = "RADIOLYTICS_ROOT_FOLDER";

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr only if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Locate the bootstrap config file, if any.
///
/// An explicit CLI path is returned even when it does not exist, so that a
/// typo surfaces as a load error instead of silently using defaults.
pub fn resolve_config_path(cli_arg: Option<&Path>, file_name: &str) -> Option<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    // Priority 3: User config directory
    if let Some(user_config) = dirs::config_dir().map(|d| d.join("radiolytics").join(file_name)) {
        if user_config.exists() {
            return Some(user_config);
        }
    }

    // Priority 4: System config directory
    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/radiolytics").join(file_name);
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// Read and deserialize a TOML config file
pub fn load_toml_config<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Root folder resolution priority:
/// 1. Command-line argument
/// 2. `RADIOLYTICS_ROOT_FOLDER` environment variable
/// 3. TOML config value
/// 4. OS-dependent compiled default
pub fn resolve_root_folder(cli_arg: Option<&Path>, toml_value: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_value {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// Get OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    if cfg!(target_os = "linux") {
        // ~/.local/share/radiolytics (or /var/lib/radiolytics for system-wide)
        dirs::data_local_dir()
            .map(|d| d.join("radiolytics"))
            .unwrap_or_else(|| PathBuf::from("/var/lib/radiolytics"))
    } else if cfg!(target_os = "macos") {
        dirs::data_dir()
            .map(|d| d.join("radiolytics"))
            .unwrap_or_else(|| PathBuf::from("/Library/Application Support/radiolytics"))
    } else if cfg!(target_os = "windows") {
        dirs::data_local_dir()
            .map(|d| d.join("radiolytics"))
            .unwrap_or_else(|| PathBuf::from("C:\\ProgramData\\radiolytics"))
    } else {
        PathBuf::from("./radiolytics_data")
    }
}
