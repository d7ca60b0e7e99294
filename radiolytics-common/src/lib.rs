//! # Radiolytics Common Library
//!
//! Shared code for the Radiolytics services including:
//! - Error type used across crates
//! - TOML bootstrap configuration and root folder resolution
//! - Logging initialisation
//! - Timestamp helpers

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use error::{Error, Result};
