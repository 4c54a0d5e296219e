//! Error types for terrafarm

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Terrafarm result type
pub type Result<T> = std::result::Result<T, TerrafarmError>;

/// Errors that can occur while managing a farm
#[derive(Error, Debug)]
pub enum TerrafarmError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// SSH transport error
    #[error("SSH error: {0}")]
    Ssh(#[from] openssh::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Resolved preferences failed validation
    #[error("Invalid preferences:\n  {}", .0.join("\n  "))]
    InvalidPreferences(Vec<String>),

    /// Provisioning tool exited with a non-zero status
    #[error("terraform {action} failed: {stderr}")]
    Provisioning {
        /// Action that was run (apply/destroy)
        action: String,
        /// Captured standard error of the tool
        stderr: String,
    },

    /// A state file exists but can't be decoded
    #[error("State file {path} is corrupted: {source}")]
    StateCorrupted {
        /// Path of the unreadable file
        path: PathBuf,
        /// Decoder error
        #[source]
        source: serde_json::Error,
    },

    /// Monitor state is required but absent
    #[error("Monitor state file {0} does not exist")]
    MonitorStateMissing(PathBuf),

    /// Farm state is required but absent
    #[error("Farm state file {0} does not exist")]
    FarmStateMissing(PathBuf),

    /// Monitor process failed to come up
    #[error("Monitor launch error: {0}")]
    MonitorLaunch(String),

    /// Timeout
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// DigitalOcean API returned something unexpected
    #[error("DigitalOcean API error: {0}")]
    Api(String),
}

impl TerrafarmError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a monitor launch error
    pub fn monitor_launch(msg: impl Into<String>) -> Self {
        Self::MonitorLaunch(msg.into())
    }

    /// Create an API error
    pub fn api(msg: impl Into<String>) -> Self {
        Self::Api(msg.into())
    }

    /// Create a provisioning failure for the given action
    pub fn provisioning(action: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Provisioning {
            action: action.into(),
            stderr: stderr.into(),
        }
    }

    /// True for errors the monitor can't recover from by waiting another tick
    pub fn is_fatal_for_monitor(&self) -> bool {
        matches!(
            self,
            Self::StateCorrupted { .. }
                | Self::MonitorStateMissing(_)
                | Self::FarmStateMissing(_)
                | Self::Config(_)
        )
    }
}
