//! # Controller Configuration
//!
//! [`ControllerConfig`] holds the few knobs the suspend controller has. It is
//! usually loaded from a TOML file next to the rest of the server
//! configuration:
//!
//! ```toml
//! start_mode = "suspended"
//! suspend_timeout_secs = 30
//! history_limit = 64
//! ```
//!
//! Every field is optional; missing fields take their defaults and unknown
//! fields are rejected so typos do not go unnoticed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default number of finished operations kept in the history
pub const DEFAULT_HISTORY_LIMIT: usize = 32;

/// Initial state of the controller when it is created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// Activities start out accepting work
    #[default]
    Running,
    /// The server boots suspended and waits for an explicit resume
    Suspended,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    pub start_mode: StartMode,
    /// Default time a graceful shutdown waits for the suspend to finish.
    /// `None` waits indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspend_timeout_secs: Option<u64>,
    /// Finished operations retained for `operation_history`
    pub history_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            start_mode: StartMode::Running,
            suspend_timeout_secs: None,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_start_mode(mut self, start_mode: StartMode) -> Self {
        self.start_mode = start_mode;
        self
    }

    /// Set the default graceful-shutdown timeout.
    ///
    /// The timeout is stored in whole seconds, rounded up, so a sub-second
    /// value never turns into an immediate timeout.
    pub fn with_suspend_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.suspend_timeout_secs =
            timeout.map(|t| t.as_secs() + u64::from(t.subsec_nanos() > 0));
        self
    }

    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    pub fn suspend_timeout(&self) -> Option<Duration> {
        self.suspend_timeout_secs.map(Duration::from_secs)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("Failed to parse controller configuration")
    }

    /// Load a configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }
}
