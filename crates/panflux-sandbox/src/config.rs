//! Sandbox configuration.
//!
//! [`SandboxConfig`] controls the engine's behavior that is not dictated by
//! the wire protocol.  Defaults come from the [`Default`] implementation and
//! a builder-style API allows callers to customise individual fields.  The
//! struct deserializes from host configuration files; missing keys keep
//! their defaults.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Runtime options for a [`Sandbox`](crate::Sandbox).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Initial verbosity, as a protocol level name.
    ///
    /// Default: **`info`**.
    pub log_level: String,

    /// Re-attempt discoveries held back on an unresolved `extends` once the
    /// first entity of the referenced type is discovered.
    ///
    /// Default: **true**.
    pub retry_deferred_discoveries: bool,

    /// Send a `pendingChanges` notification every time a delta is queued.
    ///
    /// Default: **true**.
    pub announce_pending_changes: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            retry_deferred_discoveries: true,
            announce_pending_changes: true,
        }
    }
}

impl SandboxConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Set the initial log level.
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Enable or disable retrying deferred discoveries.
    pub fn with_retry_deferred_discoveries(mut self, retry: bool) -> Self {
        self.retry_deferred_discoveries = retry;
        self
    }

    /// Enable or disable `pendingChanges` notifications.
    pub fn with_announce_pending_changes(mut self, announce: bool) -> Self {
        self.announce_pending_changes = announce;
        self
    }
}
