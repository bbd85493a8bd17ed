//! Configuration types for the zjs runtime.
//!
//! `RuntimeConfig` can be built in code or loaded from a JSON document such
//! as:
//!
//! ```json
//! { "autoExit": false, "exitAfterMs": 5000, "queueCapacity": 64 }
//! ```

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::ZjsResult;

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RuntimeConfig {
    /// Exit the run loop once two consecutive iterations find no timers or
    /// callbacks.
    /// Default: true
    pub auto_exit: bool,

    /// Stop the run loop after this many milliseconds.
    /// Default: None (no deadline)
    pub exit_after_ms: Option<u64>,

    /// Maximum number of pending callback requests. `None` means unbounded.
    /// Default: None
    pub queue_capacity: Option<usize>,

    /// Total bytes all live buffers may hold. `None` means limited only by
    /// the allocator.
    /// Default: None
    pub buffer_memory_limit: Option<usize>,

    /// Longest single block of the run loop while waiting for work.
    /// Default: 1000ms
    pub max_idle_wait_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auto_exit: true,
            exit_after_ms: None,
            queue_capacity: None,
            buffer_memory_limit: None,
            max_idle_wait_ms: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep running even when there is nothing left to do.
    pub fn no_exit() -> Self {
        Self {
            auto_exit: false,
            ..Default::default()
        }
    }

    pub fn auto_exit(mut self, enabled: bool) -> Self {
        self.auto_exit = enabled;
        self
    }

    pub fn exit_after(mut self, after: Duration) -> Self {
        self.exit_after_ms = Some(millis(after));
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn buffer_memory_limit(mut self, bytes: usize) -> Self {
        self.buffer_memory_limit = Some(bytes);
        self
    }

    pub fn max_idle_wait(mut self, wait: Duration) -> Self {
        self.max_idle_wait_ms = millis(wait);
        self
    }

    pub fn exit_after_duration(&self) -> Option<Duration> {
        self.exit_after_ms.map(Duration::from_millis)
    }

    pub fn max_idle_wait_duration(&self) -> Duration {
        Duration::from_millis(self.max_idle_wait_ms)
    }

    /// Parse configuration from a JSON string. Missing fields take their
    /// defaults.
    pub fn from_json(json: &str) -> ZjsResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> ZjsResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&content)
    }
}

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
