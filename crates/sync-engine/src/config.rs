use std::time::Duration;

use beatsync_transfer::DEFAULT_CHUNK_SIZE;
use serde::{Deserialize, Serialize};

use crate::error::SyncError;
use crate::retry::RetryPolicy;

/// Per-call transport deadline unless configured otherwise.
pub const DEFAULT_TRANSPORT_TIMEOUT_SECS: u64 = 60;

/// Engine tuning knobs.
///
/// Every field has a default, so a partial TOML table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Chunk size in bytes.
    pub chunk_size: u32,
    /// Chunks of one file in flight at once.
    pub per_file_concurrency: usize,
    /// Files transferred at once.
    pub file_concurrency: usize,
    /// Per-call transport deadline. `None` (only reachable from code) waits
    /// indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_timeout_secs: Option<u64>,
    /// Re-hash present chunks of a partial download before resuming.
    pub revalidate_on_resume: bool,
    /// Remove the persisted state of a file once it completes.
    pub purge_completed_state: bool,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            per_file_concurrency: 4,
            file_concurrency: 2,
            transport_timeout_secs: Some(DEFAULT_TRANSPORT_TIMEOUT_SECS),
            revalidate_on_resume: true,
            purge_completed_state: true,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, SyncError> {
        toml::from_str::<Self>(s)
            .map_err(|e| SyncError::Config(e.to_string()))?
            .validate()
    }

    /// Rejects unusable values and clamps the rest into range.
    pub fn validate(mut self) -> Result<Self, SyncError> {
        if self.chunk_size == 0 {
            return Err(SyncError::Config("chunk_size must be greater than 0".into()));
        }
        if self.transport_timeout_secs == Some(0) {
            return Err(SyncError::Config(
                "transport_timeout_secs must be greater than 0".into(),
            ));
        }
        self.per_file_concurrency = self.per_file_concurrency.max(1);
        self.file_concurrency = self.file_concurrency.max(1);
        if self.retry.backoff_factor.is_nan() || self.retry.backoff_factor < 1.0 {
            self.retry.backoff_factor = 1.0;
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            self.retry.max_delay_ms = self.retry.initial_delay_ms;
        }
        Ok(self)
    }

    pub fn transport_timeout(&self) -> Option<Duration> {
        self.transport_timeout_secs.map(Duration::from_secs)
    }
}
