use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;

/// Which way a file moves relative to the local machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "upload")]
    Upload,
    #[serde(rename = "download")]
    Download,
}

/// One file to synchronize in a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifestEntry {
    /// Stable identifier (content key or server-assigned id).
    pub id: String,
    /// Path relative to the session's local root.
    pub relative_path: String,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_digest: Option<Digest>,
    pub direction: Direction,
    /// Best-effort entry: its failure does not fail the session.
    #[serde(default, skip_serializing_if = "is_false")]
    pub skippable: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Persisted status of a single file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in_progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

/// Error classification recorded per file and reported in session results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Local file read/write failure.
    Io,
    /// Retryable network failure that exhausted its retries.
    TransportTransient,
    /// Non-retryable rejection by the remote side.
    TransportPermanent,
    /// Integrity check failed.
    DigestMismatch,
    InvalidIndex,
    IncompleteTransfer,
    /// Two writers raced for the same state key.
    StateStoreConflict,
    InvalidPath,
    /// No transport capability is configured for the file's direction.
    MissingCapability,
}

impl ErrorKind {
    /// Returns `true` for errors the scheduler retries at chunk level.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransportTransient | Self::DigestMismatch)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Io => "I/O error",
            Self::TransportTransient => "transient transport error",
            Self::TransportPermanent => "permanent transport error",
            Self::DigestMismatch => "digest mismatch",
            Self::InvalidIndex => "invalid chunk index",
            Self::IncompleteTransfer => "incomplete transfer",
            Self::StateStoreConflict => "state store conflict",
            Self::InvalidPath => "invalid path",
            Self::MissingCapability => "missing transport capability",
        };
        f.write_str(s)
    }
}

/// Point-in-time session progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub files_completed: u32,
    pub files_failed: u32,
    pub files_total: u32,
    pub bytes_transferred: u64,
    pub bytes_total: u64,
    #[serde(default)]
    pub bytes_per_second: f64,
}

impl ProgressSnapshot {
    /// Returns the byte progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / self.bytes_total as f64 * 100.0
    }
}

/// Session lifecycle: `Created -> Running -> {Completed | Cancelled | Failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionStatus {
    #[serde(rename = "created")]
    Created,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "cancelled")]
    Cancelled,
    #[serde(rename = "failed")]
    Failed,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Final outcome of one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum FileOutcome {
    Completed,
    Failed(ErrorKind),
    Cancelled,
}

/// Aggregated result of a finished session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResult {
    pub status: SessionStatus,
    pub succeeded_files: Vec<String>,
    pub failed_files: BTreeMap<String, ErrorKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cancelled_files: Vec<String>,
}

impl SessionResult {
    /// Returns the outcome recorded for `file_id`, if it was part of the session.
    pub fn outcome(&self, file_id: &str) -> Option<FileOutcome> {
        if self.succeeded_files.iter().any(|id| id == file_id) {
            return Some(FileOutcome::Completed);
        }
        if let Some(kind) = self.failed_files.get(file_id) {
            return Some(FileOutcome::Failed(*kind));
        }
        if self.cancelled_files.iter().any(|id| id == file_id) {
            return Some(FileOutcome::Cancelled);
        }
        None
    }
}
