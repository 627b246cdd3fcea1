//! Sync engine error types.

use beatsync_protocol::{Digest, Direction, ErrorKind};
use beatsync_transfer::TransferError;

use crate::transport::TransportError;

/// Errors produced while syncing a file.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no {0:?} transport configured")]
    MissingCapability(Direction),

    #[error("source changed while uploading chunk {index}")]
    SourceChanged { index: u32 },

    #[error("file digest mismatch: expected {expected}, got {actual}")]
    FileDigestMismatch { expected: Digest, actual: Digest },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("cancelled")]
    Cancelled,
}

impl SyncError {
    /// Classification recorded in state and session results.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transfer(e) => e.kind(),
            Self::Transport(e) => e.error_kind(),
            Self::MissingCapability(_) => ErrorKind::MissingCapability,
            Self::SourceChanged { .. } | Self::Join(_) | Self::Config(_) => ErrorKind::Io,
            Self::FileDigestMismatch { .. } => ErrorKind::DigestMismatch,
            Self::Cancelled => ErrorKind::IncompleteTransfer,
        }
    }
}
