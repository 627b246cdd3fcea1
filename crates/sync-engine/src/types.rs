use std::time::Duration;

use beatsync_protocol::{Direction, ErrorKind, SessionStatus};

/// Events emitted by a running session, one per state change.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    /// A file's chunk plan and resume state are ready.
    FileStarted {
        file_id: String,
        direction: Direction,
        total_chunks: u32,
        present_chunks: u32,
    },
    ChunkVerified {
        file_id: String,
        index: u32,
        bytes: u32,
    },
    /// A chunk attempt failed and is scheduled again after `delay`.
    ChunkRetry {
        file_id: String,
        index: u32,
        attempt: u32,
        error: ErrorKind,
        delay: Duration,
    },
    FileCompleted {
        file_id: String,
    },
    FileFailed {
        file_id: String,
        error: ErrorKind,
    },
    FileCancelled {
        file_id: String,
    },
    SessionFinished {
        status: SessionStatus,
    },
}

impl SyncEvent {
    /// File the event refers to, if any.
    pub fn file_id(&self) -> Option<&str> {
        match self {
            Self::FileStarted { file_id, .. }
            | Self::ChunkVerified { file_id, .. }
            | Self::ChunkRetry { file_id, .. }
            | Self::FileCompleted { file_id }
            | Self::FileFailed { file_id, .. }
            | Self::FileCancelled { file_id } => Some(file_id),
            Self::SessionFinished { .. } => None,
        }
    }
}
