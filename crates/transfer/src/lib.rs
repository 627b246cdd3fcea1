//! Chunked file transfer primitives with resume support.
//!
//! - [`hash`]: SHA-256 content digests for whole files and byte ranges.
//! - [`plan`]: fixed-size chunk layout with lazily filled per-chunk digests.
//! - [`chunked`]: positional chunk reads and `.part` file writes.
//! - [`state`]: single-writer, crash-safe transfer state persisted through a
//!   pluggable [`StateBackend`].

pub mod backend;
pub mod chunked;
pub mod hash;
pub mod plan;
pub mod state;
mod validation;

use beatsync_protocol::{Digest, ErrorKind};

pub use backend::{JsonFileBackend, MemoryBackend, StateBackend};
pub use chunked::{ChunkReader, ChunkWriter, part_path};
pub use hash::{digest, digest_chunk, digest_file};
pub use plan::{ChunkPlan, ChunkRange};
pub use state::{StateKey, StateLease, TransferState, TransferStateStore};
pub use validation::validate_relative_path;

/// Default chunk size: 4 MiB.
///
/// Large enough to amortize per-chunk digest and request overhead on
/// multi-hundred-megabyte beatmap archives.
pub const DEFAULT_CHUNK_SIZE: u32 = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid chunk size {chunk_size} for {size_bytes} bytes")]
    InvalidChunkSize { size_bytes: u64, chunk_size: u32 },

    #[error("chunk index {index} out of range (total {total})")]
    InvalidIndex { index: u32, total: u32 },

    #[error("digest mismatch on chunk {index}: expected {expected}, got {actual}")]
    DigestMismatch {
        index: u32,
        expected: Digest,
        actual: Digest,
    },

    #[error("incomplete transfer: {present}/{total} chunks present")]
    IncompleteTransfer { present: u32, total: u32 },

    #[error("state store conflict: {0}")]
    StateStoreConflict(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),
}

impl TransferError {
    /// Classification used in session results and persisted state.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) | Self::Json(_) => ErrorKind::Io,
            Self::InvalidChunkSize { .. } | Self::InvalidIndex { .. } => ErrorKind::InvalidIndex,
            Self::DigestMismatch { .. } => ErrorKind::DigestMismatch,
            Self::IncompleteTransfer { .. } => ErrorKind::IncompleteTransfer,
            Self::StateStoreConflict(_) => ErrorKind::StateStoreConflict,
            Self::InvalidPath(_) => ErrorKind::InvalidPath,
        }
    }
}
