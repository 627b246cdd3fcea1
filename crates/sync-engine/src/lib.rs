//! Resumable, chunked file sync engine.
//!
//! This crate implements the **transfer logic**: it plans files into
//! chunks, moves missing chunks through injected transport capabilities,
//! verifies each one, and records progress in a crash-safe state store so
//! interrupted sessions resume where they stopped. It has no network code of
//! its own; the caller provides a [`ChunkUploader`] and/or [`ChunkDownloader`].
//!
//! # Flow
//!
//! 1. **Plan**: compute the chunk layout of each manifest entry
//! 2. **Resume**: open the file's state lease and skip verified chunks
//! 3. **Transfer**: dispatch missing chunks with bounded concurrency
//! 4. **Retry**: back off transient failures and digest mismatches
//! 5. **Finish**: verify the whole file, rename into place, purge state

pub mod config;
pub mod error;
pub mod progress;
pub mod retry;
mod scheduler;
pub mod session;
pub mod transport;
pub mod types;

// Re-export primary types for convenience.
pub use config::{DEFAULT_TRANSPORT_TIMEOUT_SECS, SyncConfig};
pub use error::SyncError;
pub use progress::{ProgressTracker, SpeedCalculator};
pub use retry::RetryPolicy;
pub use session::{SessionHandle, SyncSession};
pub use transport::{
    Ack, ChunkDownloader, ChunkRequest, ChunkUploader, TransportError, TransportErrorKind,
    Transports,
};
pub use types::SyncEvent;
