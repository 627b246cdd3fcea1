//! Transport capability traits.
//!
//! The engine never talks to the network directly. Callers inject a
//! [`ChunkUploader`] and/or [`ChunkDownloader`] through [`Transports`]; the
//! HTTP binding lives in its own crate and tests use in-memory fakes.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use beatsync_protocol::{Digest, ErrorKind, FileManifestEntry};

/// Identifies one chunk of one file on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub file_id: String,
    pub relative_path: String,
    pub index: u32,
    pub offset: u64,
    pub length: u32,
    /// Digest the chunk is expected to have, when known before transfer.
    pub digest: Option<Digest>,
}

/// Acknowledgement of an uploaded chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    /// Digest the remote side computed, if it reports one.
    pub digest: Option<Digest>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Worth retrying (timeouts, resets, 5xx, throttling).
    Transient,
    /// Retrying will not help (rejected, not found, forbidden).
    Permanent,
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => f.write_str("transient"),
            Self::Permanent => f.write_str("permanent"),
        }
    }
}

/// Failure reported by a transport binding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind} transport error: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TransportErrorKind::Transient
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self.kind {
            TransportErrorKind::Transient => ErrorKind::TransportTransient,
            TransportErrorKind::Permanent => ErrorKind::TransportPermanent,
        }
    }
}

/// Sends chunks to the remote side.
pub trait ChunkUploader: Send + Sync {
    fn send_chunk<'a>(
        &'a self,
        request: &'a ChunkRequest,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Ack, TransportError>> + Send + 'a>>;
}

/// Fetches chunks from the remote side.
pub trait ChunkDownloader: Send + Sync {
    /// Returns exactly `request.length` bytes starting at `request.offset`.
    fn fetch_chunk<'a>(
        &'a self,
        request: &'a ChunkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a>>;

    /// Per-chunk digests published by the remote side, if any.
    ///
    /// Bindings without such metadata keep the default; chunk digests are then
    /// learned as chunks arrive.
    fn chunk_digests<'a>(
        &'a self,
        _entry: &'a FileManifestEntry,
        _chunk_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<Digest>>, TransportError>> + Send + 'a>>
    {
        Box::pin(async { Ok(None) })
    }
}

/// Transport capabilities available to a session.
#[derive(Clone, Default)]
pub struct Transports {
    pub uploader: Option<Arc<dyn ChunkUploader>>,
    pub downloader: Option<Arc<dyn ChunkDownloader>>,
}

impl Transports {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn ChunkUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn with_downloader(mut self, downloader: Arc<dyn ChunkDownloader>) -> Self {
        self.downloader = Some(downloader);
        self
    }

    /// Uses one binding for both directions.
    pub fn both<T>(transport: Arc<T>) -> Self
    where
        T: ChunkUploader + ChunkDownloader + 'static,
    {
        let uploader: Arc<dyn ChunkUploader> = transport.clone();
        let downloader: Arc<dyn ChunkDownloader> = transport;
        Self {
            uploader: Some(uploader),
            downloader: Some(downloader),
        }
    }
}

/// Applies an optional deadline to a transport call; expiry is transient.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, TransportError>
where
    F: Future<Output = Result<T, TransportError>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| TransportError::transient(format!("timed out after {limit:?}")))?,
        None => fut.await,
    }
}
