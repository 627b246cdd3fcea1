//! HTTP binding for the beatsync engine.
//!
//! [`HttpTransport`] implements both transport capabilities: chunk uploads
//! to a sync server and ranged downloads from a beatmap mirror or the
//! server's file tree.

pub mod client;
pub mod config;

pub use client::{
    CHUNK_DIGEST_HEADER, HttpError, HttpTransport, content_range_start, files_path,
    is_transient_status, mirror_path, range_header,
};
pub use config::{DEFAULT_MIRROR_URL, DownloadRoute, HttpConfig};
