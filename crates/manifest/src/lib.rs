//! Inputs to a sync session.
//!
//! - [`Manifest`]: JSON list of files to synchronize, validated on load.
//! - [`scan_upload_manifest`]: builds an upload manifest from a directory.
//! - [`beatmaps`]: the osu! beatmap list formats and download entries.

pub mod beatmaps;
pub mod manifest;
pub mod scanner;

pub use beatmaps::{
    BeatmapListing, format_beatmap_json, format_beatmap_list, listings_from_songs_dir,
    parse_beatmap_json, parse_beatmap_list,
};
pub use manifest::Manifest;
pub use scanner::scan_upload_manifest;

/// Errors from manifest loading and scanning.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("duplicate file id: {0}")]
    DuplicateId(String),

    #[error(transparent)]
    Transfer(#[from] beatsync_transfer::TransferError),
}
