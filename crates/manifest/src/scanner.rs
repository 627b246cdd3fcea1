//! Directory scanning for upload.
//!
//! Recursively walks a directory and produces upload entries keyed by
//! content, with relative paths normalized to forward slashes.

use std::collections::HashMap;
use std::path::Path;

use beatsync_protocol::{Direction, FileManifestEntry};
use beatsync_transfer::digest_file;
use tracing::debug;

use crate::ManifestError;

/// Scans `root` recursively into upload entries.
///
/// Entries are sorted by path and symlinks are skipped. Each id is the hex
/// digest of the file's content; a second file with identical content gets
/// `#2`, `#3`, ... appended so ids stay unique. `prefix`, when not empty, is
/// prepended to every relative path.
pub fn scan_upload_manifest(
    root: &Path,
    prefix: &str,
) -> Result<Vec<FileManifestEntry>, ManifestError> {
    let mut paths = Vec::new();
    walk_dir(root, root, &mut paths)?;
    paths.sort();

    let prefix = prefix.trim_matches('/');
    let mut seen: HashMap<String, u32> = HashMap::new();
    let mut entries = Vec::with_capacity(paths.len());

    for rel in paths {
        let path = root.join(&rel);
        let size_bytes = std::fs::metadata(&path)?.len();
        let digest = digest_file(&path)?;

        let hex = digest.to_hex();
        let copies = seen.entry(hex.clone()).or_default();
        *copies += 1;
        let id = if *copies == 1 {
            hex
        } else {
            format!("{hex}#{copies}")
        };

        let relative_path = if prefix.is_empty() {
            rel
        } else {
            format!("{prefix}/{rel}")
        };
        debug!(path = %relative_path, size_bytes, digest = %digest.short(), "scanned file");

        entries.push(FileManifestEntry {
            id,
            relative_path,
            size_bytes,
            expected_digest: Some(digest),
            direction: Direction::Upload,
            skippable: false,
        });
    }

    Ok(entries)
}

fn walk_dir(root: &Path, current: &Path, files: &mut Vec<String>) -> Result<(), ManifestError> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;

        if file_type.is_symlink() {
            debug!(path = %path.display(), "skipping symlink");
        } else if file_type.is_dir() {
            walk_dir(root, &path, files)?;
        } else if file_type.is_file() {
            let rel = path.strip_prefix(root).map_err(std::io::Error::other)?;
            files.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}
