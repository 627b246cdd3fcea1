use std::collections::HashSet;
use std::path::Path;

use beatsync_protocol::{Direction, FileManifestEntry};
use beatsync_transfer::{TransferError, validate_relative_path};

use crate::ManifestError;

/// Validated list of files for one session.
///
/// Every relative path stays inside the session root and every id is unique.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<FileManifestEntry>,
}

impl Manifest {
    pub fn new(entries: Vec<FileManifestEntry>) -> Result<Self, ManifestError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            validate_relative_path(&entry.relative_path).map_err(|e| match e {
                TransferError::InvalidPath(msg) => ManifestError::InvalidPath(msg),
                other => other.into(),
            })?;
            if !seen.insert(entry.id.as_str()) {
                return Err(ManifestError::DuplicateId(entry.id.clone()));
            }
        }
        Ok(Self { entries })
    }

    /// Parses a JSON array of entries.
    pub fn from_json_str(json: &str) -> Result<Self, ManifestError> {
        let entries: Vec<FileManifestEntry> = serde_json::from_str(json)?;
        Self::new(entries)
    }

    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string_pretty(&self.entries)?)
    }

    pub fn entries(&self) -> &[FileManifestEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<FileManifestEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.size_bytes).sum()
    }

    /// Number of entries moving in `direction`.
    pub fn count(&self, direction: Direction) -> usize {
        self.entries
            .iter()
            .filter(|e| e.direction == direction)
            .count()
    }
}
