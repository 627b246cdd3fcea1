//! osu! beatmap lists.
//!
//! The text format has one beatmap set per line, `<onlineId> <name>`, which
//! is also how osu! names the set folders under `Songs/`. Sets that were
//! never submitted have no numeric id and are written with `-1`. The JSON
//! format is an array of `{"onlineId": "...", "fullName": "..."}` objects
//! with the same `-1` convention.

use std::path::Path;

use beatsync_protocol::{Direction, FileManifestEntry};
use serde::{Deserialize, Serialize};

use crate::ManifestError;

/// Id written for sets without an online id.
const UNSUBMITTED_ID: &str = "-1";

/// One beatmap set from a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeatmapListing {
    /// Online set id; `None` for unsubmitted local sets.
    pub online_id: Option<u64>,
    pub name: String,
}

impl BeatmapListing {
    /// Parses one `<onlineId> <name>` line. Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (id, name) = match line.split_once(char::is_whitespace) {
            Some((id, rest)) => (id, rest.trim_start()),
            None => (line, ""),
        };
        let online_id = if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
            id.parse().ok()
        } else {
            None
        };
        Some(Self {
            online_id,
            name: name.to_string(),
        })
    }

    /// Archive file name, `"<id> <name>.osz"`, safe to use as a single path
    /// segment on any platform.
    pub fn archive_name(&self) -> String {
        let stem = match self.online_id {
            Some(id) if self.name.is_empty() => id.to_string(),
            Some(id) => format!("{id} {}", self.name),
            None => self.name.clone(),
        };
        let mut safe: String = stem
            .chars()
            .map(|c| match c {
                '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
                c if c.is_control() => '_',
                c => c,
            })
            .collect();
        let trimmed = safe.trim_end_matches(['.', ' ']).len();
        safe.truncate(trimmed);
        if safe.is_empty() {
            safe.push_str("unnamed");
        }
        format!("{safe}.osz")
    }

    /// Download entry for this set's archive, or `None` for unsubmitted sets.
    ///
    /// Mirrors do not carry every set, so the entry is skippable.
    pub fn to_download_entry(&self, size_bytes: u64) -> Option<FileManifestEntry> {
        let id = self.online_id?;
        Some(FileManifestEntry {
            id: id.to_string(),
            relative_path: self.archive_name(),
            size_bytes,
            expected_digest: None,
            direction: Direction::Download,
            skippable: true,
        })
    }

    fn id_text(&self) -> String {
        self.online_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| UNSUBMITTED_ID.to_string())
    }
}

/// Parses the text list format, skipping blank lines.
pub fn parse_beatmap_list(text: &str) -> Vec<BeatmapListing> {
    text.lines().filter_map(BeatmapListing::parse).collect()
}

/// Writes listings in the text list format, one per line.
pub fn format_beatmap_list(listings: &[BeatmapListing]) -> String {
    let mut out = String::new();
    for listing in listings {
        out.push_str(&listing.id_text());
        if !listing.name.is_empty() {
            out.push(' ');
            out.push_str(&listing.name);
        }
        out.push('\n');
    }
    out
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonListing {
    online_id: String,
    full_name: String,
}

/// Parses the JSON list format.
pub fn parse_beatmap_json(json: &str) -> Result<Vec<BeatmapListing>, ManifestError> {
    let raw: Vec<JsonListing> = serde_json::from_str(json)?;
    Ok(raw
        .into_iter()
        .map(|item| {
            let id = item.online_id.trim();
            BeatmapListing {
                online_id: if id.bytes().all(|b| b.is_ascii_digit()) {
                    id.parse().ok()
                } else {
                    None
                },
                name: item.full_name,
            }
        })
        .collect())
}

pub fn format_beatmap_json(listings: &[BeatmapListing]) -> Result<String, ManifestError> {
    let raw: Vec<JsonListing> = listings
        .iter()
        .map(|l| JsonListing {
            online_id: l.id_text(),
            full_name: l.name.clone(),
        })
        .collect();
    Ok(serde_json::to_string_pretty(&raw)?)
}

/// Lists the beatmap sets installed in an osu! `Songs` directory.
///
/// Each set folder is named like a list line. Sorted by folder name.
pub fn listings_from_songs_dir(songs_dir: &Path) -> Result<Vec<BeatmapListing>, ManifestError> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(songs_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names.iter().filter_map(|n| BeatmapListing::parse(n)).collect())
}
