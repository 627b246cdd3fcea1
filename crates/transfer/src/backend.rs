//! Persistence bindings for transfer state.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::TransferError;
use crate::state::{StateKey, TransferState};

/// Durable storage for [`TransferState`] records.
///
/// `write` must replace the stored record atomically: after a crash, `read`
/// returns either the previous record or the new one, never a torn mix.
pub trait StateBackend: Send + Sync {
    fn read(&self, key: &StateKey) -> Result<Option<TransferState>, TransferError>;
    fn write(&self, state: &TransferState) -> Result<(), TransferError>;
    fn remove(&self, key: &StateKey) -> Result<(), TransferError>;
    fn list(&self) -> Result<Vec<TransferState>, TransferError>;
}

// ---------------------------------------------------------------------------
// JsonFileBackend
// ---------------------------------------------------------------------------

/// One JSON file per state key under a state directory.
///
/// File names are the SHA-256 of the key, so arbitrary ids and paths map to
/// safe names. Writes go to a sibling temp file that is synced and renamed
/// over the target.
pub struct JsonFileBackend {
    dir: PathBuf,
}

impl JsonFileBackend {
    /// Opens (and creates) the state directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, TransferError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &StateKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.storage_name()))
    }
}

impl StateBackend for JsonFileBackend {
    fn read(&self, key: &StateKey) -> Result<Option<TransferState>, TransferError> {
        let path = self.path_for(key);
        let data = match std::fs::read_to_string(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: TransferState = serde_json::from_str(&data)?;
        Ok(Some(state))
    }

    fn write(&self, state: &TransferState) -> Result<(), TransferError> {
        let path = self.path_for(&state.key());
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(state)?;
        {
            let mut f = std::fs::File::create(&tmp)?;
            std::io::Write::write_all(&mut f, &json)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &path)?;
        debug!(
            file_id = %state.file_id,
            present = state.verified.len(),
            path = %path.display(),
            "persisted transfer state"
        );
        Ok(())
    }

    fn remove(&self, key: &StateKey) -> Result<(), TransferError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<TransferState>, TransferError> {
        let mut states = Vec::new();
        for entry in std::fs::read_dir(&self.dir)?.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = std::fs::read_to_string(&path)
                .map_err(TransferError::from)
                .and_then(|data| Ok(serde_json::from_str::<TransferState>(&data)?));
            match parsed {
                Ok(state) => states.push(state),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable state file"),
            }
        }
        states.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(states)
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// Non-durable backend for tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    states: RwLock<HashMap<StateKey, TransferState>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateBackend for MemoryBackend {
    fn read(&self, key: &StateKey) -> Result<Option<TransferState>, TransferError> {
        Ok(self.states.read().unwrap().get(key).cloned())
    }

    fn write(&self, state: &TransferState) -> Result<(), TransferError> {
        self.states
            .write()
            .unwrap()
            .insert(state.key(), state.clone());
        Ok(())
    }

    fn remove(&self, key: &StateKey) -> Result<(), TransferError> {
        self.states.write().unwrap().remove(key);
        Ok(())
    }

    fn list(&self) -> Result<Vec<TransferState>, TransferError> {
        let mut states: Vec<TransferState> =
            self.states.read().unwrap().values().cloned().collect();
        states.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(states)
    }
}
