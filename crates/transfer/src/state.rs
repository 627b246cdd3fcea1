//! Transfer state store.
//!
//! Tracks which chunks of a file have been transferred and verified, so an
//! interrupted transfer resumes without repeating verified chunks.
//!
//! Writers go through a [`StateLease`]: [`TransferStateStore::open`] hands out
//! at most one lease per [`StateKey`], and every lease mutation is persisted
//! before it becomes visible in memory. A crash between "chunk bytes written"
//! and "state updated" therefore leaves the chunk absent, and a resumed
//! session fetches and verifies it again.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex};

use beatsync_protocol::{Digest, ErrorKind, TransferStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::backend::{MemoryBackend, StateBackend};
use crate::hash::digest;
use crate::plan::{ChunkPlan, ChunkRange};

/// Identity of a persisted transfer: file id plus local destination path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StateKey {
    pub file_id: String,
    pub destination: String,
}

impl StateKey {
    pub fn new(file_id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            destination: destination.into(),
        }
    }

    /// Filesystem-safe name derived from the key.
    pub fn storage_name(&self) -> String {
        let raw = format!("{}\n{}", self.file_id, self.destination);
        digest(raw.as_bytes()).to_hex()
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.file_id, self.destination)
    }
}

/// Persisted progress of one file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferState {
    pub file_id: String,
    pub destination: String,
    pub chunk_size: u32,
    pub total_chunks: u32,
    /// Verified chunk indices and the digest each was verified against.
    pub verified: BTreeMap<u32, Digest>,
    pub status: TransferStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ErrorKind>,
    pub updated_at: DateTime<Utc>,
}

impl TransferState {
    /// A pending state with no chunks present.
    pub fn fresh(key: &StateKey, chunk_size: u32, total_chunks: u32) -> Self {
        Self {
            file_id: key.file_id.clone(),
            destination: key.destination.clone(),
            chunk_size,
            total_chunks,
            verified: BTreeMap::new(),
            status: TransferStatus::Pending,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> StateKey {
        StateKey::new(self.file_id.clone(), self.destination.clone())
    }

    pub fn is_present(&self, index: u32) -> bool {
        self.verified.contains_key(&index)
    }

    /// Indices of verified chunks, ascending.
    pub fn present_chunks(&self) -> impl Iterator<Item = u32> + '_ {
        self.verified.keys().copied()
    }

    /// Indices not yet verified, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.verified.contains_key(i))
            .collect()
    }

    /// Returns `true` when every chunk index is present.
    pub fn is_complete(&self) -> bool {
        self.verified.len() as u64 == u64::from(self.total_chunks)
            && self.verified.keys().all(|&i| i < self.total_chunks)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

// ---------------------------------------------------------------------------
// TransferStateStore
// ---------------------------------------------------------------------------

/// Owner of all persisted transfer state.
#[derive(Clone)]
pub struct TransferStateStore {
    backend: Arc<dyn StateBackend>,
    leased: Arc<Mutex<HashSet<StateKey>>>,
}

impl TransferStateStore {
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            backend,
            leased: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Store backed by [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Returns the persisted state for `key`, or a fresh pending state.
    pub fn load(&self, key: &StateKey) -> Result<TransferState, TransferError> {
        Ok(self
            .backend
            .read(key)?
            .unwrap_or_else(|| TransferState::fresh(key, 0, 0)))
    }

    /// Returns every persisted state.
    pub fn list(&self) -> Result<Vec<TransferState>, TransferError> {
        self.backend.list()
    }

    /// Returns `true` while a lease for `key` is held.
    pub fn is_leased(&self, key: &StateKey) -> bool {
        self.leased.lock().unwrap().contains(key)
    }

    /// Acquires the single writer lease for `key`.
    ///
    /// Persisted state is reconciled against `plan`: a state planned with a
    /// different chunk layout is replaced by a fresh one, chunks whose recorded
    /// digest disagrees with a filled plan slot are dropped, and empty plan
    /// slots are seeded from recorded digests.
    pub fn open(&self, key: StateKey, plan: ChunkPlan) -> Result<StateLease, TransferError> {
        let slot = LeaseSlot::acquire(&self.leased, key)?;
        let pristine_plan = plan.clone();
        let mut plan = plan;
        let state = self.reconcile(&slot.key, &mut plan)?;
        debug!(
            key = %slot.key,
            present = state.verified.len(),
            total = state.total_chunks,
            status = ?state.status,
            "opened transfer state"
        );
        Ok(StateLease {
            backend: Arc::clone(&self.backend),
            inner: Mutex::new(LeaseInner {
                state,
                plan,
                pristine_plan,
            }),
            slot,
        })
    }

    /// Removes a completed transfer's state.
    pub fn purge(&self, key: &StateKey) -> Result<(), TransferError> {
        let _slot = LeaseSlot::acquire(&self.leased, key.clone())?;
        let state = self.load(key)?;
        if state.status != TransferStatus::Completed {
            return Err(TransferError::IncompleteTransfer {
                present: state.verified.len() as u32,
                total: state.total_chunks,
            });
        }
        self.backend.remove(key)
    }

    /// Drops a transfer's state regardless of its status.
    pub fn discard(&self, key: &StateKey) -> Result<(), TransferError> {
        let _slot = LeaseSlot::acquire(&self.leased, key.clone())?;
        self.backend.remove(key)?;
        info!(key = %key, "discarded transfer state");
        Ok(())
    }

    fn reconcile(
        &self,
        key: &StateKey,
        plan: &mut ChunkPlan,
    ) -> Result<TransferState, TransferError> {
        let mut state = match self.backend.read(key)? {
            Some(s)
                if s.chunk_size == plan.chunk_size() && s.total_chunks == plan.total_chunks() =>
            {
                s
            }
            Some(s) => {
                warn!(
                    key = %key,
                    old_chunk_size = s.chunk_size,
                    old_total = s.total_chunks,
                    chunk_size = plan.chunk_size(),
                    total = plan.total_chunks(),
                    "chunk layout changed, restarting transfer"
                );
                let fresh = TransferState::fresh(key, plan.chunk_size(), plan.total_chunks());
                self.backend.write(&fresh)?;
                return Ok(fresh);
            }
            None => {
                return Ok(TransferState::fresh(
                    key,
                    plan.chunk_size(),
                    plan.total_chunks(),
                ));
            }
        };

        let mut stale = Vec::new();
        for (&index, &recorded) in &state.verified {
            match plan.digest(index) {
                Ok(Some(expected)) if expected != recorded => stale.push(index),
                Ok(Some(_)) => {}
                Ok(None) => plan.set_digest(index, recorded)?,
                Err(_) => stale.push(index),
            }
        }

        if !stale.is_empty() {
            warn!(key = %key, chunks = ?stale, "dropping chunks whose content changed");
            for index in &stale {
                state.verified.remove(index);
            }
            if state.status == TransferStatus::Completed {
                state.status = TransferStatus::InProgress;
            }
            state.touch();
            self.backend.write(&state)?;
        }

        Ok(state)
    }
}

/// Registration of a held key; released on drop.
struct LeaseSlot {
    key: StateKey,
    leased: Arc<Mutex<HashSet<StateKey>>>,
}

impl LeaseSlot {
    fn acquire(
        leased: &Arc<Mutex<HashSet<StateKey>>>,
        key: StateKey,
    ) -> Result<Self, TransferError> {
        if !leased.lock().unwrap().insert(key.clone()) {
            return Err(TransferError::StateStoreConflict(format!(
                "{key} already has a writer"
            )));
        }
        Ok(Self {
            key,
            leased: Arc::clone(leased),
        })
    }
}

impl Drop for LeaseSlot {
    fn drop(&mut self) {
        self.leased.lock().unwrap().remove(&self.key);
    }
}

// ---------------------------------------------------------------------------
// StateLease
// ---------------------------------------------------------------------------

struct LeaseInner {
    state: TransferState,
    plan: ChunkPlan,
    /// Plan as handed to `open`, before slots were seeded from state.
    pristine_plan: ChunkPlan,
}

/// Exclusive writer for one transfer's state.
///
/// Mutations are serialized by an internal mutex, so concurrent chunk tasks
/// of the same file may share the lease behind an `Arc`.
pub struct StateLease {
    backend: Arc<dyn StateBackend>,
    inner: Mutex<LeaseInner>,
    slot: LeaseSlot,
}

impl StateLease {
    pub fn key(&self) -> &StateKey {
        &self.slot.key
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> TransferState {
        self.inner.lock().unwrap().state.clone()
    }

    pub fn chunk_range(&self, index: u32) -> Result<ChunkRange, TransferError> {
        self.inner.lock().unwrap().plan.chunk_range(index)
    }

    /// Digest chunk `index` must match, if already known.
    pub fn expected_digest(&self, index: u32) -> Result<Option<Digest>, TransferError> {
        self.inner.lock().unwrap().plan.digest(index)
    }

    pub fn status(&self) -> TransferStatus {
        self.inner.lock().unwrap().state.status
    }

    pub fn missing_chunks(&self) -> Vec<u32> {
        self.inner.lock().unwrap().state.missing_chunks()
    }

    pub fn present_chunks(&self) -> Vec<u32> {
        self.inner.lock().unwrap().state.present_chunks().collect()
    }

    /// Total bytes covered by verified chunks.
    pub fn present_bytes(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner
            .state
            .present_chunks()
            .filter_map(|i| inner.plan.chunk_range(i).ok())
            .map(|r| u64::from(r.length))
            .sum()
    }

    /// Records chunk `index` as transferred and verified.
    ///
    /// Idempotent: re-marking a present chunk with the same digest is a no-op.
    /// An empty plan slot is filled with `digest`; a filled slot must match,
    /// otherwise the chunk stays absent and `DigestMismatch` is returned.
    /// Returns `true` if the chunk was newly added.
    pub fn mark_chunk_verified(&self, index: u32, digest: Digest) -> Result<bool, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        let expected = inner.plan.digest(index)?;
        if let Some(expected) = expected
            && expected != digest
        {
            return Err(TransferError::DigestMismatch {
                index,
                expected,
                actual: digest,
            });
        }
        if inner.state.verified.get(&index) == Some(&digest) {
            return Ok(false);
        }

        let mut next = inner.state.clone();
        next.verified.insert(index, digest);
        if next.status == TransferStatus::Pending {
            next.status = TransferStatus::InProgress;
        }
        next.touch();
        self.backend.write(&next)?;
        inner.state = next;
        if expected.is_none() {
            inner.plan.set_digest(index, digest)?;
        }
        Ok(true)
    }

    /// Drops chunk `index` from the present set (e.g. local bytes were lost).
    pub fn forget_chunk(&self, index: u32) -> Result<bool, TransferError> {
        let mut inner = self.inner.lock().unwrap();
        inner.plan.chunk_range(index)?;
        if !inner.state.verified.contains_key(&index) {
            return Ok(false);
        }
        let mut next = inner.state.clone();
        next.verified.remove(&index);
        if next.status == TransferStatus::Completed {
            next.status = TransferStatus::InProgress;
        }
        next.touch();
        self.backend.write(&next)?;
        inner.state = next;
        Ok(true)
    }

    /// Clears every present chunk and lazily learned digest.
    pub fn reset(&self) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        let next = TransferState::fresh(
            &self.slot.key,
            inner.state.chunk_size,
            inner.state.total_chunks,
        );
        self.backend.write(&next)?;
        inner.state = next;
        inner.plan = inner.pristine_plan.clone();
        Ok(())
    }

    pub fn mark_in_progress(&self) -> Result<(), TransferError> {
        self.set_status(TransferStatus::InProgress, None)
    }

    pub fn mark_failed(&self, kind: ErrorKind) -> Result<(), TransferError> {
        self.set_status(TransferStatus::Failed, Some(kind))
    }

    /// Marks the transfer completed.
    ///
    /// Fails with `IncompleteTransfer` unless every chunk is present, and with
    /// `DigestMismatch` if a recorded digest disagrees with the plan.
    pub fn mark_completed(&self) -> Result<(), TransferError> {
        {
            let inner = self.inner.lock().unwrap();
            if !inner.state.is_complete() {
                return Err(TransferError::IncompleteTransfer {
                    present: inner.state.verified.len() as u32,
                    total: inner.state.total_chunks,
                });
            }
            for (&index, &recorded) in &inner.state.verified {
                if let Some(expected) = inner.plan.digest(index)?
                    && expected != recorded
                {
                    return Err(TransferError::DigestMismatch {
                        index,
                        expected,
                        actual: recorded,
                    });
                }
            }
        }
        self.set_status(TransferStatus::Completed, None)
    }

    /// Removes the persisted state and releases the lease.
    pub fn purge(self) -> Result<(), TransferError> {
        self.backend.remove(&self.slot.key)?;
        debug!(key = %self.slot.key, "purged transfer state");
        Ok(())
    }

    fn set_status(
        &self,
        status: TransferStatus,
        last_error: Option<ErrorKind>,
    ) -> Result<(), TransferError> {
        let mut inner = self.inner.lock().unwrap();
        let mut next = inner.state.clone();
        next.status = status;
        next.last_error = last_error;
        next.touch();
        self.backend.write(&next)?;
        inner.state = next;
        Ok(())
    }
}
