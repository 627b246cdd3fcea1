//! Sync session: runs a manifest's files concurrently and aggregates results.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use beatsync_protocol::{
    ErrorKind, FileManifestEntry, FileOutcome, ProgressSnapshot, SessionResult, SessionStatus,
};
use beatsync_transfer::TransferStateStore;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{self, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::progress::ProgressTracker;
use crate::scheduler::{FileContext, run_file};
use crate::transport::Transports;
use crate::types::SyncEvent;

/// A configured, not yet started sync session.
pub struct SyncSession {
    id: String,
    config: Arc<SyncConfig>,
    transports: Transports,
    store: TransferStateStore,
    local_root: PathBuf,
    cancel: CancellationToken,
    status_tx: watch::Sender<SessionStatus>,
}

impl SyncSession {
    /// Creates a session. Uploads read from and downloads write to `local_root`.
    pub fn new(
        config: SyncConfig,
        transports: Transports,
        store: TransferStateStore,
        local_root: impl Into<PathBuf>,
    ) -> Result<Self, SyncError> {
        let config = config.validate()?;
        let (status_tx, _) = watch::channel(SessionStatus::Created);
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            config: Arc::new(config),
            transports,
            store,
            local_root: local_root.into(),
            cancel: CancellationToken::new(),
            status_tx,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionStatus {
        *self.status_tx.borrow()
    }

    /// Returns a cancellation token for this session.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Starts transferring `manifest` on the current tokio runtime.
    pub fn start(self, manifest: Vec<FileManifestEntry>) -> SessionHandle {
        let bytes_total: u64 = manifest.iter().map(|e| e.size_bytes).sum();
        let progress = Arc::new(ProgressTracker::new(manifest.len() as u32, bytes_total));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let ctx = FileContext {
            config: Arc::clone(&self.config),
            transports: self.transports,
            store: self.store,
            local_root: self.local_root,
            progress: Arc::clone(&progress),
            events: events_tx,
            cancel: self.cancel.clone(),
        };

        self.status_tx.send_replace(SessionStatus::Running);
        let status_rx = self.status_tx.subscribe();
        info!(
            session = %self.id,
            files = manifest.len(),
            bytes_total,
            "sync session started"
        );

        let task = tokio::spawn(run_session(
            self.id.clone(),
            ctx,
            manifest,
            self.status_tx,
        ));

        SessionHandle {
            id: self.id,
            progress,
            events_rx: Some(events_rx),
            status_rx,
            cancel: self.cancel,
            task,
        }
    }
}

/// Handle to a running session.
pub struct SessionHandle {
    id: String,
    progress: Arc<ProgressTracker>,
    events_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    status_rx: watch::Receiver<SessionStatus>,
    cancel: CancellationToken,
    task: JoinHandle<SessionResult>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Subscribes to progress. Each call returns a fresh receiver that sees
    /// the latest snapshot and every later change.
    pub fn progress(&self) -> watch::Receiver<ProgressSnapshot> {
        self.progress.subscribe()
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.events_rx.take()
    }

    /// Requests cooperative cancellation.
    ///
    /// No new chunks are dispatched and pending retries are dropped; chunks
    /// already in flight finish and keep their verified state.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionStatus {
        *self.status_rx.borrow()
    }

    /// Waits for every file to reach a final outcome.
    pub async fn await_completion(self) -> Result<SessionResult, SyncError> {
        Ok(self.task.await?)
    }
}

async fn run_session(
    id: String,
    ctx: FileContext,
    manifest: Vec<FileManifestEntry>,
    status_tx: watch::Sender<SessionStatus>,
) -> SessionResult {
    let permits = Arc::new(Semaphore::new(ctx.config.file_concurrency.max(1)));
    let mut files = JoinSet::new();
    let mut entries = HashMap::new();

    for entry in manifest {
        let ctx = ctx.clone();
        let permits = Arc::clone(&permits);
        let task_entry = entry.clone();
        let handle = files.spawn(async move {
            let entry = task_entry;
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit.ok(),
                _ = ctx.cancel.cancelled() => None,
            };
            let outcome = match permit {
                Some(_permit) if !ctx.cancel.is_cancelled() => run_file(&ctx, &entry).await,
                _ => FileOutcome::Cancelled,
            };
            report(&ctx, &entry, outcome);
            outcome
        });
        entries.insert(handle.id(), entry);
    }

    let result = collect_outcomes(&id, &ctx, files, entries).await;

    info!(
        session = %id,
        status = ?result.status,
        succeeded = result.succeeded_files.len(),
        failed = result.failed_files.len(),
        cancelled = result.cancelled_files.len(),
        "sync session finished"
    );
    ctx.emit(SyncEvent::SessionFinished {
        status: result.status,
    });
    status_tx.send_replace(result.status);
    result
}

/// Waits for every file task and folds the outcomes into a result.
///
/// A task that panicked or was aborted is recorded as an I/O failure of its
/// file.
async fn collect_outcomes(
    session: &str,
    ctx: &FileContext,
    mut files: JoinSet<FileOutcome>,
    mut entries: HashMap<task::Id, FileManifestEntry>,
) -> SessionResult {
    let mut result = SessionResult {
        status: SessionStatus::Running,
        succeeded_files: Vec::new(),
        failed_files: Default::default(),
        cancelled_files: Vec::new(),
    };
    let mut failed = false;

    while let Some(joined) = files.join_next_with_id().await {
        let (task_id, outcome) = match joined {
            Ok((task_id, outcome)) => (task_id, outcome),
            Err(e) => {
                error!(session = %session, error = %e, "file task aborted");
                let outcome = FileOutcome::Failed(ErrorKind::Io);
                if let Some(entry) = entries.get(&e.id()) {
                    report(ctx, entry, outcome);
                }
                (e.id(), outcome)
            }
        };
        let Some(entry) = entries.remove(&task_id) else {
            continue;
        };
        match outcome {
            FileOutcome::Completed => result.succeeded_files.push(entry.id),
            FileOutcome::Failed(kind) => {
                if entry.skippable {
                    warn!(session = %session, file_id = %entry.id, error = %kind, "skippable file failed");
                } else {
                    failed = true;
                }
                result.failed_files.insert(entry.id, kind);
            }
            FileOutcome::Cancelled => result.cancelled_files.push(entry.id),
        }
    }
    result.succeeded_files.sort();
    result.cancelled_files.sort();

    result.status = if ctx.cancel.is_cancelled() {
        SessionStatus::Cancelled
    } else if failed {
        SessionStatus::Failed
    } else {
        SessionStatus::Completed
    };
    result
}

fn report(ctx: &FileContext, entry: &FileManifestEntry, outcome: FileOutcome) {
    let file_id = entry.id.clone();
    match outcome {
        FileOutcome::Completed => {
            ctx.progress.file_completed();
            ctx.emit(SyncEvent::FileCompleted { file_id });
        }
        FileOutcome::Failed(error) => {
            ctx.progress.file_failed();
            ctx.emit(SyncEvent::FileFailed { file_id, error });
        }
        FileOutcome::Cancelled => ctx.emit(SyncEvent::FileCancelled { file_id }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_created() {
        let session = SyncSession::new(
            SyncConfig::default(),
            Transports::new(),
            TransferStateStore::in_memory(),
            "/tmp",
        )
        .unwrap();
        assert_eq!(session.state(), SessionStatus::Created);
        assert!(!session.id().is_empty());
    }

    #[test]
    fn new_session_rejects_bad_config() {
        let config = SyncConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(
            SyncSession::new(config, Transports::new(), TransferStateStore::in_memory(), "/tmp"),
            Err(SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn empty_manifest_completes() {
        let session = SyncSession::new(
            SyncConfig::default(),
            Transports::new(),
            TransferStateStore::in_memory(),
            "/tmp",
        )
        .unwrap();
        let mut handle = session.start(Vec::new());
        assert!(handle.take_events().is_some());
        assert!(handle.take_events().is_none());

        let result = handle.await_completion().await.unwrap();
        assert_eq!(result.status, SessionStatus::Completed);
        assert!(result.succeeded_files.is_empty());
    }

    fn test_context() -> (FileContext, mpsc::UnboundedReceiver<SyncEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let ctx = FileContext {
            config: Arc::new(SyncConfig::default()),
            transports: Transports::new(),
            store: TransferStateStore::in_memory(),
            local_root: PathBuf::from("/tmp"),
            progress: Arc::new(ProgressTracker::new(2, 0)),
            events,
            cancel: CancellationToken::new(),
        };
        (ctx, events_rx)
    }

    fn entry(id: &str) -> FileManifestEntry {
        FileManifestEntry {
            id: id.into(),
            relative_path: format!("{id}.osz"),
            size_bytes: 0,
            expected_digest: None,
            direction: beatsync_protocol::Direction::Download,
            skippable: false,
        }
    }

    #[tokio::test]
    async fn panicked_file_task_is_reported_as_failed() {
        let (ctx, mut events) = test_context();
        let mut files = JoinSet::new();
        let mut entries = HashMap::new();

        let ok = files.spawn(async { FileOutcome::Completed });
        entries.insert(ok.id(), entry("ok"));
        let boom = files.spawn(async {
            if true {
                panic!("file task blew up");
            }
            FileOutcome::Completed
        });
        entries.insert(boom.id(), entry("boom"));

        let result = collect_outcomes("s", &ctx, files, entries).await;

        assert_eq!(result.status, SessionStatus::Failed);
        assert_eq!(result.succeeded_files, vec!["ok".to_string()]);
        assert_eq!(result.failed_files.get("boom"), Some(&ErrorKind::Io));
        assert_eq!(ctx.progress.snapshot().files_failed, 1);
        assert!(matches!(
            events.try_recv(),
            Ok(SyncEvent::FileFailed { file_id, error: ErrorKind::Io }) if file_id == "boom"
        ));
    }
}
