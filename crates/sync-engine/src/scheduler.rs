//! Per-file chunk scheduler.
//!
//! Every chunk index of a file sits in exactly one place: the ready queue,
//! the in-flight set, the retry timer queue, or the verified set held by the
//! state lease. An index therefore never has two attempts in flight, and a
//! retryable failure goes back to the timer queue instead of being dropped.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use beatsync_protocol::{Direction, ErrorKind, FileManifestEntry, FileOutcome, TransferStatus};
use beatsync_transfer::{
    ChunkPlan, ChunkRange, ChunkReader, ChunkWriter, StateKey, StateLease, TransferError,
    TransferStateStore, digest, digest_file,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::progress::ProgressTracker;
use crate::transport::{
    ChunkDownloader, ChunkRequest, ChunkUploader, TransportError, Transports, with_timeout,
};
use crate::types::SyncEvent;

/// Session resources shared by every file transfer.
#[derive(Clone)]
pub(crate) struct FileContext {
    pub config: Arc<SyncConfig>,
    pub transports: Transports,
    pub store: TransferStateStore,
    pub local_root: PathBuf,
    pub progress: Arc<ProgressTracker>,
    pub events: mpsc::UnboundedSender<SyncEvent>,
    pub cancel: CancellationToken,
}

impl FileContext {
    pub fn emit(&self, event: SyncEvent) {
        // The receiver may have been dropped; events are advisory.
        let _ = self.events.send(event);
    }
}

/// Where chunk bytes come from and go to.
#[derive(Clone)]
enum Endpoint {
    Upload {
        uploader: Arc<dyn ChunkUploader>,
        reader: ChunkReader,
    },
    Download {
        downloader: Arc<dyn ChunkDownloader>,
        writer: ChunkWriter,
    },
}

enum LoopOutcome {
    Done,
    Failed(ErrorKind),
    Cancelled,
}

/// Transfers one manifest entry to completion, failure or cancellation.
pub(crate) async fn run_file(ctx: &FileContext, entry: &FileManifestEntry) -> FileOutcome {
    match transfer_file(ctx, entry).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(file_id = %entry.id, error = %e, "file transfer failed");
            FileOutcome::Failed(e.kind())
        }
    }
}

async fn transfer_file(
    ctx: &FileContext,
    entry: &FileManifestEntry,
) -> Result<FileOutcome, SyncError> {
    if ctx.cancel.is_cancelled() {
        return Ok(FileOutcome::Cancelled);
    }

    let mut plan = ChunkPlan::new(entry.id.clone(), entry.size_bytes, ctx.config.chunk_size)?;
    let (endpoint, key) = match entry.direction {
        Direction::Upload => prepare_upload(ctx, entry, &mut plan).await?,
        Direction::Download => prepare_download(ctx, entry, &mut plan).await?,
    };

    let store = ctx.store.clone();
    let lease = Arc::new(blocking(move || store.open(key, plan)).await?);

    let result = drive(ctx, entry, &endpoint, &lease).await;

    let failure = match &result {
        Ok(FileOutcome::Failed(kind)) => Some(*kind),
        Err(e) => Some(e.kind()),
        _ => None,
    };
    if let Some(kind) = failure {
        let l = Arc::clone(&lease);
        if let Err(e) = blocking(move || l.mark_failed(kind)).await {
            warn!(file_id = %entry.id, error = %e, "could not record failure");
        }
    }

    if matches!(result, Ok(FileOutcome::Completed)) && ctx.config.purge_completed_state {
        match Arc::try_unwrap(lease) {
            Ok(lease) => {
                if let Err(e) = blocking(move || lease.purge()).await {
                    warn!(file_id = %entry.id, error = %e, "could not purge completed state");
                }
            }
            Err(_) => warn!(file_id = %entry.id, "state still shared, not purging"),
        }
    }

    result
}

async fn prepare_upload(
    ctx: &FileContext,
    entry: &FileManifestEntry,
    plan: &mut ChunkPlan,
) -> Result<(Endpoint, StateKey), SyncError> {
    let uploader = ctx
        .transports
        .uploader
        .clone()
        .ok_or(SyncError::MissingCapability(Direction::Upload))?;
    let reader = ChunkReader::new(&ctx.local_root, &entry.relative_path)?;

    let expected = entry.expected_digest;
    let source = reader.path().to_path_buf();
    let mut digested = plan.clone();
    *plan = blocking(move || -> Result<ChunkPlan, SyncError> {
        if let Some(expected) = expected {
            let actual = digest_file(&source)?;
            if actual != expected {
                return Err(SyncError::FileDigestMismatch { expected, actual });
            }
        }
        digested.fill_digests_from_file(&source)?;
        Ok(digested)
    })
    .await?;

    let key = StateKey::new(entry.id.clone(), format!("upload:{}", entry.relative_path));
    Ok((Endpoint::Upload { uploader, reader }, key))
}

async fn prepare_download(
    ctx: &FileContext,
    entry: &FileManifestEntry,
    plan: &mut ChunkPlan,
) -> Result<(Endpoint, StateKey), SyncError> {
    let downloader = ctx
        .transports
        .downloader
        .clone()
        .ok_or(SyncError::MissingCapability(Direction::Download))?;
    let writer = ChunkWriter::new(&ctx.local_root, &entry.relative_path, entry.size_bytes)?;

    let published = with_timeout(
        ctx.config.transport_timeout(),
        downloader.chunk_digests(entry, plan.chunk_size()),
    )
    .await;
    match published {
        Ok(Some(digests)) if digests.len() == plan.total_chunks() as usize => {
            for (index, d) in (0u32..).zip(digests) {
                plan.set_digest(index, d)?;
            }
        }
        Ok(Some(digests)) => warn!(
            file_id = %entry.id,
            expected = plan.total_chunks(),
            got = digests.len(),
            "ignoring chunk digest list of the wrong length"
        ),
        Ok(None) => {}
        Err(e) if e.is_transient() => warn!(
            file_id = %entry.id,
            error = %e,
            "chunk digests unavailable, verifying chunks as they arrive"
        ),
        Err(e) => return Err(e.into()),
    }

    let key = StateKey::new(entry.id.clone(), writer.dest_path().display().to_string());
    Ok((Endpoint::Download { downloader, writer }, key))
}

async fn drive(
    ctx: &FileContext,
    entry: &FileManifestEntry,
    endpoint: &Endpoint,
    lease: &Arc<StateLease>,
) -> Result<FileOutcome, SyncError> {
    if let Endpoint::Download { writer, .. } = endpoint {
        if already_downloaded(entry, writer, lease).await? {
            info!(file_id = %entry.id, path = %writer.dest_path().display(), "already downloaded");
            ctx.progress.add_resumed_bytes(entry.size_bytes);
            return Ok(FileOutcome::Completed);
        }
        restore_part(ctx, entry, writer, lease).await?;
    }

    let l = Arc::clone(lease);
    blocking(move || l.mark_in_progress()).await?;

    let snapshot = lease.snapshot();
    let present = snapshot.verified.len() as u32;
    ctx.progress.add_resumed_bytes(lease.present_bytes());
    info!(
        file_id = %entry.id,
        direction = ?entry.direction,
        total_chunks = snapshot.total_chunks,
        present_chunks = present,
        "transfer started"
    );
    ctx.emit(SyncEvent::FileStarted {
        file_id: entry.id.clone(),
        direction: entry.direction,
        total_chunks: snapshot.total_chunks,
        present_chunks: present,
    });

    match run_chunks(ctx, entry, endpoint, lease).await {
        LoopOutcome::Done => finish(ctx, entry, endpoint, lease).await,
        LoopOutcome::Failed(kind) => Ok(FileOutcome::Failed(kind)),
        LoopOutcome::Cancelled => {
            info!(
                file_id = %entry.id,
                missing = lease.missing_chunks().len(),
                "transfer cancelled, state kept for resume"
            );
            Ok(FileOutcome::Cancelled)
        }
    }
}

/// Returns `true` if the destination already holds this file.
async fn already_downloaded(
    entry: &FileManifestEntry,
    writer: &ChunkWriter,
    lease: &StateLease,
) -> Result<bool, SyncError> {
    if !writer.is_finalized() {
        return Ok(false);
    }
    if lease.status() == TransferStatus::Completed && lease.missing_chunks().is_empty() {
        return Ok(true);
    }
    let Some(expected) = entry.expected_digest else {
        return Ok(false);
    };
    let dest = writer.dest_path().to_path_buf();
    let actual = blocking(move || digest_file(&dest)).await?;
    Ok(actual == expected)
}

/// Reconciles resume state with the `.part` file and sizes it.
async fn restore_part(
    ctx: &FileContext,
    entry: &FileManifestEntry,
    writer: &ChunkWriter,
    lease: &Arc<StateLease>,
) -> Result<(), SyncError> {
    let writer = writer.clone();
    let lease = Arc::clone(lease);
    let revalidate = ctx.config.revalidate_on_resume;
    let file_id = entry.id.clone();

    blocking(move || -> Result<(), TransferError> {
        let present = lease.present_chunks();
        if !present.is_empty() {
            if !writer.part_path().exists() {
                warn!(
                    file_id = %file_id,
                    present = present.len(),
                    "partial file missing, restarting download"
                );
                lease.reset()?;
            } else if revalidate {
                for index in present {
                    let range = lease.chunk_range(index)?;
                    let expected = lease.expected_digest(index)?;
                    match writer.digest_written(range) {
                        Ok(actual) if Some(actual) == expected => {}
                        _ => {
                            warn!(file_id = %file_id, index, "chunk failed revalidation, fetching again");
                            lease.forget_chunk(index)?;
                        }
                    }
                }
            }
        }
        writer.prepare()
    })
    .await
}

async fn finish(
    ctx: &FileContext,
    entry: &FileManifestEntry,
    endpoint: &Endpoint,
    lease: &Arc<StateLease>,
) -> Result<FileOutcome, SyncError> {
    match endpoint {
        Endpoint::Upload { .. } => {
            let l = Arc::clone(lease);
            blocking(move || l.mark_completed()).await?;
        }
        Endpoint::Download { writer, .. } => {
            if let Some(expected) = entry.expected_digest {
                let part = writer.part_path().to_path_buf();
                let actual = blocking(move || digest_file(&part)).await?;
                if actual != expected {
                    error!(
                        file_id = %entry.id,
                        %expected,
                        %actual,
                        "downloaded file does not match its digest, discarding"
                    );
                    let l = Arc::clone(lease);
                    let part = writer.part_path().to_path_buf();
                    blocking(move || -> Result<(), TransferError> {
                        l.reset()?;
                        match std::fs::remove_file(&part) {
                            Ok(()) => Ok(()),
                            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                            Err(e) => Err(e.into()),
                        }
                    })
                    .await?;
                    ctx.progress.sub_bytes(entry.size_bytes);
                    return Ok(FileOutcome::Failed(ErrorKind::DigestMismatch));
                }
            }
            // Completed is recorded before the rename: a crash in between
            // leaves a fully verified part file that the next run renames.
            let l = Arc::clone(lease);
            let w = writer.clone();
            blocking(move || -> Result<(), TransferError> {
                l.mark_completed()?;
                w.finalize()
            })
            .await?;
        }
    }
    info!(file_id = %entry.id, bytes = entry.size_bytes, "transfer completed");
    Ok(FileOutcome::Completed)
}

async fn run_chunks(
    ctx: &FileContext,
    entry: &FileManifestEntry,
    endpoint: &Endpoint,
    lease: &Arc<StateLease>,
) -> LoopOutcome {
    let policy = &ctx.config.retry;
    let limit = ctx.config.per_file_concurrency.max(1);
    let timeout = ctx.config.transport_timeout();

    let mut ready: VecDeque<u32> = lease.missing_chunks().into();
    let mut delayed: DelayQueue<u32> = DelayQueue::new();
    let mut in_flight: JoinSet<(u32, Result<u32, SyncError>)> = JoinSet::new();
    let mut failures: HashMap<u32, u32> = HashMap::new();
    let mut failed: Option<ErrorKind> = None;
    let mut cancelled = false;

    loop {
        if !cancelled && ctx.cancel.is_cancelled() {
            cancelled = true;
        }
        if failed.is_some() || cancelled {
            ready.clear();
            delayed.clear();
        }

        while in_flight.len() < limit {
            let Some(index) = ready.pop_front() else {
                break;
            };
            match chunk_request(entry, lease, index) {
                Ok(request) => {
                    let endpoint = endpoint.clone();
                    let lease = Arc::clone(lease);
                    in_flight.spawn(async move {
                        let result = transfer_chunk(endpoint, lease, &request, timeout).await;
                        (index, result)
                    });
                }
                Err(e) => {
                    error!(file_id = %entry.id, index, error = %e, "cannot plan chunk");
                    failed = Some(e.kind());
                    ready.clear();
                    delayed.clear();
                }
            }
        }

        if in_flight.is_empty() && delayed.is_empty() && ready.is_empty() {
            break;
        }

        tokio::select! {
            Some(joined) = in_flight.join_next() => match joined {
                Ok((index, Ok(bytes))) => {
                    failures.remove(&index);
                    ctx.progress.add_bytes(u64::from(bytes));
                    debug!(file_id = %entry.id, index, bytes, "chunk verified");
                    ctx.emit(SyncEvent::ChunkVerified {
                        file_id: entry.id.clone(),
                        index,
                        bytes,
                    });
                }
                Ok((index, Err(err))) => {
                    let kind = err.kind();
                    if failed.is_some() || cancelled {
                        debug!(file_id = %entry.id, index, error = %err, "chunk failed after transfer stopped");
                    } else if kind.is_retryable() {
                        let attempt = {
                            let n = failures.entry(index).or_insert(0);
                            *n += 1;
                            *n
                        };
                        if policy.allows_retry(attempt) {
                            let delay = policy.delay_for_attempt(attempt);
                            if kind == ErrorKind::DigestMismatch {
                                warn!(file_id = %entry.id, index, attempt, ?delay, error = %err, "chunk digest mismatch, retrying");
                            } else {
                                warn!(file_id = %entry.id, index, attempt, ?delay, error = %err, "chunk transfer failed, retrying");
                            }
                            ctx.emit(SyncEvent::ChunkRetry {
                                file_id: entry.id.clone(),
                                index,
                                attempt,
                                error: kind,
                                delay,
                            });
                            delayed.insert(index, delay);
                        } else {
                            error!(file_id = %entry.id, index, attempts = attempt, error = %err, "chunk retries exhausted");
                            failed = Some(kind);
                        }
                    } else {
                        error!(file_id = %entry.id, index, error = %err, "chunk failed permanently");
                        failed = Some(kind);
                    }
                }
                Err(e) => {
                    error!(file_id = %entry.id, error = %e, "chunk task aborted");
                    failed.get_or_insert(ErrorKind::Io);
                }
            },
            Some(expired) = delayed.next(), if !delayed.is_empty() => {
                ready.push_back(expired.into_inner());
            }
            _ = ctx.cancel.cancelled(), if !cancelled => {
                info!(file_id = %entry.id, in_flight = in_flight.len(), "cancellation requested, finishing in-flight chunks");
                cancelled = true;
            }
        }
    }

    if let Some(kind) = failed {
        return LoopOutcome::Failed(kind);
    }
    if lease.missing_chunks().is_empty() {
        LoopOutcome::Done
    } else if cancelled {
        LoopOutcome::Cancelled
    } else {
        LoopOutcome::Failed(ErrorKind::IncompleteTransfer)
    }
}

fn chunk_request(
    entry: &FileManifestEntry,
    lease: &StateLease,
    index: u32,
) -> Result<ChunkRequest, TransferError> {
    let range = lease.chunk_range(index)?;
    Ok(ChunkRequest {
        file_id: entry.id.clone(),
        relative_path: entry.relative_path.clone(),
        index,
        offset: range.offset,
        length: range.length,
        digest: lease.expected_digest(index)?,
    })
}

/// One attempt at one chunk. Returns the chunk length once it is verified
/// and recorded.
async fn transfer_chunk(
    endpoint: Endpoint,
    lease: Arc<StateLease>,
    request: &ChunkRequest,
    timeout: Option<Duration>,
) -> Result<u32, SyncError> {
    let index = request.index;
    let range = ChunkRange {
        index,
        offset: request.offset,
        length: request.length,
    };

    match endpoint {
        Endpoint::Upload { uploader, reader } => {
            let data = blocking(move || reader.read_chunk(range)).await?;
            let actual = digest(&data);
            if let Some(planned) = request.digest
                && planned != actual
            {
                return Err(SyncError::SourceChanged { index });
            }
            let ack = with_timeout(timeout, uploader.send_chunk(request, &data)).await?;
            if let Some(echoed) = ack.digest
                && echoed != actual
            {
                return Err(TransferError::DigestMismatch {
                    index,
                    expected: actual,
                    actual: echoed,
                }
                .into());
            }
            blocking(move || lease.mark_chunk_verified(index, actual)).await?;
        }
        Endpoint::Download { downloader, writer } => {
            let data = with_timeout(timeout, downloader.fetch_chunk(request)).await?;
            if data.len() != request.length as usize {
                return Err(TransportError::transient(format!(
                    "chunk {index}: expected {} bytes, got {}",
                    request.length,
                    data.len()
                ))
                .into());
            }
            let actual = digest(&data);
            if let Some(expected) = request.digest
                && expected != actual
            {
                return Err(TransferError::DigestMismatch {
                    index,
                    expected,
                    actual,
                }
                .into());
            }
            blocking(move || -> Result<bool, TransferError> {
                writer.write_chunk(range.offset, &data)?;
                lease.mark_chunk_verified(index, actual)
            })
            .await?;
        }
    }
    Ok(request.length)
}

/// Runs blocking file or state I/O off the async workers.
async fn blocking<T, E, F>(f: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Into<SyncError> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?.map_err(Into::into)
}
