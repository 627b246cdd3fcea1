//! Command execution.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use beatsync_engine::{SyncConfig, SyncEvent, SyncSession, Transports};
use beatsync_http::{DownloadRoute, HttpTransport};
use beatsync_manifest::{
    BeatmapListing, Manifest, format_beatmap_json, format_beatmap_list, listings_from_songs_dir,
    parse_beatmap_json, parse_beatmap_list, scan_upload_manifest,
};
use beatsync_protocol::{FileManifestEntry, FileOutcome, SessionResult, SessionStatus};
use beatsync_transfer::{JsonFileBackend, StateKey, TransferStateStore, part_path};
use tracing::{debug, info, warn};

use crate::Command;
use crate::config::CliConfig;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

pub async fn run(command: Command, mut config: CliConfig) -> anyhow::Result<()> {
    match command {
        Command::Upload { dir, namespace } => {
            if let Some(ns) = namespace {
                config.http.namespace = ns;
            }
            let entries = scan_upload_manifest(&dir, "")
                .with_context(|| format!("scanning {}", dir.display()))?;
            info!(dir = %dir.display(), files = entries.len(), "upload manifest built");

            let transport = Arc::new(HttpTransport::new(config.http.clone())?);
            let transports = Transports::new().with_uploader(transport);
            run_session(&config, transports, &dir, entries).await
        }
        Command::Download { list, dest, files } => {
            if files {
                config.http.route = DownloadRoute::Files;
            }
            let text = std::fs::read_to_string(&list)
                .with_context(|| format!("reading {}", list.display()))?;
            let listings = read_listings(&list, &text)?;

            let transport = Arc::new(HttpTransport::new(config.http.clone())?);
            let entries = sized_download_entries(&transport, &listings).await;
            std::fs::create_dir_all(&dest)?;

            let transports = Transports::new().with_downloader(transport);
            run_session(&config, transports, &dest, entries).await
        }
        Command::Sync { manifest, root } => {
            let loaded = Manifest::load(&manifest)
                .with_context(|| format!("loading {}", manifest.display()))?;
            let root = match root {
                Some(r) => r,
                None => manifest
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .unwrap_or(Path::new("."))
                    .to_path_buf(),
            };

            let transport = Arc::new(HttpTransport::new(config.http.clone())?);
            run_session(&config, Transports::both(transport), &root, loaded.into_entries()).await
        }
        Command::Export { songs_dir, out } => {
            let listings = listings_from_songs_dir(&songs_dir)
                .with_context(|| format!("reading {}", songs_dir.display()))?;
            let content = if is_json_path(&out) {
                format_beatmap_json(&listings)?
            } else {
                format_beatmap_list(&listings)
            };
            std::fs::write(&out, content)?;
            println!("exported {} beatmap sets to {}", listings.len(), out.display());
            Ok(())
        }
        Command::Status => {
            let store = open_store(&config)?;
            let mut states = store.list()?;
            if states.is_empty() {
                println!("no persisted transfers");
                return Ok(());
            }
            states.sort_by(|a, b| a.key().cmp(&b.key()));
            for state in states {
                let present = state.verified.len();
                let error = state
                    .last_error
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default();
                println!(
                    "{:<12} {:>5}/{:<5} {}  {}{}",
                    format!("{:?}", state.status),
                    present,
                    state.total_chunks,
                    state.file_id,
                    state.destination,
                    error
                );
            }
            Ok(())
        }
        Command::Discard { file_id, dest } => {
            let store = open_store(&config)?;
            store.discard(&StateKey::new(file_id.as_str(), dest.as_str()))?;
            if !dest.starts_with("upload:") {
                let part = part_path(Path::new(&dest));
                if part.exists() {
                    std::fs::remove_file(&part)?;
                    debug!(path = %part.display(), "removed partial download");
                }
            }
            println!("discarded {file_id} -> {dest}");
            Ok(())
        }
    }
}

fn open_store(config: &CliConfig) -> anyhow::Result<TransferStateStore> {
    let backend = JsonFileBackend::new(&config.state_dir)
        .with_context(|| format!("opening state dir {}", config.state_dir.display()))?;
    Ok(TransferStateStore::new(Arc::new(backend)))
}

fn is_json_path(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
}

/// Parses a beatmap list, picking the format from the extension or content.
fn read_listings(path: &Path, text: &str) -> anyhow::Result<Vec<BeatmapListing>> {
    if is_json_path(path) || text.trim_start().starts_with('[') {
        Ok(parse_beatmap_json(text)?)
    } else {
        Ok(parse_beatmap_list(text))
    }
}

/// Turns listings into download entries, asking the remote for each size.
///
/// Unsubmitted sets and sets the remote does not have are skipped.
async fn sized_download_entries(
    transport: &HttpTransport,
    listings: &[BeatmapListing],
) -> Vec<FileManifestEntry> {
    let mut entries = Vec::new();
    for listing in listings {
        let Some(mut entry) = listing.to_download_entry(0) else {
            info!(name = %listing.name, "skipping unsubmitted beatmap set");
            continue;
        };
        match transport.content_length(&entry).await {
            Ok(size) => {
                entry.size_bytes = size;
                entries.push(entry);
            }
            Err(e) => warn!(file_id = %entry.id, error = %e, "beatmap set unavailable, skipping"),
        }
    }
    entries
}

async fn run_session(
    config: &CliConfig,
    transports: Transports,
    root: &Path,
    entries: Vec<FileManifestEntry>,
) -> anyhow::Result<()> {
    if entries.is_empty() {
        println!("nothing to transfer");
        return Ok(());
    }

    let store = open_store(config)?;
    let sync: SyncConfig = config.sync.clone();
    let session = SyncSession::new(sync, transports, store, root)?;
    let mut handle = session.start(entries.clone());

    let cancel = handle.cancel_token();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling; run the command again to resume");
            cancel.cancel();
        }
    });

    let events = handle.take_events().map(|mut rx| {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                log_event(&event);
            }
        })
    });

    let mut progress = handle.progress();
    let reporter = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snap = progress.borrow_and_update().clone();
            info!(
                files = %format!("{}/{}", snap.files_completed, snap.files_total),
                percent = %format!("{:.1}", snap.percentage()),
                bytes_per_second = snap.bytes_per_second as u64,
                "progress"
            );
        }
    });

    let result = handle.await_completion().await;
    interrupt.abort();
    reporter.abort();
    if let Some(events) = events {
        let _ = events.await;
    }
    let result = result?;

    for line in summary_lines(&entries, &result) {
        println!("{line}");
    }
    match result.status {
        SessionStatus::Completed => Ok(()),
        status => anyhow::bail!("session ended {status:?}"),
    }
}

fn log_event(event: &SyncEvent) {
    match event {
        SyncEvent::FileStarted {
            file_id,
            direction,
            total_chunks,
            present_chunks,
        } => info!(
            file_id = %file_id,
            ?direction,
            total_chunks,
            present_chunks,
            "file started"
        ),
        SyncEvent::ChunkVerified {
            file_id,
            index,
            bytes,
        } => debug!(file_id = %file_id, index, bytes, "chunk verified"),
        SyncEvent::ChunkRetry {
            file_id,
            index,
            attempt,
            error,
            delay,
        } => debug!(file_id = %file_id, index, attempt, %error, ?delay, "chunk retry scheduled"),
        SyncEvent::FileCompleted { file_id } => info!(file_id = %file_id, "file completed"),
        SyncEvent::FileFailed { file_id, error } => {
            warn!(file_id = %file_id, %error, "file failed")
        }
        SyncEvent::FileCancelled { file_id } => info!(file_id = %file_id, "file cancelled"),
        SyncEvent::SessionFinished { status } => debug!(?status, "session finished"),
    }
}

/// One line per file in manifest order, then a totals line.
fn summary_lines(entries: &[FileManifestEntry], result: &SessionResult) -> Vec<String> {
    let mut lines = Vec::with_capacity(entries.len() + 1);
    for entry in entries {
        let line = match result.outcome(&entry.id) {
            Some(FileOutcome::Completed) => format!("  ok         {}", entry.relative_path),
            Some(FileOutcome::Failed(kind)) => {
                let note = if entry.skippable { ", skipped" } else { "" };
                format!("  failed     {} ({kind}{note})", entry.relative_path)
            }
            Some(FileOutcome::Cancelled) => format!("  cancelled  {}", entry.relative_path),
            None => format!("  unknown    {}", entry.relative_path),
        };
        lines.push(line);
    }
    lines.push(format!(
        "{:?}: {} succeeded, {} failed, {} cancelled",
        result.status,
        result.succeeded_files.len(),
        result.failed_files.len(),
        result.cancelled_files.len()
    ));
    lines
}
