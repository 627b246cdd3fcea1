//! End-to-end session scenarios against an in-memory remote.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use beatsync_engine::{
    Ack, ChunkDownloader, ChunkRequest, ChunkUploader, RetryPolicy, SyncConfig, SyncEvent,
    SyncSession, TransportError, Transports,
};
use beatsync_protocol::{
    Digest, Direction, ErrorKind, FileManifestEntry, FileOutcome, SessionResult, SessionStatus,
    TransferStatus,
};
use beatsync_transfer::{JsonFileBackend, TransferStateStore, digest};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
enum Fault {
    Transient,
    Permanent,
    /// Flip a byte (downloads) or echo a wrong digest (uploads).
    Corrupt,
    /// Never answer.
    Hang,
}

#[derive(Default)]
struct FakeRemote {
    sources: Mutex<HashMap<String, Vec<u8>>>,
    uploaded: Mutex<HashMap<String, Vec<u8>>>,
    published: Mutex<HashMap<String, Vec<Digest>>>,
    faults: Mutex<HashMap<(String, u32), VecDeque<Fault>>>,
    sends: Mutex<Vec<(String, u32)>>,
    fetches: Mutex<Vec<(String, u32)>>,
    cancel_after: Mutex<Option<(usize, CancellationToken)>>,
    ok_calls: AtomicUsize,
    active: Mutex<HashMap<String, usize>>,
    max_active_per_file: Mutex<HashMap<String, usize>>,
    active_total: AtomicUsize,
    max_active_total: AtomicUsize,
}

struct ActiveGuard<'a> {
    remote: &'a FakeRemote,
    file_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        *self
            .remote
            .active
            .lock()
            .unwrap()
            .get_mut(&self.file_id)
            .unwrap() -= 1;
        self.remote.active_total.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeRemote {
    fn serve(&self, file_id: &str, data: Vec<u8>) {
        self.sources.lock().unwrap().insert(file_id.into(), data);
    }

    fn publish_digests(&self, file_id: &str, data: &[u8], chunk_size: usize) {
        let digests = data.chunks(chunk_size).map(digest).collect();
        self.published
            .lock()
            .unwrap()
            .insert(file_id.into(), digests);
    }

    fn fail(&self, file_id: &str, index: u32, faults: &[Fault]) {
        self.faults
            .lock()
            .unwrap()
            .entry((file_id.into(), index))
            .or_default()
            .extend(faults.iter().copied());
    }

    fn cancel_after(&self, calls: usize, token: CancellationToken) {
        *self.cancel_after.lock().unwrap() = Some((calls, token));
    }

    fn sends(&self) -> Vec<(String, u32)> {
        self.sends.lock().unwrap().clone()
    }

    fn fetches(&self) -> Vec<(String, u32)> {
        self.fetches.lock().unwrap().clone()
    }

    fn clear_calls(&self) {
        self.sends.lock().unwrap().clear();
        self.fetches.lock().unwrap().clear();
    }

    fn uploaded(&self, file_id: &str) -> Option<Vec<u8>> {
        self.uploaded.lock().unwrap().get(file_id).cloned()
    }

    fn next_fault(&self, request: &ChunkRequest) -> Option<Fault> {
        self.faults
            .lock()
            .unwrap()
            .get_mut(&(request.file_id.clone(), request.index))
            .and_then(VecDeque::pop_front)
    }

    fn enter(&self, file_id: &str) -> ActiveGuard<'_> {
        {
            let mut active = self.active.lock().unwrap();
            let n = active.entry(file_id.into()).or_insert(0);
            *n += 1;
            let mut max = self.max_active_per_file.lock().unwrap();
            let m = max.entry(file_id.into()).or_insert(0);
            *m = (*m).max(*n);
        }
        let total = self.active_total.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_total.fetch_max(total, Ordering::SeqCst);
        ActiveGuard {
            remote: self,
            file_id: file_id.into(),
        }
    }

    fn succeeded(&self) {
        let n = self.ok_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, token)) = &*self.cancel_after.lock().unwrap()
            && n == *after
        {
            token.cancel();
        }
    }
}

impl ChunkUploader for FakeRemote {
    fn send_chunk<'a>(
        &'a self,
        request: &'a ChunkRequest,
        data: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<Ack, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.sends
                .lock()
                .unwrap()
                .push((request.file_id.clone(), request.index));
            let _active = self.enter(&request.file_id);
            tokio::task::yield_now().await;

            let mut echoed = digest(data);
            match self.next_fault(request) {
                Some(Fault::Transient) => return Err(TransportError::transient("connection reset")),
                Some(Fault::Permanent) => return Err(TransportError::permanent("403 forbidden")),
                Some(Fault::Hang) => std::future::pending::<()>().await,
                Some(Fault::Corrupt) => echoed = digest(b"garbled"),
                None => {}
            }

            {
                let mut uploaded = self.uploaded.lock().unwrap();
                let file = uploaded.entry(request.file_id.clone()).or_default();
                let end = request.offset as usize + data.len();
                if file.len() < end {
                    file.resize(end, 0);
                }
                file[request.offset as usize..end].copy_from_slice(data);
            }
            self.succeeded();
            Ok(Ack {
                digest: Some(echoed),
            })
        })
    }
}

impl ChunkDownloader for FakeRemote {
    fn fetch_chunk<'a>(
        &'a self,
        request: &'a ChunkRequest,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, TransportError>> + Send + 'a>> {
        Box::pin(async move {
            self.fetches
                .lock()
                .unwrap()
                .push((request.file_id.clone(), request.index));
            let _active = self.enter(&request.file_id);
            tokio::task::yield_now().await;

            let mut data = {
                let sources = self.sources.lock().unwrap();
                let source = sources
                    .get(&request.file_id)
                    .ok_or_else(|| TransportError::permanent("404 not found"))?;
                let start = request.offset as usize;
                source[start..start + request.length as usize].to_vec()
            };
            match self.next_fault(request) {
                Some(Fault::Transient) => return Err(TransportError::transient("connection reset")),
                Some(Fault::Permanent) => return Err(TransportError::permanent("404 not found")),
                Some(Fault::Hang) => std::future::pending::<()>().await,
                Some(Fault::Corrupt) => data[0] ^= 0xff,
                None => {}
            }
            self.succeeded();
            Ok(data)
        })
    }

    fn chunk_digests<'a>(
        &'a self,
        entry: &'a FileManifestEntry,
        _chunk_size: u32,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<Digest>>, TransportError>> + Send + 'a>>
    {
        Box::pin(async move { Ok(self.published.lock().unwrap().get(&entry.id).cloned()) })
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    dir: TempDir,
    remote: Arc<FakeRemote>,
    store: TransferStateStore,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("state")).unwrap();
        std::fs::create_dir_all(dir.path().join("local")).unwrap();
        Self {
            remote: Arc::new(FakeRemote::default()),
            store: TransferStateStore::new(Arc::new(backend)),
            dir,
        }
    }

    fn root(&self) -> std::path::PathBuf {
        self.dir.path().join("local")
    }

    fn write_local(&self, relative_path: &str, data: &[u8]) {
        let path = self.root().join(relative_path);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn read_local(&self, relative_path: &str) -> Vec<u8> {
        std::fs::read(self.root().join(relative_path)).unwrap()
    }

    fn session(&self, config: SyncConfig) -> SyncSession {
        SyncSession::new(
            config,
            Transports::both(Arc::clone(&self.remote)),
            self.store.clone(),
            self.root(),
        )
        .unwrap()
    }

    async fn run(&self, config: SyncConfig, manifest: Vec<FileManifestEntry>) -> SessionResult {
        self.session(config)
            .start(manifest)
            .await_completion()
            .await
            .unwrap()
    }
}

fn content(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn config(chunk_size: u32, per_file: usize, files: usize) -> SyncConfig {
    SyncConfig {
        chunk_size,
        per_file_concurrency: per_file,
        file_concurrency: files,
        retry: RetryPolicy {
            jitter: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn upload(id: &str, relative_path: &str, data: &[u8]) -> FileManifestEntry {
    FileManifestEntry {
        id: id.into(),
        relative_path: relative_path.into(),
        size_bytes: data.len() as u64,
        expected_digest: None,
        direction: Direction::Upload,
        skippable: false,
    }
}

fn download(id: &str, relative_path: &str, size: usize) -> FileManifestEntry {
    FileManifestEntry {
        id: id.into(),
        relative_path: relative_path.into(),
        size_bytes: size as u64,
        expected_digest: None,
        direction: Direction::Download,
        skippable: false,
    }
}

fn indices(calls: &[(String, u32)], file_id: &str) -> Vec<u32> {
    let mut v: Vec<u32> = calls
        .iter()
        .filter(|(id, _)| id == file_id)
        .map(|(_, i)| *i)
        .collect();
    v.sort();
    v
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_failure_is_retried_with_exactly_four_sends() {
    let fx = Fixture::new();
    let data = content(10_000, 1);
    fx.write_local("1001 a.osz", &data);
    fx.remote.fail("1001", 1, &[Fault::Transient]);

    let result = fx
        .run(config(4096, 4, 2), vec![upload("1001", "1001 a.osz", &data)])
        .await;

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.outcome("1001"), Some(FileOutcome::Completed));
    assert_eq!(fx.remote.sends().len(), 4);
    assert_eq!(indices(&fx.remote.sends(), "1001"), vec![0, 1, 1, 2]);
    assert_eq!(fx.remote.uploaded("1001").unwrap(), data);
    assert!(fx.store.list().unwrap().is_empty(), "completed state purged");
}

#[tokio::test(start_paused = true)]
async fn upload_resume_skips_verified_chunks() {
    let fx = Fixture::new();
    let data = content(10_000, 2);
    fx.write_local("songs/2002 b.osz", &data);
    fx.remote.fail("2002", 1, &[Fault::Permanent]);
    let entry = upload("2002", "songs/2002 b.osz", &data);

    let first = fx.run(config(4096, 1, 1), vec![entry.clone()]).await;
    assert_eq!(first.status, SessionStatus::Failed);
    assert_eq!(
        first.outcome("2002"),
        Some(FileOutcome::Failed(ErrorKind::TransportPermanent))
    );
    assert_eq!(indices(&fx.remote.sends(), "2002"), vec![0, 1]);

    let states = fx.store.list().unwrap();
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].status, TransferStatus::Failed);
    assert_eq!(states[0].last_error, Some(ErrorKind::TransportPermanent));
    assert_eq!(states[0].present_chunks().collect::<Vec<_>>(), vec![0]);

    fx.remote.clear_calls();
    let second = fx.run(config(4096, 1, 1), vec![entry]).await;
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(indices(&fx.remote.sends(), "2002"), vec![1, 2]);
    assert_eq!(fx.remote.uploaded("2002").unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn upload_ack_digest_mismatch_is_retried() {
    let fx = Fixture::new();
    let data = content(9000, 3);
    fx.write_local("3003 c.osz", &data);
    fx.remote.fail("3003", 2, &[Fault::Corrupt]);

    let result = fx
        .run(config(4096, 2, 1), vec![upload("3003", "3003 c.osz", &data)])
        .await;

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(indices(&fx.remote.sends(), "3003"), vec![0, 1, 2, 2]);
}

#[tokio::test(start_paused = true)]
async fn download_digest_mismatch_is_never_accepted() {
    let fx = Fixture::new();
    let data = content(12_000, 4);
    fx.remote.serve("4004", data.clone());
    fx.remote.publish_digests("4004", &data, 4096);
    fx.remote.fail("4004", 0, &[Fault::Corrupt, Fault::Corrupt]);

    let session = fx.session(config(4096, 2, 1));
    let mut handle = session.start(vec![download("4004", "4004 d.osz", data.len())]);
    let mut events = handle.take_events().unwrap();
    let result = handle.await_completion().await.unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(indices(&fx.remote.fetches(), "4004"), vec![0, 0, 0, 1, 2]);
    assert_eq!(fx.read_local("4004 d.osz"), data);
    assert!(!fx.root().join("4004 d.osz.part").exists());

    let mut retries = Vec::new();
    while let Some(event) = events.recv().await {
        if let SyncEvent::ChunkRetry { index, error, .. } = event {
            retries.push((index, error));
        }
    }
    assert_eq!(
        retries,
        vec![(0, ErrorKind::DigestMismatch), (0, ErrorKind::DigestMismatch)]
    );
}

#[tokio::test(start_paused = true)]
async fn whole_file_digest_mismatch_discards_download() {
    let fx = Fixture::new();
    let data = content(5000, 5);
    fx.remote.serve("5005", data.clone());
    // No per-chunk digests: the corrupted chunk is only caught by the
    // whole-file check.
    fx.remote.fail("5005", 1, &[Fault::Corrupt]);
    let mut entry = download("5005", "5005 e.osz", data.len());
    entry.expected_digest = Some(digest(&data));

    let first = fx.run(config(4096, 1, 1), vec![entry.clone()]).await;
    assert_eq!(
        first.outcome("5005"),
        Some(FileOutcome::Failed(ErrorKind::DigestMismatch))
    );
    assert!(!fx.root().join("5005 e.osz").exists());
    assert!(!fx.root().join("5005 e.osz.part").exists());

    let second = fx.run(config(4096, 1, 1), vec![entry]).await;
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(fx.read_local("5005 e.osz"), data);
}

#[tokio::test(start_paused = true)]
async fn cancel_then_resume_matches_uncancelled_run() {
    let fx = Fixture::new();
    let data = content(5 * 1024, 6);
    fx.remote.serve("6006", data.clone());
    let entry = download("6006", "6006 f.osz", data.len());

    let session = fx.session(config(1024, 1, 1));
    fx.remote.cancel_after(2, session.cancel_token());
    let handle = session.start(vec![entry.clone()]);
    let first = handle.await_completion().await.unwrap();

    assert_eq!(first.status, SessionStatus::Cancelled);
    assert_eq!(first.outcome("6006"), Some(FileOutcome::Cancelled));
    assert_eq!(indices(&fx.remote.fetches(), "6006"), vec![0, 1]);
    let states = fx.store.list().unwrap();
    assert_eq!(states.len(), 1);
    assert_ne!(states[0].status, TransferStatus::Completed);
    assert_eq!(states[0].present_chunks().collect::<Vec<_>>(), vec![0, 1]);

    fx.remote.clear_calls();
    let second = fx.run(config(1024, 1, 1), vec![entry]).await;
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(indices(&fx.remote.fetches(), "6006"), vec![2, 3, 4]);

    // Same end state as a single uninterrupted run.
    let reference = Fixture::new();
    reference.remote.serve("6006", data.clone());
    let uninterrupted = reference
        .run(
            config(1024, 1, 1),
            vec![download("6006", "6006 f.osz", data.len())],
        )
        .await;
    assert_eq!(uninterrupted.status, second.status);
    assert_eq!(fx.read_local("6006 f.osz"), reference.read_local("6006 f.osz"));
    assert_eq!(
        fx.store.list().unwrap().len(),
        reference.store.list().unwrap().len()
    );
}

#[tokio::test(start_paused = true)]
async fn resume_revalidates_partial_download() {
    let fx = Fixture::new();
    let data = content(4 * 1024, 7);
    fx.remote.serve("7007", data.clone());
    let entry = download("7007", "7007 g.osz", data.len());

    let session = fx.session(config(1024, 1, 1));
    fx.remote.cancel_after(2, session.cancel_token());
    let first = session
        .start(vec![entry.clone()])
        .await_completion()
        .await
        .unwrap();
    assert_eq!(first.status, SessionStatus::Cancelled);

    // Damage chunk 0 of the partial file behind the engine's back.
    let part = fx.root().join("7007 g.osz.part");
    let mut bytes = std::fs::read(&part).unwrap();
    bytes[10] ^= 0xff;
    std::fs::write(&part, bytes).unwrap();

    fx.remote.clear_calls();
    let second = fx.run(config(1024, 1, 1), vec![entry]).await;
    assert_eq!(second.status, SessionStatus::Completed);
    assert_eq!(indices(&fx.remote.fetches(), "7007"), vec![0, 2, 3]);
    assert_eq!(fx.read_local("7007 g.osz"), data);
}

#[tokio::test(start_paused = true)]
async fn two_files_two_at_a_time_one_chunk_each() {
    let fx = Fixture::new();
    let a = content(8192, 8);
    let b = content(6000, 9);
    fx.remote.serve("8008", a.clone());
    fx.remote.serve("9009", b.clone());
    fx.remote.publish_digests("8008", &a, 2048);
    fx.remote.publish_digests("9009", &b, 2048);

    let session = fx.session(config(2048, 1, 2));
    let mut handle = session.start(vec![
        download("8008", "8008 h.osz", a.len()),
        download("9009", "9009 i.osz", b.len()),
    ]);
    let mut events = handle.take_events().unwrap();
    let result = handle.await_completion().await.unwrap();

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.succeeded_files, vec!["8008".to_string(), "9009".to_string()]);
    assert_eq!(fx.read_local("8008 h.osz"), a);
    assert_eq!(fx.read_local("9009 i.osz"), b);

    let max = fx.remote.max_active_per_file.lock().unwrap().clone();
    assert_eq!(max.get("8008"), Some(&1));
    assert_eq!(max.get("9009"), Some(&1));
    assert!(fx.remote.max_active_total.load(Ordering::SeqCst) <= 2);

    let mut verified: HashMap<String, Vec<u32>> = HashMap::new();
    while let Some(event) = events.recv().await {
        if let SyncEvent::ChunkVerified { file_id, index, .. } = event {
            verified.entry(file_id).or_default().push(index);
        }
    }
    assert_eq!(verified["8008"].len(), 4);
    assert_eq!(verified["9009"].len(), 3);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_does_not_abort_other_files() {
    let fx = Fixture::new();
    let good = content(3000, 10);
    let bad = content(3000, 11);
    fx.write_local("good.osz", &good);
    fx.write_local("bad.osz", &bad);
    fx.remote.fail("bad", 0, &[Fault::Permanent]);

    let result = fx
        .run(
            config(1024, 2, 2),
            vec![upload("good", "good.osz", &good), upload("bad", "bad.osz", &bad)],
        )
        .await;

    assert_eq!(result.status, SessionStatus::Failed);
    assert_eq!(result.succeeded_files, vec!["good".to_string()]);
    assert_eq!(
        result.failed_files.get("bad"),
        Some(&ErrorKind::TransportPermanent)
    );
    assert_eq!(fx.remote.uploaded("good").unwrap(), good);
}

#[tokio::test(start_paused = true)]
async fn skippable_failure_keeps_session_completed() {
    let fx = Fixture::new();
    let data = content(2000, 12);
    fx.write_local("ok.osz", &data);
    let mut optional = download("404", "missing.osz", 100);
    optional.skippable = true;

    let result = fx
        .run(config(1024, 2, 2), vec![upload("ok", "ok.osz", &data), optional])
        .await;

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(
        result.outcome("404"),
        Some(FileOutcome::Failed(ErrorKind::TransportPermanent))
    );
    assert_eq!(result.outcome("ok"), Some(FileOutcome::Completed));
}

#[tokio::test(start_paused = true)]
async fn retries_exhaust_into_file_failure() {
    let fx = Fixture::new();
    let data = content(1000, 13);
    fx.write_local("x.osz", &data);
    fx.remote.fail("x", 0, &[Fault::Transient; 3]);
    let mut cfg = config(1024, 1, 1);
    cfg.retry.max_retries = 2;

    let result = fx.run(cfg, vec![upload("x", "x.osz", &data)]).await;

    assert_eq!(
        result.outcome("x"),
        Some(FileOutcome::Failed(ErrorKind::TransportTransient))
    );
    assert_eq!(fx.remote.sends().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn hung_call_times_out_and_retries() {
    let fx = Fixture::new();
    let data = content(1500, 14);
    fx.remote.serve("h", data.clone());
    fx.remote.fail("h", 1, &[Fault::Hang]);
    let mut cfg = config(1024, 2, 1);
    cfg.transport_timeout_secs = Some(30);

    let result = fx.run(cfg, vec![download("h", "h.osz", data.len())]).await;

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(indices(&fx.remote.fetches(), "h"), vec![0, 1, 1]);
    assert_eq!(fx.read_local("h.osz"), data);
}

#[tokio::test(start_paused = true)]
async fn missing_transport_capability_fails_file() {
    let fx = Fixture::new();
    let session = SyncSession::new(
        config(1024, 1, 1),
        Transports::new().with_uploader(fx.remote.clone()),
        fx.store.clone(),
        fx.root(),
    )
    .unwrap();

    let result = session
        .start(vec![download("d", "d.osz", 10)])
        .await_completion()
        .await
        .unwrap();

    assert_eq!(
        result.outcome("d"),
        Some(FileOutcome::Failed(ErrorKind::MissingCapability))
    );
    assert!(fx.remote.fetches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn path_traversal_is_rejected() {
    let fx = Fixture::new();
    let result = fx
        .run(config(1024, 1, 1), vec![download("evil", "../escape.osz", 10)])
        .await;
    assert_eq!(
        result.outcome("evil"),
        Some(FileOutcome::Failed(ErrorKind::InvalidPath))
    );
    assert!(!fx.dir.path().join("escape.osz").exists());
}

#[tokio::test(start_paused = true)]
async fn cancel_before_start_cancels_every_file() {
    let fx = Fixture::new();
    let data = content(1000, 15);
    fx.write_local("c.osz", &data);

    let session = fx.session(config(1024, 1, 1));
    let handle = session.start(vec![
        upload("c", "c.osz", &data),
        download("d", "d.osz", 10),
    ]);
    handle.cancel();
    let result = handle.await_completion().await.unwrap();

    assert_eq!(result.status, SessionStatus::Cancelled);
    assert_eq!(result.cancelled_files, vec!["c".to_string(), "d".to_string()]);
    assert!(fx.remote.sends().is_empty());
    assert!(fx.remote.fetches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_download_creates_empty_file() {
    let fx = Fixture::new();
    fx.remote.serve("z", Vec::new());

    let result = fx
        .run(config(1024, 1, 1), vec![download("z", "z.osz", 0)])
        .await;

    assert_eq!(result.status, SessionStatus::Completed);
    assert!(fx.remote.fetches().is_empty());
    assert!(fx.read_local("z.osz").is_empty());
}

#[tokio::test(start_paused = true)]
async fn existing_download_with_matching_digest_is_skipped() {
    let fx = Fixture::new();
    let data = content(3000, 16);
    fx.write_local("have.osz", &data);
    let mut entry = download("have", "have.osz", data.len());
    entry.expected_digest = Some(digest(&data));

    let result = fx.run(config(1024, 1, 1), vec![entry]).await;

    assert_eq!(result.status, SessionStatus::Completed);
    assert!(fx.remote.fetches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn progress_and_events_track_the_session() {
    let fx = Fixture::new();
    let data = content(5000, 17);
    fx.write_local("p.osz", &data);

    let session = fx.session(config(1024, 2, 1));
    let mut handle = session.start(vec![upload("p", "p.osz", &data)]);
    let progress = handle.progress();
    let mut events = handle.take_events().unwrap();
    let result = handle.await_completion().await.unwrap();
    assert_eq!(result.status, SessionStatus::Completed);

    let snap = progress.borrow().clone();
    assert_eq!(snap.files_total, 1);
    assert_eq!(snap.files_completed, 1);
    assert_eq!(snap.bytes_total, 5000);
    assert_eq!(snap.bytes_transferred, 5000);

    let mut all = Vec::new();
    while let Some(event) = events.recv().await {
        all.push(event);
    }
    assert!(matches!(
        all.first(),
        Some(SyncEvent::FileStarted {
            total_chunks: 5,
            present_chunks: 0,
            ..
        })
    ));
    assert_eq!(
        all.iter()
            .filter(|e| matches!(e, SyncEvent::ChunkVerified { .. }))
            .count(),
        5
    );
    assert!(matches!(
        all.last(),
        Some(SyncEvent::SessionFinished {
            status: SessionStatus::Completed
        })
    ));
    assert!(all.iter().any(|e| matches!(e, SyncEvent::FileCompleted { .. })));
}

#[tokio::test(start_paused = true)]
async fn upload_with_wrong_expected_digest_sends_nothing() {
    let fx = Fixture::new();
    let data = content(3000, 18);
    fx.write_local("m.osz", &data);
    let mut entry = upload("m", "m.osz", &data);
    entry.expected_digest = Some(digest(b"something else"));

    let result = fx.run(config(1024, 1, 1), vec![entry]).await;

    assert_eq!(
        result.outcome("m"),
        Some(FileOutcome::Failed(ErrorKind::DigestMismatch))
    );
    assert!(fx.remote.sends().is_empty());
}
