use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use beatsync_protocol::ProgressSnapshot;
use tokio::sync::watch;
use tokio::time::Instant;

/// Aggregates session progress and publishes it on a `watch` channel.
///
/// Every change republishes a full [`ProgressSnapshot`], so any number of
/// receivers can attach at any time and see the latest value.
pub struct ProgressTracker {
    files_total: u32,
    bytes_total: u64,
    files_completed: AtomicU32,
    files_failed: AtomicU32,
    bytes_transferred: AtomicU64,
    speed: SpeedCalculator,
    tx: watch::Sender<ProgressSnapshot>,
}

impl ProgressTracker {
    pub fn new(files_total: u32, bytes_total: u64) -> Self {
        let (tx, _) = watch::channel(ProgressSnapshot {
            files_total,
            bytes_total,
            ..Default::default()
        });
        Self {
            files_total,
            bytes_total,
            files_completed: AtomicU32::new(0),
            files_failed: AtomicU32::new(0),
            bytes_transferred: AtomicU64::new(0),
            speed: SpeedCalculator::new(None, None),
            tx,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// Counts bytes moved over the transport.
    pub fn add_bytes(&self, bytes: u64) {
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.speed.add_sample(bytes);
        self.publish();
    }

    /// Counts bytes already present from an earlier run (no speed sample).
    pub fn add_resumed_bytes(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.bytes_transferred.fetch_add(bytes, Ordering::Relaxed);
        self.publish();
    }

    /// Takes back bytes whose chunks were discarded.
    pub fn sub_bytes(&self, bytes: u64) {
        let _ = self
            .bytes_transferred
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(bytes))
            });
        self.publish();
    }

    pub fn file_completed(&self) {
        self.files_completed.fetch_add(1, Ordering::Relaxed);
        self.publish();
    }

    pub fn file_failed(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
        self.publish();
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            files_completed: self.files_completed.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            files_total: self.files_total,
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            bytes_total: self.bytes_total,
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }

    fn publish(&self) {
        self.tx.send_replace(self.snapshot());
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: VecDeque<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// Creates a new calculator.
    ///
    /// - `window_size`: time window for speed calculation (default 5 s).
    /// - `max_samples`: maximum retained samples (default 100).
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: VecDeque::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(5)),
            }),
        }
    }

    /// Records a sample of `bytes` transferred at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.inner.lock().unwrap();
        let now = Instant::now();
        s.samples.push_back(SpeedSample {
            bytes,
            timestamp: now,
        });

        let window = s.window_size;
        while s
            .samples
            .front()
            .is_some_and(|sample| now.duration_since(sample.timestamp) > window)
        {
            s.samples.pop_front();
        }
        while s.samples.len() > s.max_samples {
            s.samples.pop_front();
        }
    }

    /// Returns the average speed in bytes/second within the window.
    ///
    /// Returns 0.0 if fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.inner.lock().unwrap();
        let (Some(first), Some(last)) = (s.samples.front(), s.samples.back()) else {
            return 0.0;
        };
        if s.samples.len() < 2 {
            return 0.0;
        }
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if elapsed.is_zero() {
            return 0.0;
        }
        let total_bytes: u64 = s.samples.iter().map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }
}
