//! Progress accounting.
//!
//! The amount of work in a session is only discovered as heads and catalogs
//! arrive, so counters are built to stay honest while it grows: `total` never
//! decreases, `sofar` never decreases and never exceeds `total`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use fieldsync_core::{LogKey, LogLengths};

/// How many entries each side is expected to move.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedTransfer {
    pub download: u64,
    pub upload: u64,
    /// Per-log download expectation (only logs with something to fetch).
    pub per_log_download: BTreeMap<LogKey, u64>,
}

/// Compare local and remote log lengths.
///
/// `download` sums, over the remote's logs, how far each is ahead of ours
/// (a log we lack counts in full). `upload` is the same the other way round.
pub fn expected_transfer(local: &LogLengths, remote: &LogLengths) -> ExpectedTransfer {
    let mut per_log_download = BTreeMap::new();
    for (key, &remote_len) in remote {
        let local_len = local.get(key).copied().unwrap_or(0);
        if remote_len > local_len {
            per_log_download.insert(*key, remote_len - local_len);
        }
    }

    let upload = local
        .iter()
        .map(|(key, &local_len)| local_len.saturating_sub(remote.get(key).copied().unwrap_or(0)))
        .sum();

    ExpectedTransfer {
        download: per_log_download.values().sum(),
        upload,
        per_log_download,
    }
}

/// A monotonic `sofar / total` pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub sofar: u64,
    pub total: u64,
}

impl Counter {
    /// Raise the total. Lower values are ignored.
    pub fn raise_total(&mut self, total: u64) {
        self.total = self.total.max(total);
    }

    /// Add newly discovered work.
    pub fn add_total(&mut self, more: u64) {
        self.total = self.total.saturating_add(more);
    }

    /// Advance `sofar`. Values below the current one are ignored and the
    /// result is clamped to `total`.
    pub fn advance_to(&mut self, sofar: u64) {
        self.sofar = self.sofar.max(sofar).min(self.total);
    }

    /// Mark all known work as done.
    pub fn complete(&mut self) {
        self.sofar = self.total;
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }
}

/// Progress of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub db: Counter,
    pub media: Counter,
}

impl Progress {
    /// No work known yet (0/0 everywhere).
    pub fn is_trivial(&self) -> bool {
        self.db.is_empty() && self.media.is_empty()
    }
}

/// Download progress of the log phase.
///
/// For every log the remote is ahead on, remembers how many of the entries
/// up to the remote's length we already held when the session learned about
/// it. Entries counted since then are this session's downloads.
#[derive(Debug, Default)]
pub struct DbProgress {
    logs: BTreeMap<LogKey, LogBaseline>,
    upload_expected: u64,
    uploaded: u64,
}

#[derive(Debug, Clone, Copy)]
struct LogBaseline {
    remote_len: u64,
    baseline: u64,
    expected: u64,
    downloaded: u64,
}

impl DbProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a log we expect to download. `baseline` is
    /// `downloaded_count(key, 0, remote_len)` at this point.
    pub fn expect_log(&mut self, key: LogKey, remote_len: u64, baseline: u64, expected: u64) {
        self.logs.insert(
            key,
            LogBaseline {
                remote_len,
                baseline,
                expected,
                downloaded: 0,
            },
        );
    }

    /// Add entries we are going to upload.
    pub fn expect_upload(&mut self, more: u64) {
        self.upload_expected = self.upload_expected.saturating_add(more);
    }

    /// The remote's copy of an expected log grew to `remote_len`. Entries
    /// past the old length are new downloads.
    pub fn extend_log(&mut self, key: &LogKey, remote_len: u64) {
        if let Some(log) = self.logs.get_mut(key) {
            if remote_len > log.remote_len {
                log.expected = log.expected.saturating_add(remote_len - log.remote_len);
                log.remote_len = remote_len;
            }
        }
    }

    /// The range to count for `key`, if it is being downloaded.
    pub fn remote_len(&self, key: &LogKey) -> Option<u64> {
        self.logs.get(key).map(|l| l.remote_len)
    }

    /// Update a log from a fresh `downloaded_count(key, 0, remote_len)`.
    pub fn observe(&mut self, key: &LogKey, count: u64) {
        if let Some(log) = self.logs.get_mut(key) {
            let got = count.saturating_sub(log.baseline).min(log.expected);
            log.downloaded = log.downloaded.max(got);
        }
    }

    pub fn uploaded(&mut self, n: u64) {
        self.uploaded = self.uploaded.saturating_add(n);
    }

    pub fn total(&self) -> u64 {
        self.logs.values().map(|l| l.expected).sum::<u64>() + self.upload_expected
    }

    pub fn sofar(&self) -> u64 {
        self.logs.values().map(|l| l.downloaded).sum::<u64>()
            + self.uploaded.min(self.upload_expected)
    }
}

struct Shared {
    progress: Mutex<Progress>,
    notify: Notify,
    tx: watch::Sender<Option<Progress>>,
}

impl Shared {
    fn progress(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, last: bool) {
        let progress = *self.progress();
        if progress.is_trivial() && !last {
            return;
        }
        self.tx.send_replace(Some(progress));
    }
}

/// Coalescing progress publisher owned by one session.
///
/// Updates are applied immediately but published at most once per
/// `interval` while more keep arriving. [`ProgressReporter::finish`] publishes
/// the final state at once. A 0/0 state is only ever published as the final
/// one.
pub struct ProgressReporter {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressReporter {
    pub fn new(interval: Duration) -> (Self, watch::Receiver<Option<Progress>>) {
        let (tx, rx) = watch::channel(None);
        let shared = Arc::new(Shared {
            progress: Mutex::new(Progress::default()),
            notify: Notify::new(),
            tx,
        });

        let task = tokio::spawn({
            let shared = shared.clone();
            async move {
                loop {
                    shared.notify.notified().await;
                    shared.publish(false);
                    tokio::time::sleep(interval).await;
                }
            }
        });

        (
            Self {
                shared,
                task: Mutex::new(Some(task)),
            },
            rx,
        )
    }

    /// Apply a change and schedule a publish.
    pub fn update(&self, f: impl FnOnce(&mut Progress)) {
        {
            let mut progress = self.shared.progress();
            f(&mut *progress);
        }
        self.shared.notify.notify_one();
    }

    pub fn snapshot(&self) -> Progress {
        *self.shared.progress()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Progress>> {
        self.shared.tx.subscribe()
    }

    /// Stop coalescing and publish the final state now.
    pub fn finish(&self) -> Progress {
        self.stop();
        self.shared.publish(true);
        self.snapshot()
    }

    fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop();
    }
}
