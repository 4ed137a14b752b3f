//! Download task model.
//!
//! A [`DownloadTask`] is created on submission and mutated only through the
//! pool: workers drive `Queued → Downloading → Completed`, the serving
//! pipeline upgrades `Completed → Finished` once the client stream has been
//! flushed, and control signals route `Paused` / `Cancelled` transitions.
//!
//! Progress fans out through a `tokio::sync::broadcast` channel: one producer
//! (the worker), any number of subscribers (coalesced submitters, the serving
//! pipeline, pre-cache listeners). Data chunks ride on the same events so a
//! subscriber can stream bytes to its client while the worker accumulates
//! them for the cache. A subscriber that lags simply resynchronizes from the
//! cache once the task completes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::key::SegmentKey;

/// Progress event capacity per task.
///
/// Window tasks are bounded by `segment_size`, so this comfortably holds a
/// full window of body chunks; only a whole-resource fallback task can
/// overflow it, and consumers recover from the cache in that case.
const PROGRESS_CAPACITY: usize = 512;

/// Lifecycle of a download task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    /// Waiting for a worker slot.
    Queued,
    /// A worker is streaming bytes from the origin.
    Downloading,
    /// Parked by a pause signal; resumable.
    Paused,
    /// The worker finished writing the blob to the cache.
    Completed,
    /// The originating client stream has also been flushed.
    Finished,
    /// Cancelled before completion; silent terminal state.
    Cancelled,
    /// Retries exhausted.
    Failed,
}

impl TaskStatus {
    /// Terminal states emit their event exactly once; the only transition out
    /// of a terminal state is `Completed → Finished`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Finished | TaskStatus::Cancelled | TaskStatus::Failed
        )
    }
}

/// Scheduling priority of a fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Priority {
    /// A client is waiting on these bytes right now.
    High,
    /// Pre-fetch ahead of the read position.
    Low,
}

/// Control signals routed from the registry to the owning worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskSignal {
    Pause,
    Resume,
    Cancel,
}

/// One progress event.
#[derive(Clone, Debug)]
pub struct TaskProgress {
    pub task_id: u64,
    pub fingerprint: String,
    pub status: TaskStatus,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    /// Body chunk that produced this event, when any.
    pub chunk: Option<Bytes>,
}

/// A byte-range fetch task.
///
/// Identity is the `(fingerprint, start, end)` triple; two submissions with
/// an identical triple coalesce onto one task.
pub struct DownloadTask {
    pub id: u64,
    pub uri: Url,
    pub headers: HashMap<String, String>,
    pub fingerprint: String,
    /// Master playlist key shared by every resource beneath one HLS tree.
    pub hls_key: Option<String>,
    pub start: u64,
    pub end: Option<u64>,
    pub priority: Priority,

    status: Mutex<TaskStatus>,
    downloaded: AtomicU64,
    total: AtomicU64,
    content_type: Mutex<Option<String>>,
    /// Origin HTTP status behind a `Failed` transition, 0 when none. Lets the
    /// serving pipeline relay 4xx/5xx verbatim instead of a blanket 502.
    failure_status: AtomicU64,
    progress_tx: broadcast::Sender<TaskProgress>,
    signal_tx: mpsc::UnboundedSender<TaskSignal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskSignal>>>,
    cancel: CancellationToken,
}

impl DownloadTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u64,
        uri: Url,
        headers: HashMap<String, String>,
        fingerprint: String,
        hls_key: Option<String>,
        start: u64,
        end: Option<u64>,
        priority: Priority,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CAPACITY);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Self {
            id,
            uri,
            headers,
            fingerprint,
            hls_key,
            start,
            end,
            priority,
            status: Mutex::new(TaskStatus::Queued),
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
            content_type: Mutex::new(None),
            failure_status: AtomicU64::new(0),
            progress_tx,
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            cancel: CancellationToken::new(),
        }
    }

    /// Cache key addressed by this task.
    pub fn key(&self) -> SegmentKey {
        SegmentKey::new(self.fingerprint.clone(), self.start, self.end)
    }

    pub fn status(&self) -> TaskStatus {
        *self.lock_status()
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.downloaded.load(Ordering::Acquire)
    }

    pub fn total_bytes(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    pub fn set_total_bytes(&self, total: u64) {
        self.total.store(total, Ordering::Release);
    }

    /// `Content-Type` observed on the origin response, for echoing to clients.
    pub fn content_type(&self) -> Option<String> {
        self.content_type
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone()
    }

    pub(crate) fn set_content_type(&self, value: String) {
        *self
            .content_type
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = Some(value);
    }

    pub fn failure_status(&self) -> Option<u16> {
        match self.failure_status.load(Ordering::Acquire) {
            0 => None,
            status => Some(status as u16),
        }
    }

    pub(crate) fn set_failure_status(&self, status: u16) {
        self.failure_status.store(status as u64, Ordering::Release);
    }

    /// Reset the progress counter when a retry restarts from scratch.
    pub(crate) fn reset_downloaded(&self, value: u64) {
        self.downloaded.store(value, Ordering::Release);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskProgress> {
        self.progress_tx.subscribe()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Taken exactly once by the worker that claims this task.
    pub(crate) fn take_signal_rx(&self) -> Option<mpsc::UnboundedReceiver<TaskSignal>> {
        self.signal_rx
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take()
    }

    /// Route a control signal to the owning worker.
    ///
    /// Idempotent: signalling a terminal task is a no-op; `Cancel` also trips
    /// the cancellation token so queued and in-flight work stops within one
    /// buffer boundary.
    pub fn signal(&self, signal: TaskSignal) {
        if self.status().is_terminal() {
            return;
        }
        if signal == TaskSignal::Cancel {
            self.cancel.cancel();
        }
        let _ = self.signal_tx.send(signal);
    }

    /// Record an arrived body chunk and fan it out.
    ///
    /// `downloaded_bytes` grows strictly monotonically.
    pub(crate) fn record_chunk(&self, chunk: Bytes) {
        let downloaded = self
            .downloaded
            .fetch_add(chunk.len() as u64, Ordering::AcqRel)
            + chunk.len() as u64;
        let _ = self.progress_tx.send(TaskProgress {
            task_id: self.id,
            fingerprint: self.fingerprint.clone(),
            status: TaskStatus::Downloading,
            downloaded_bytes: downloaded,
            total_bytes: self.total_bytes(),
            chunk: Some(chunk),
        });
    }

    /// Apply a status transition, emitting one progress event when it sticks.
    ///
    /// Terminal states are sticky apart from `Completed → Finished`, which
    /// guarantees each terminal event is emitted exactly once.
    pub(crate) fn transition(&self, to: TaskStatus) -> bool {
        {
            let mut status = self.lock_status();
            let from = *status;
            let allowed = !from.is_terminal()
                || (from == TaskStatus::Completed && to == TaskStatus::Finished);
            if !allowed || from == to {
                return false;
            }
            *status = to;
        }
        let _ = self.progress_tx.send(TaskProgress {
            task_id: self.id,
            fingerprint: self.fingerprint.clone(),
            status: to,
            downloaded_bytes: self.downloaded_bytes(),
            total_bytes: self.total_bytes(),
            chunk: None,
        });
        true
    }

    /// Await a terminal state, tolerating lagged progress streams.
    pub async fn wait_terminal(&self) -> TaskStatus {
        let mut rx = self.subscribe();
        loop {
            let status = self.status();
            if status.is_terminal() {
                return status;
            }
            match rx.recv().await {
                Ok(event) if event.status.is_terminal() => return event.status,
                Ok(_) => {}
                // Lagged or closed: re-check the authoritative status.
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return self.status(),
            }
        }
    }
}

impl std::fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("uri", &self.uri.as_str())
            .field("fingerprint", &self.fingerprint)
            .field("hls_key", &self.hls_key)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("priority", &self.priority)
            .field("status", &self.status())
            .field("downloaded", &self.downloaded_bytes())
            .field("total", &self.total_bytes())
            .finish()
    }
}

impl DownloadTask {
    fn lock_status(&self) -> std::sync::MutexGuard<'_, TaskStatus> {
        self.status
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
