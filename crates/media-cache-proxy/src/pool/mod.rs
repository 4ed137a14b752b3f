//! Download scheduler, task registry, and worker pool.
//!
//! The pool owns every [`DownloadTask`] from submission to terminal state:
//! - at most `pool_size` tasks are `Downloading` concurrently;
//! - duplicate submissions of one `(fingerprint, start, end)` triple coalesce
//!   onto the existing task's progress stream;
//! - dispatch follows submission order, except that tasks for the fingerprint
//!   currently serving a client get a priority boost, and high-priority
//!   window fetches beat low-priority pre-fetches;
//! - cancellation routes by task id, by fingerprint, or by `hls_key`, so one
//!   call can tear down a whole HLS tree.
//!
//! `all_tasks` is kept in insertion order and mutated only behind the pool
//! mutex; workers never touch the registry.

mod worker;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::cache::SegmentCache;
use crate::config::ProxyConfig;
use crate::key::{self, SegmentKey};
use crate::fetch::HttpFetcher;
use crate::task::{DownloadTask, Priority, TaskSignal, TaskStatus};

use worker::WorkerContext;

/// A task submission.
#[derive(Clone, Debug)]
pub struct TaskRequest {
    pub uri: Url,
    pub headers: std::collections::HashMap<String, String>,
    pub hls_key: Option<String>,
    pub start: u64,
    pub end: Option<u64>,
    pub priority: Priority,
    /// When false the task is registered but parked; `dispatch_task` (or a
    /// later duplicate submission with `dispatch: true`) releases it.
    pub dispatch: bool,
}

/// Fixed-size download pool with a coalescing task registry.
pub struct DownloadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: Arc<ProxyConfig>,
    ctx: WorkerContext,
    next_id: AtomicU64,
    state: Mutex<PoolState>,
    task_count_tx: watch::Sender<usize>,
    wake_tx: mpsc::UnboundedSender<()>,
    active_fingerprint: Mutex<Option<String>>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    all_tasks: Vec<Arc<DownloadTask>>,
    by_key: HashMap<SegmentKey, Arc<DownloadTask>>,
    queue: VecDeque<Arc<DownloadTask>>,
    running: usize,
}

impl DownloadPool {
    pub fn new(config: Arc<ProxyConfig>, cache: Arc<SegmentCache>, fetcher: HttpFetcher) -> Self {
        let (task_count_tx, _) = watch::channel(0);
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(PoolInner {
            ctx: WorkerContext {
                cache,
                fetcher,
                config: Arc::clone(&config),
            },
            config,
            next_id: AtomicU64::new(1),
            state: Mutex::new(PoolState::default()),
            task_count_tx,
            wake_tx,
            active_fingerprint: Mutex::new(None),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(scheduler(Arc::clone(&inner), wake_rx));

        Self { inner }
    }

    /// Submit a task, coalescing onto an equivalent live task when present.
    ///
    /// Returns the task handle and whether it was newly created.
    pub fn add_task(&self, request: TaskRequest) -> (Arc<DownloadTask>, bool) {
        let fingerprint = key::fingerprint(
            &request.uri,
            Some(&request.headers),
            &self.inner.config.custom_cache_id,
        );
        let segment_key = SegmentKey::new(fingerprint.clone(), request.start, request.end);

        let task = {
            let mut state = self.inner.lock_state();

            let existing = state.by_key.get(&segment_key).cloned();
            if let Some(existing) = existing {
                let status = existing.status();
                if !matches!(status, TaskStatus::Cancelled | TaskStatus::Failed) {
                    trace!(task_id = existing.id, key = %segment_key, "coalesced onto existing task");
                    if request.dispatch
                        && status == TaskStatus::Queued
                        && !state.queue.iter().any(|t| t.id == existing.id)
                    {
                        state.queue.push_back(Arc::clone(&existing));
                        drop(state);
                        self.wake();
                    }
                    return (existing, false);
                }
            }

            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let task = Arc::new(DownloadTask::new(
                id,
                request.uri,
                request.headers,
                fingerprint,
                request.hls_key,
                request.start,
                request.end,
                request.priority,
            ));
            state.all_tasks.push(Arc::clone(&task));
            state.by_key.insert(segment_key, Arc::clone(&task));
            if request.dispatch {
                state.queue.push_back(Arc::clone(&task));
            }
            let count = state.all_tasks.len();
            drop(state);
            self.inner.task_count_tx.send_replace(count);
            task
        };

        self.wake();
        (task, true)
    }

    /// Submit a task and block until it reaches a terminal state.
    pub async fn execute_task(&self, request: TaskRequest) -> TaskStatus {
        let (task, _) = self.add_task(request);
        task.wait_terminal().await
    }

    /// Release a parked task (registered with `dispatch: false`).
    pub fn dispatch_task(&self, task: &Arc<DownloadTask>) {
        let mut state = self.inner.lock_state();
        if task.status() == TaskStatus::Queued && !state.queue.iter().any(|t| t.id == task.id) {
            state.queue.push_back(Arc::clone(task));
            drop(state);
            self.wake();
        }
    }

    /// Mark the fingerprint currently serving the foreground client; its
    /// tasks are dispatched ahead of others.
    pub fn set_active_fingerprint(&self, fingerprint: Option<String>) {
        *self
            .inner
            .active_fingerprint
            .lock()
            .unwrap_or_else(|poison| poison.into_inner()) = fingerprint;
    }

    /// Cancel every task belonging to a video, addressed by URL, fingerprint,
    /// or HLS tree key, and drop them from the registry.
    ///
    /// Returns the number of tasks cancelled. The task-count stream emits a
    /// single aggregate update.
    pub fn cancel_video_tasks(
        &self,
        url: &Url,
        headers: Option<&std::collections::HashMap<String, String>>,
    ) -> usize {
        let fingerprint = key::fingerprint(url, headers, &self.inner.config.custom_cache_id);
        let hls_key = key::playlist_key(url.as_str());
        let url_str = url.as_str();

        let (victims, count) = {
            let mut state = self.inner.lock_state();
            let victims: Vec<Arc<DownloadTask>> = state
                .all_tasks
                .iter()
                .filter(|t| {
                    t.uri.as_str() == url_str
                        || t.fingerprint == fingerprint
                        || t.hls_key.as_deref() == Some(hls_key.as_str())
                })
                .cloned()
                .collect();

            state
                .all_tasks
                .retain(|t| !victims.iter().any(|v| v.id == t.id));
            state.queue.retain(|t| !victims.iter().any(|v| v.id == t.id));
            for victim in &victims {
                let key = victim.key();
                if state.by_key.get(&key).is_some_and(|t| t.id == victim.id) {
                    state.by_key.remove(&key);
                }
            }
            (victims, state.all_tasks.len())
        };

        for victim in &victims {
            victim.signal(TaskSignal::Cancel);
            // Tasks never claimed by a worker emit their terminal event here.
            if victim.status() == TaskStatus::Queued {
                victim.transition(TaskStatus::Cancelled);
            }
        }

        if !victims.is_empty() {
            debug!(url = url_str, cancelled = victims.len(), "video tasks cancelled");
            self.inner.task_count_tx.send_replace(count);
            self.wake();
        }
        victims.len()
    }

    /// Pause every live task of a fingerprint.
    pub fn pause_video_tasks(&self, fingerprint: &str) {
        for task in self.tasks_for(fingerprint) {
            task.signal(TaskSignal::Pause);
        }
    }

    /// Resume every paused task of a fingerprint.
    pub fn resume_video_tasks(&self, fingerprint: &str) {
        for task in self.tasks_for(fingerprint) {
            task.signal(TaskSignal::Resume);
        }
    }

    /// All registered tasks, insertion-ordered.
    pub fn tasks_snapshot(&self) -> Vec<Arc<DownloadTask>> {
        self.inner.lock_state().all_tasks.clone()
    }

    pub fn task_count(&self) -> usize {
        self.inner.lock_state().all_tasks.len()
    }

    /// Tasks that have not reached a terminal state.
    pub fn active_task_count(&self) -> usize {
        self.inner
            .lock_state()
            .all_tasks
            .iter()
            .filter(|t| !t.status().is_terminal())
            .count()
    }

    /// Stream of task-count updates (one value per change).
    pub fn task_count_stream(&self) -> watch::Receiver<usize> {
        self.inner.task_count_tx.subscribe()
    }

    /// Drop terminal tasks from the registry.
    pub fn prune_terminal(&self) {
        let count = {
            let mut state = self.inner.lock_state();
            state.all_tasks.retain(|t| !t.status().is_terminal());
            state
                .by_key
                .retain(|_, t| !t.status().is_terminal());
            state.all_tasks.len()
        };
        self.inner.task_count_tx.send_replace(count);
    }

    /// Cancel everything and stop the scheduler.
    pub fn close(&self) {
        let tasks = self.tasks_snapshot();
        for task in tasks {
            task.signal(TaskSignal::Cancel);
            if task.status() == TaskStatus::Queued {
                task.transition(TaskStatus::Cancelled);
            }
        }
        self.inner.shutdown.cancel();
    }

    fn tasks_for(&self, fingerprint: &str) -> Vec<Arc<DownloadTask>> {
        self.inner
            .lock_state()
            .all_tasks
            .iter()
            .filter(|t| t.fingerprint == fingerprint)
            .cloned()
            .collect()
    }

    fn wake(&self) {
        let _ = self.inner.wake_tx.send(());
    }
}

impl PoolInner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Pick the next queued task honoring the foreground boost.
    ///
    /// Preference order: active-fingerprint high-priority, active-fingerprint,
    /// any high-priority, then plain submission order.
    fn pick_next(&self, state: &mut PoolState) -> Option<Arc<DownloadTask>> {
        let active = self
            .active_fingerprint
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .clone();

        loop {
            if state.queue.is_empty() {
                return None;
            }

            let position = {
                let matches = |t: &Arc<DownloadTask>, want_active: bool, want_high: bool| {
                    (!want_active || active.as_deref() == Some(t.fingerprint.as_str()))
                        && (!want_high || t.priority == Priority::High)
                };
                [(true, true), (true, false), (false, true)]
                    .iter()
                    .find_map(|&(want_active, want_high)| {
                        state
                            .queue
                            .iter()
                            .position(|t| matches(t, want_active, want_high))
                    })
                    .unwrap_or(0)
            };

            let task = state.queue.remove(position)?;
            if task.cancel_token().is_cancelled() || task.status().is_terminal() {
                task.transition(TaskStatus::Cancelled);
                continue;
            }
            return Some(task);
        }
    }

    fn dispatch(self: &Arc<Self>) {
        loop {
            let task = {
                let mut state = self.lock_state();
                if state.running >= self.config.pool_size {
                    return;
                }
                let Some(task) = self.pick_next(&mut state) else {
                    return;
                };
                state.running += 1;
                task
            };

            let inner = Arc::clone(self);
            tokio::spawn(async move {
                worker::run(&inner.ctx, task).await;
                {
                    let mut state = inner.lock_state();
                    state.running -= 1;
                }
                let _ = inner.wake_tx.send(());
            });
        }
    }
}

async fn scheduler(inner: Arc<PoolInner>, mut wake_rx: mpsc::UnboundedReceiver<()>) {
    loop {
        tokio::select! {
            biased;
            _ = inner.shutdown.cancelled() => break,
            wake = wake_rx.recv() => {
                if wake.is_none() {
                    break;
                }
                inner.dispatch();
            }
        }
    }
}
