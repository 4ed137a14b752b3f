//! Download worker.
//!
//! Each worker owns exactly one task at a time and is an isolated failure
//! domain: origin errors, timeouts, and cancellation stay inside the worker
//! and surface only as task status transitions.
//!
//! Per-task protocol:
//! 1. Serve from the cache tiers when the requested range is already resident
//!    (no network I/O).
//! 2. Otherwise stream `Range: bytes=start-end` from the origin in fixed-size
//!    chunks, fanning each chunk out through the task's progress broadcast.
//! 3. Retries resume from `start + downloaded` with exponential backoff.
//! 4. Control signals: `Pause` parks after the in-flight chunk and drops the
//!    connection, `Resume` reissues with an offset range, `Cancel` discards
//!    the accumulator within one chunk boundary.
//!
//! An origin that ignores `Range` (plain 200 with the whole body) degrades to
//! one streaming pass: the worker skips to the requested slice for progress
//! purposes while accumulating the full body, which is split into grid
//! windows and cached post-hoc.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::cache::{CachedSegment, SegmentCache};
use crate::config::ProxyConfig;
use crate::error::ProxyError;
use crate::fetch::HttpFetcher;
use crate::key::SegmentKey;
use crate::task::{DownloadTask, TaskSignal, TaskStatus};

pub(crate) struct WorkerContext {
    pub cache: Arc<SegmentCache>,
    pub fetcher: HttpFetcher,
    pub config: Arc<ProxyConfig>,
}

/// Drive one task to a terminal state.
pub(crate) async fn run(ctx: &WorkerContext, task: Arc<DownloadTask>) {
    if task.cancel_token().is_cancelled() {
        task.transition(TaskStatus::Cancelled);
        return;
    }
    if task.status().is_terminal() {
        return;
    }

    let mut signals = task.take_signal_rx();
    task.transition(TaskStatus::Downloading);

    // Fully satisfiable from the tiers: complete without touching the network.
    if let Some(cached) = ctx.cache.get(&task.key()) {
        if cached.total_bytes > 0 {
            task.set_total_bytes(cached.total_bytes);
        }
        task.reset_downloaded(cached.data.len() as u64);
        task.transition(TaskStatus::Completed);
        trace!(task_id = task.id, key = %task.key(), "served from cache tiers");
        return;
    }

    match download(ctx, &task, &mut signals).await {
        Outcome::Done(body) => {
            commit(ctx, &task, body);
            task.transition(TaskStatus::Completed);
        }
        Outcome::Cancelled => {
            task.transition(TaskStatus::Cancelled);
        }
        Outcome::Failed(e) => {
            warn!(task_id = task.id, uri = %task.uri, error = %e, "task failed");
            if let ProxyError::OriginStatus { status, .. } = &e {
                task.set_failure_status(*status);
            }
            task.transition(TaskStatus::Failed);
        }
    }
}

enum Outcome {
    /// The accumulated body. `full` carries the whole resource when the
    /// origin ignored the range request.
    Done(Body),
    Cancelled,
    Failed(ProxyError),
}

struct Body {
    slice: Bytes,
    full: Option<Bytes>,
}

enum StreamEnd {
    Complete,
    Retry(ProxyError),
    /// Park until resumed, then reissue with an offset range; not a failure,
    /// so it neither consumes a retry attempt nor backs off.
    Paused,
    Cancelled,
}

async fn download(
    ctx: &WorkerContext,
    task: &Arc<DownloadTask>,
    signals: &mut Option<mpsc::UnboundedReceiver<TaskSignal>>,
) -> Outcome {
    let want = task.end.map(|end| end - task.start + 1);
    let mut slice = BytesMut::new();
    let mut full: Option<BytesMut> = None;

    let mut attempt = 0u32;
    let mut delay = ctx.config.retry_base_delay;

    loop {
        if task.cancel_token().is_cancelled() {
            return Outcome::Cancelled;
        }

        let resume_at = task.start + slice.len() as u64;
        let response = match ctx
            .fetcher
            .get_range(&task.uri, &task.headers, resume_at, task.end, task.cancel_token())
            .await
        {
            Ok(response) => response,
            Err(ProxyError::Cancelled) => return Outcome::Cancelled,
            Err(e) if e.is_retryable() && attempt < ctx.config.max_retries => {
                attempt += 1;
                debug!(
                    task_id = task.id,
                    attempt,
                    max_attempts = ctx.config.max_retries,
                    "origin fetch failed, backing off: {e}"
                );
                tokio::select! {
                    biased;
                    _ = task.cancel_token().cancelled() => return Outcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {},
                }
                delay = (delay * 2).min(ctx.config.max_retry_delay);
                continue;
            }
            Err(e) => return Outcome::Failed(e),
        };

        if let Some(total) = response.total_bytes {
            task.set_total_bytes(total);
        }
        if let Some(content_type) = response.content_type.clone() {
            task.set_content_type(content_type);
        }

        if !response.honors_range && (task.start > 0 || task.end.is_some()) {
            // Non-ranging origin: one streaming pass over the whole body.
            // Progress still reflects only the requested slice.
            slice.clear();
            task.reset_downloaded(0);
            full = Some(BytesMut::new());
        }

        let mut stream = response.stream;
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = task.cancel_token().cancelled() => break StreamEnd::Cancelled,
                signal = next_signal(signals) => match signal {
                    TaskSignal::Cancel => break StreamEnd::Cancelled,
                    TaskSignal::Pause => break StreamEnd::Paused,
                    TaskSignal::Resume => continue,
                },
                item = tokio::time::timeout(ctx.fetcher.read_timeout(), stream.next()) => match item {
                    Err(_) => break StreamEnd::Retry(ProxyError::timeout(task.uri.to_string())),
                    Ok(None) => break StreamEnd::Complete,
                    Ok(Some(Err(e))) => break StreamEnd::Retry(e),
                    Ok(Some(Ok(chunk))) => Some(chunk),
                },
            };

            let Some(chunk) = next else { continue };

            if let Some(full_acc) = full.as_mut() {
                // Keep reading past the slice: the rest of the body feeds the cache.
                full_acc.extend_from_slice(&chunk);
                append_slice_portion(task, &mut slice, full_acc.len() as u64, &chunk, want);
            } else {
                let mut chunk = chunk;
                if let Some(want) = want {
                    let remaining = want - slice.len() as u64;
                    if (chunk.len() as u64) > remaining {
                        chunk = chunk.slice(..remaining as usize);
                    }
                }
                slice.extend_from_slice(&chunk);
                task.record_chunk(chunk);
                if let Some(want) = want {
                    if slice.len() as u64 >= want {
                        break StreamEnd::Complete;
                    }
                }
            }
        };

        // The origin connection closes here, before any parking or backoff.
        drop(stream);

        match end {
            StreamEnd::Complete => {
                return Outcome::Done(Body {
                    slice: slice.freeze(),
                    full: full.map(BytesMut::freeze),
                });
            }
            StreamEnd::Cancelled => return Outcome::Cancelled,
            StreamEnd::Paused => {
                task.transition(TaskStatus::Paused);
                match park(task, signals).await {
                    ParkEnd::Resumed => {
                        task.transition(TaskStatus::Downloading);
                        continue;
                    }
                    ParkEnd::Cancelled => return Outcome::Cancelled,
                }
            }
            StreamEnd::Retry(e) if attempt < ctx.config.max_retries => {
                attempt += 1;
                debug!(
                    task_id = task.id,
                    attempt,
                    downloaded = slice.len(),
                    "stream interrupted, backing off: {e}"
                );
                if full.is_some() {
                    // A non-ranging origin cannot resume; start over.
                    slice.clear();
                    full = Some(BytesMut::new());
                    task.reset_downloaded(0);
                }
                tokio::select! {
                    biased;
                    _ = task.cancel_token().cancelled() => return Outcome::Cancelled,
                    _ = tokio::time::sleep(delay) => {},
                }
                delay = (delay * 2).min(ctx.config.max_retry_delay);
            }
            StreamEnd::Retry(e) => return Outcome::Failed(e),
        }
    }
}

/// Forward the part of `chunk` that overlaps the requested slice, given that
/// the full-body accumulator now holds `full_len` bytes ending with `chunk`.
fn append_slice_portion(
    task: &DownloadTask,
    slice: &mut BytesMut,
    full_len: u64,
    chunk: &Bytes,
    want: Option<u64>,
) {
    let chunk_start = full_len - chunk.len() as u64;
    let slice_start = task.start + slice.len() as u64;
    let slice_limit = want.map(|w| task.start + w);

    let lo = slice_start.max(chunk_start);
    let hi = match slice_limit {
        Some(limit) => limit.min(full_len),
        None => full_len,
    };
    if lo >= hi {
        return;
    }
    let piece = chunk.slice((lo - chunk_start) as usize..(hi - chunk_start) as usize);
    slice.extend_from_slice(&piece);
    task.record_chunk(piece);
}

enum ParkEnd {
    Resumed,
    Cancelled,
}

async fn park(
    task: &Arc<DownloadTask>,
    signals: &mut Option<mpsc::UnboundedReceiver<TaskSignal>>,
) -> ParkEnd {
    loop {
        tokio::select! {
            biased;
            _ = task.cancel_token().cancelled() => return ParkEnd::Cancelled,
            signal = next_signal(signals) => match signal {
                TaskSignal::Resume => return ParkEnd::Resumed,
                TaskSignal::Cancel => return ParkEnd::Cancelled,
                TaskSignal::Pause => {}
            },
        }
    }
}

/// Next control signal; pends forever once the channel closes.
async fn next_signal(signals: &mut Option<mpsc::UnboundedReceiver<TaskSignal>>) -> TaskSignal {
    loop {
        match signals {
            Some(rx) => match rx.recv().await {
                Some(signal) => return signal,
                None => {
                    *signals = None;
                }
            },
            None => std::future::pending::<()>().await,
        }
    }
}

/// Write the downloaded body into the cache tiers.
///
/// A whole-body fallback is split along the window grid; everything else is
/// one blob under the task's own key. A shorter-than-requested blob (EOF
/// inside the window) is cached as-is.
fn commit(ctx: &WorkerContext, task: &Arc<DownloadTask>, body: Body) {
    let total = task.total_bytes();

    if let Some(full) = body.full {
        let mut offset = 0u64;
        let mut index = 0u64;
        while offset < full.len() as u64 {
            let size = ctx.config.window_size(index);
            let end = (offset + size).min(full.len() as u64);
            let key = SegmentKey::new(task.fingerprint.clone(), offset, Some(offset + size - 1));
            let segment = CachedSegment {
                data: full.slice(offset as usize..end as usize),
                total_bytes: total,
            };
            if let Err(e) = ctx.cache.put(&key, segment) {
                debug!(task_id = task.id, key = %key, error = %e, "cache write failed, streaming without cache");
            }
            offset = end;
            index += 1;
        }
        return;
    }

    if body.slice.is_empty() {
        return;
    }
    let key = task.key();
    let segment = CachedSegment {
        data: body.slice,
        total_bytes: total,
    };
    if let Err(e) = ctx.cache.put(&key, segment) {
        debug!(task_id = task.id, key = %key, error = %e, "cache write failed, streaming without cache");
    }
}
