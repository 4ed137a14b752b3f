//! Ranged serving pipeline.
//!
//! Serves one client request for a byte-addressable resource by walking the
//! window grid that intersects the requested interval. Each window is served
//! from the cache when resident, otherwise from a freshly submitted
//! high-priority fetch whose chunks are relayed to the client as they arrive.
//! The next `cache_segments − 1` windows are pre-fetched at low priority so
//! sequential playback stays ahead of the network.
//!
//! The response head is written after the first window's metadata is known,
//! so `Content-Range`/`Content-Length` carry the origin's totals whenever the
//! origin reports them.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

use crate::cache::{CachedSegment, SegmentCache};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::fetch::HttpFetcher;
use crate::key::{self, SegmentKey};
use crate::pool::{DownloadPool, TaskRequest};
use crate::proxy::request::{write_response_head, write_simple_response};
use crate::task::{DownloadTask, Priority, TaskProgress, TaskStatus};

const DEFAULT_CONTENT_TYPE: &str = "video/mp4";

pub struct RangePipeline {
    config: Arc<ProxyConfig>,
    cache: Arc<SegmentCache>,
    pool: Arc<DownloadPool>,
    fetcher: HttpFetcher,
}

enum WindowSource {
    Cached(CachedSegment),
    Task(Arc<DownloadTask>, broadcast::Receiver<TaskProgress>),
}

/// Result of serving one window slice.
struct WindowServed {
    written: u64,
    /// The resource ended inside this window.
    eof: bool,
}

impl RangePipeline {
    pub fn new(
        config: Arc<ProxyConfig>,
        cache: Arc<SegmentCache>,
        pool: Arc<DownloadPool>,
        fetcher: HttpFetcher,
    ) -> Self {
        Self {
            config,
            cache,
            pool,
            fetcher,
        }
    }

    /// Serve one ranged request.
    ///
    /// `client_range` is the parsed `Range` header; `hls_key` ties HLS
    /// segments to their master's tree for group cancellation.
    pub async fn serve(
        &self,
        client: &mut TcpStream,
        origin: Url,
        headers: HashMap<String, String>,
        client_range: Option<(u64, Option<u64>)>,
        hls_key: Option<String>,
    ) -> ProxyResult<()> {
        let fingerprint = key::fingerprint(&origin, Some(&headers), &self.config.custom_cache_id);
        self.pool.set_active_fingerprint(Some(fingerprint.clone()));
        let result = self
            .serve_inner(client, &origin, &headers, client_range, hls_key, &fingerprint)
            .await;
        self.pool.set_active_fingerprint(None);
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn serve_inner(
        &self,
        client: &mut TcpStream,
        origin: &Url,
        headers: &HashMap<String, String>,
        client_range: Option<(u64, Option<u64>)>,
        hls_key: Option<String>,
        fingerprint: &str,
    ) -> ProxyResult<()> {
        let had_range = client_range.is_some();
        let (start, requested_end) = client_range.unwrap_or((0, None));

        let first_index = self.config.window_index(start);
        let mut total: u64 = 0;
        let mut content_type: Option<String> = None;

        // Resolve the first window before writing the head so totals and the
        // content type can be echoed.
        let first_source = match self.cache.get(&self.window_key(fingerprint, first_index)) {
            Some(segment) => {
                total = segment.total_bytes;
                WindowSource::Cached(segment)
            }
            None => {
                let (task, rx) = self.submit_window(
                    origin,
                    headers,
                    fingerprint,
                    first_index,
                    Priority::High,
                    hls_key.clone(),
                );
                if let Err(status) = wait_for_metadata(&task).await {
                    return relay_failure(client, status).await;
                }
                total = task.total_bytes();
                content_type = task.content_type();
                WindowSource::Task(task, rx)
            }
        };

        if total > 0 && start >= total {
            write_response_head(
                client,
                416,
                &[("Content-Range", format!("bytes */{total}"))],
            )
            .await?;
            return Ok(());
        }

        // Clamp the requested interval to the known resource length.
        let end = match (requested_end, total) {
            (Some(e), t) if t > 0 => Some(e.min(t - 1)),
            (Some(e), _) => Some(e),
            (None, t) if t > 0 => Some(t - 1),
            (None, _) => None,
        };

        let mut head = Vec::with_capacity(4);
        head.push((
            "Content-Type",
            content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        ));
        head.push(("Accept-Ranges", "bytes".to_string()));
        if let Some(end) = end {
            head.push(("Content-Length", (end - start + 1).to_string()));
        }
        if had_range && total > 0 {
            let last = end.unwrap_or(total - 1);
            head.push(("Content-Range", format!("bytes {start}-{last}/{total}")));
        }
        let status = if had_range { 206 } else { 200 };
        write_response_head(client, status, &head).await.map_err(client_gone)?;

        // Walk the windows intersecting [start, end].
        let mut position = start;
        let mut index = first_index;
        let mut first_source = Some(first_source);

        loop {
            if let Some(end) = end {
                if position > end {
                    break;
                }
            }
            if total > 0 && position >= total {
                break;
            }

            self.prefetch(origin, headers, fingerprint, index, total, hls_key.as_deref());

            let source = match first_source.take() {
                Some(source) => source,
                None => match self.cache.get(&self.window_key(fingerprint, index)) {
                    Some(segment) => {
                        if segment.total_bytes > 0 && total == 0 {
                            total = segment.total_bytes;
                        }
                        WindowSource::Cached(segment)
                    }
                    None => {
                        let (task, rx) = self.submit_window(
                            origin,
                            headers,
                            fingerprint,
                            index,
                            Priority::High,
                            hls_key.clone(),
                        );
                        WindowSource::Task(task, rx)
                    }
                },
            };

            let win_start = self.config.window_start(index);
            let win_size = self.config.window_size(index);
            let slice_lo = position - win_start;
            let slice_hi = {
                let window_last = win_size - 1;
                let mut hi = window_last;
                if let Some(end) = end {
                    hi = hi.min(end - win_start);
                }
                if total > 0 {
                    hi = hi.min(total - 1 - win_start);
                }
                hi
            };

            let served = match source {
                WindowSource::Cached(segment) => {
                    self.write_cached_slice(client, &segment, slice_lo, slice_hi, win_size)
                        .await?
                }
                WindowSource::Task(task, rx) => {
                    let served = self
                        .stream_task_slice(client, &task, rx, slice_lo, slice_hi, win_size)
                        .await?;
                    // The originating client stream is flushed window by window.
                    client.flush().await.map_err(client_gone)?;
                    task.transition(TaskStatus::Finished);
                    if total == 0 {
                        total = task.total_bytes();
                    }
                    served
                }
            };

            position += served.written;
            if served.eof {
                break;
            }
            index += 1;
        }

        client.flush().await.map_err(client_gone)?;
        trace!(fingerprint, start, position, "range response complete");
        Ok(())
    }

    /// Stream the origin verbatim, bypassing the cache (unknown schemes and
    /// other non-cacheable resources).
    pub async fn serve_passthrough(
        &self,
        client: &mut TcpStream,
        origin: &Url,
        headers: &HashMap<String, String>,
    ) -> ProxyResult<()> {
        let cancel = CancellationToken::new();
        let response = match self.fetcher.get(origin, headers, &cancel).await {
            Ok(response) => response,
            Err(ProxyError::OriginStatus { status, .. }) => {
                return relay_failure(client, Some(status)).await;
            }
            Err(_) => return relay_failure(client, None).await,
        };

        let mut head = Vec::with_capacity(2);
        if let Some(content_type) = &response.content_type {
            head.push(("Content-Type", content_type.clone()));
        }
        if let Some(len) = response.content_length {
            head.push(("Content-Length", len.to_string()));
        }
        write_response_head(client, response.status, &head)
            .await
            .map_err(client_gone)?;

        let mut stream = response.stream;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            client.write_all(&chunk).await.map_err(client_gone)?;
        }
        client.flush().await.map_err(client_gone)?;
        Ok(())
    }

    fn window_key(&self, fingerprint: &str, index: u64) -> SegmentKey {
        let start = self.config.window_start(index);
        let end = start + self.config.window_size(index) - 1;
        SegmentKey::new(fingerprint, start, Some(end))
    }

    fn submit_window(
        &self,
        origin: &Url,
        headers: &HashMap<String, String>,
        fingerprint: &str,
        index: u64,
        priority: Priority,
        hls_key: Option<String>,
    ) -> (Arc<DownloadTask>, broadcast::Receiver<TaskProgress>) {
        let key = self.window_key(fingerprint, index);
        let (task, created) = self.pool.add_task(TaskRequest {
            uri: origin.clone(),
            headers: headers.clone(),
            hls_key,
            start: key.start,
            end: key.end,
            priority,
            dispatch: true,
        });
        if created {
            debug!(fingerprint, index, key = %key, "window fetch enqueued");
        }
        let rx = task.subscribe();
        (task, rx)
    }

    /// Enqueue the next `cache_segments − 1` windows at low priority.
    fn prefetch(
        &self,
        origin: &Url,
        headers: &HashMap<String, String>,
        fingerprint: &str,
        index: u64,
        total: u64,
        hls_key: Option<&str>,
    ) {
        for ahead in 1..self.config.cache_segments as u64 {
            let next = index + ahead;
            let win_start = self.config.window_start(next);
            if total > 0 && win_start >= total {
                break;
            }
            if self.cache.contains(&self.window_key(fingerprint, next)) {
                continue;
            }
            self.submit_window(
                origin,
                headers,
                fingerprint,
                next,
                Priority::Low,
                hls_key.map(str::to_owned),
            );
        }
    }

    async fn write_cached_slice(
        &self,
        client: &mut TcpStream,
        segment: &CachedSegment,
        lo: u64,
        hi: u64,
        window_size: u64,
    ) -> ProxyResult<WindowServed> {
        let len = segment.data.len() as u64;
        let eof = len < window_size;
        if lo >= len {
            return Ok(WindowServed { written: 0, eof });
        }
        let hi = hi.min(len - 1);
        client
            .write_all(&segment.data[lo as usize..=hi as usize])
            .await
            .map_err(client_gone)?;
        Ok(WindowServed {
            written: hi - lo + 1,
            eof,
        })
    }

    /// Relay a window slice from a live task to the client as chunks arrive.
    ///
    /// Chunk offsets are recovered from the task's monotonic progress counter.
    /// A lagged progress stream (or a subscription that raced the worker)
    /// resynchronizes from the cache once the task completes.
    async fn stream_task_slice(
        &self,
        client: &mut TcpStream,
        task: &Arc<DownloadTask>,
        mut rx: broadcast::Receiver<TaskProgress>,
        lo: u64,
        hi: u64,
        window_size: u64,
    ) -> ProxyResult<WindowServed> {
        let mut next = lo;

        // A coalesced task may already be terminal; its events predate our
        // subscription, so serve straight from the cache.
        let status = task.status();
        if status.is_terminal() {
            return self
                .finish_from_cache(client, task, status, lo, next, hi, window_size)
                .await;
        }

        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    trace!(task_id = task.id, skipped, "progress stream lagged, draining from cache");
                    let status = task.wait_terminal().await;
                    return self
                        .finish_from_cache(client, task, status, lo, next, hi, window_size)
                        .await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let status = task.status();
                    return self
                        .finish_from_cache(client, task, status, lo, next, hi, window_size)
                        .await;
                }
            };

            if let Some(chunk) = event.chunk {
                let chunk_start = event.downloaded_bytes - chunk.len() as u64;
                let chunk_end = event.downloaded_bytes;
                if chunk_start > next {
                    // Subscribed after earlier chunks flowed; resync from the
                    // cache instead of leaving a gap.
                    let status = task.wait_terminal().await;
                    return self
                        .finish_from_cache(client, task, status, lo, next, hi, window_size)
                        .await;
                }
                let piece_lo = next.max(chunk_start);
                let piece_hi = (hi + 1).min(chunk_end);
                if piece_lo < piece_hi {
                    let piece =
                        chunk.slice((piece_lo - chunk_start) as usize..(piece_hi - chunk_start) as usize);
                    client.write_all(&piece).await.map_err(client_gone)?;
                    next = piece_hi;
                }
                if next > hi {
                    return Ok(WindowServed {
                        written: next - lo,
                        eof: false,
                    });
                }
            } else if event.status.is_terminal() {
                return self
                    .finish_from_cache(client, task, event.status, lo, next, hi, window_size)
                    .await;
            }
        }
    }

    /// Complete a window slice from the cache after the task reached a
    /// terminal state.
    #[allow(clippy::too_many_arguments)]
    async fn finish_from_cache(
        &self,
        client: &mut TcpStream,
        task: &Arc<DownloadTask>,
        status: TaskStatus,
        lo: u64,
        next: u64,
        hi: u64,
        window_size: u64,
    ) -> ProxyResult<WindowServed> {
        match status {
            TaskStatus::Completed | TaskStatus::Finished => {
                let Some(segment) = self.cache.get(&task.key()) else {
                    // Cache write failed; the client got whatever was streamed live.
                    return Ok(WindowServed {
                        written: next - lo,
                        eof: true,
                    });
                };
                let len = segment.data.len() as u64;
                let eof = len < window_size;
                if next < len && next <= hi {
                    let hi = hi.min(len - 1);
                    client
                        .write_all(&segment.data[next as usize..=hi as usize])
                        .await
                        .map_err(client_gone)?;
                    return Ok(WindowServed {
                        written: hi + 1 - lo,
                        eof,
                    });
                }
                Ok(WindowServed {
                    written: next - lo,
                    eof,
                })
            }
            TaskStatus::Cancelled => Err(ProxyError::Cancelled),
            TaskStatus::Failed => Err(match task.failure_status() {
                Some(status) => ProxyError::origin_status(status, task.uri.to_string()),
                None => ProxyError::OriginUnreachable(task.uri.to_string()),
            }),
            // Not terminal; treat as a truncated stream.
            _ => Ok(WindowServed {
                written: next - lo,
                eof: true,
            }),
        }
    }
}

/// Wait until a task has produced response metadata (total bytes, content
/// type) or reached a terminal state.
///
/// Returns `Err(Some(status))` when the task failed with an origin status to
/// relay, `Err(None)` for a plain upstream failure.
async fn wait_for_metadata(task: &Arc<DownloadTask>) -> Result<(), Option<u16>> {
    let mut rx = task.subscribe();
    loop {
        let status = task.status();
        if status == TaskStatus::Failed {
            return Err(task.failure_status());
        }
        if status.is_terminal() || task.total_bytes() > 0 || task.downloaded_bytes() > 0 {
            return Ok(());
        }
        match rx.recv().await {
            Ok(event) => {
                if event.status == TaskStatus::Failed {
                    return Err(task.failure_status());
                }
                if event.status.is_terminal()
                    || event.total_bytes > 0
                    || event.downloaded_bytes > 0
                {
                    return Ok(());
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                return match task.status() {
                    TaskStatus::Failed => Err(task.failure_status()),
                    _ => Ok(()),
                };
            }
        }
    }
}

/// Relay an upstream failure before any body bytes were written.
async fn relay_failure(client: &mut TcpStream, status: Option<u16>) -> ProxyResult<()> {
    let status = status.unwrap_or(502);
    write_simple_response(client, status, "text/plain", b"").await?;
    Ok(())
}

fn client_gone(_: std::io::Error) -> ProxyError {
    ProxyError::ClientDisconnect
}
