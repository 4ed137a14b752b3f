//! Engine facade.
//!
//! One [`Engine`] value owns the cache tiers, the download pool, the HLS
//! bookkeeping, and the proxy server; there are no process globals, so tests
//! can run several engines side by side. Host applications construct it with
//! [`Engine::init`], point the player at [`Engine::local_url`], and use the
//! pre-cache entry points to warm the cache before playback.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::debug;
use url::Url;

use crate::cache::SegmentCache;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::fetch::HttpFetcher;
use crate::key::{self, SegmentKey};
use crate::pool::{DownloadPool, TaskRequest};
use crate::proxy::hls::HlsPipeline;
use crate::proxy::range::RangePipeline;
use crate::proxy::request::{resolve_origin, ClientRequest};
use crate::proxy::server::{ProxyServer, ServerState};
use crate::registry::{CachedVideoInfo, DownloadCacheRegistry};
use crate::task::{DownloadTask, Priority, TaskProgress};

/// Default number of windows warmed by [`Engine::precache`].
pub const DEFAULT_PRECACHE_SEGMENTS: usize = 2;
/// Default byte budget for [`Engine::precache_byte`].
pub const DEFAULT_PRECACHE_BYTES: u64 = 500 * 1024;

/// The assembled proxy: one value per host application.
pub struct Engine {
    config: Arc<ProxyConfig>,
    cache: Arc<SegmentCache>,
    pool: Arc<DownloadPool>,
    server: Arc<ProxyServer>,
    registry: Arc<DownloadCacheRegistry>,
}

impl Engine {
    /// Build every subsystem and start the proxy server.
    ///
    /// Returns as soon as the server task is spawned; [`Engine::wait_ready`]
    /// awaits the listener actually coming up.
    pub fn init(config: ProxyConfig) -> Engine {
        #[cfg(feature = "log-print")]
        if config.log_print {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| "media_cache_proxy=debug".into()),
                )
                .try_init();
        }

        let config = Arc::new(config);
        let cache = Arc::new(SegmentCache::open(
            &config.cache_root(),
            config.memory_cache_size,
            config.storage_cache_size,
        ));
        let fetcher = HttpFetcher::new(&config);
        let pool = Arc::new(DownloadPool::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            fetcher.clone(),
        ));
        let hls = Arc::new(HlsPipeline::new(Arc::clone(&cache), fetcher.clone()));
        let range = Arc::new(RangePipeline::new(
            Arc::clone(&config),
            Arc::clone(&cache),
            Arc::clone(&pool),
            fetcher,
        ));
        let server = ProxyServer::new(Arc::clone(&config), range, hls);
        tokio::spawn(Arc::clone(&server).run());

        let registry = Arc::new(DownloadCacheRegistry::new(
            Arc::clone(&cache),
            Arc::clone(&pool),
        ));

        Engine {
            config,
            cache,
            pool,
            server,
            registry,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SegmentCache> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<DownloadPool> {
        &self.pool
    }

    /// Await the proxy listener and return its bound address.
    pub async fn wait_ready(&self) -> ProxyResult<SocketAddr> {
        self.server.wait_bound().await
    }

    pub fn server_state(&self) -> ServerState {
        self.server.state()
    }

    /// Proxy-local URL for an origin resource, suitable for handing to a
    /// player.
    pub async fn local_url(&self, origin: &Url) -> ProxyResult<Url> {
        let addr = self.wait_ready().await?;
        let escaped = percent_encoding::utf8_percent_encode(
            origin.as_str(),
            percent_encoding::NON_ALPHANUMERIC,
        )
        .to_string();
        Url::parse(&format!("http://{addr}/{escaped}?origin={escaped}")).map_err(ProxyError::url_parse)
    }

    /// Internal dispatch, exposed so tests can drive a socket through the
    /// pipelines without the accept loop.
    pub async fn parse(
        &self,
        stream: &mut TcpStream,
        uri: &str,
        headers: HashMap<String, String>,
    ) -> ProxyResult<()> {
        let addr = self.wait_ready().await?;
        let request = ClientRequest {
            method: "GET".to_string(),
            target: uri.to_string(),
            headers,
        };
        let origin = resolve_origin(&request)?;
        self.server.dispatch(stream, &request, origin, addr).await
    }

    /// Whether the first `cache_segments` windows of a resource are resident.
    pub fn is_cached(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        cache_segments: usize,
    ) -> ProxyResult<bool> {
        let fingerprint = key::fingerprint_str(url, headers, &self.config.custom_cache_id)?;
        for index in 0..cache_segments as u64 {
            if !self.cache.contains(&self.window_key(&fingerprint, index)) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Warm the first `cache_segments` windows of a resource.
    ///
    /// Returns a progress stream when `progress_listen` is set, `None` when
    /// the run was suppressed as a duplicate or no listener was requested.
    pub fn precache(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        cache_segments: usize,
        download_now: bool,
        progress_listen: bool,
    ) -> ProxyResult<Option<mpsc::UnboundedReceiver<TaskProgress>>> {
        let windows: Vec<u64> = (0..cache_segments as u64).collect();
        self.precache_windows(url, headers, windows, usize::MAX, download_now, progress_listen)
    }

    /// Warm the first `cache_bytes` bytes of a resource.
    ///
    /// The byte budget is rounded up to whole windows; at most
    /// `max_queue_tasks` windows are enqueued and at most `concurrent` run at
    /// a time. De-duplicated by fingerprint: a second call while a run is
    /// active returns `None`.
    #[allow(clippy::too_many_arguments)]
    pub fn precache_byte(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        cache_bytes: u64,
        concurrent: usize,
        max_queue_tasks: usize,
        download_now: bool,
        progress_listen: bool,
    ) -> ProxyResult<Option<mpsc::UnboundedReceiver<TaskProgress>>> {
        let cache_bytes = cache_bytes.max(1);
        let last_index = self.config.window_index(cache_bytes - 1);
        let windows: Vec<u64> = (0..=last_index).take(max_queue_tasks.max(1)).collect();
        self.precache_windows(url, headers, windows, concurrent.max(1), download_now, progress_listen)
    }

    fn precache_windows(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
        windows: Vec<u64>,
        concurrent: usize,
        download_now: bool,
        progress_listen: bool,
    ) -> ProxyResult<Option<mpsc::UnboundedReceiver<TaskProgress>>> {
        let origin = Url::parse(url).map_err(ProxyError::url_parse)?;
        let headers = headers.cloned().unwrap_or_default();
        let fingerprint = key::fingerprint(&origin, Some(&headers), &self.config.custom_cache_id);

        if !self.registry.begin_precache(&fingerprint) {
            debug!(url, "pre-cache already active, suppressed");
            return Ok(None);
        }

        let mut tasks: Vec<Arc<DownloadTask>> = Vec::with_capacity(windows.len());
        for index in windows {
            let key = self.window_key(&fingerprint, index);
            let (task, _) = self.pool.add_task(TaskRequest {
                uri: origin.clone(),
                headers: headers.clone(),
                hls_key: None,
                start: key.start,
                end: key.end,
                priority: Priority::Low,
                // The driver below releases windows one batch at a time.
                dispatch: false,
            });
            tasks.push(task);
        }

        let progress_rx = progress_listen.then(|| forward_progress(&tasks));

        let registry = Arc::clone(&self.registry);
        let pool = Arc::clone(&self.pool);
        let fingerprint_done = fingerprint.clone();
        tokio::spawn(async move {
            if download_now {
                for batch in tasks.chunks(concurrent) {
                    for task in batch {
                        pool.dispatch_task(task);
                    }
                    for task in batch {
                        task.wait_terminal().await;
                    }
                }
            }
            registry.end_precache(&fingerprint_done);
        });

        Ok(progress_rx)
    }

    /// Cancel every task for a video (by URL, fingerprint, or HLS tree key).
    pub fn cancel_video_tasks(
        &self,
        url: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> ProxyResult<usize> {
        let origin = Url::parse(url).map_err(ProxyError::url_parse)?;
        Ok(self.pool.cancel_video_tasks(&origin, headers))
    }

    pub fn task_count(&self) -> usize {
        self.pool.task_count()
    }

    pub fn active_task_count(&self) -> usize {
        self.pool.active_task_count()
    }

    pub fn task_count_stream(&self) -> watch::Receiver<usize> {
        self.pool.task_count_stream()
    }

    /// Broadcast stream of server failures (bind, listen, health check).
    pub fn on_error(&self) -> broadcast::Receiver<String> {
        self.server.on_error()
    }

    /// Per-video cache snapshots.
    pub fn cached_videos(&self) -> Vec<CachedVideoInfo> {
        self.registry.cached_videos()
    }

    /// Drop the whole cache, both tiers.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Stop the server, the health check, and every task.
    pub fn close(&self) {
        self.pool.close();
        self.server.close();
    }

    fn window_key(&self, fingerprint: &str, index: u64) -> SegmentKey {
        let start = self.config.window_start(index);
        let end = start + self.config.window_size(index) - 1;
        SegmentKey::new(fingerprint, start, Some(end))
    }
}

/// Merge the progress broadcasts of several tasks into one stream.
fn forward_progress(tasks: &[Arc<DownloadTask>]) -> mpsc::UnboundedReceiver<TaskProgress> {
    let (tx, rx) = mpsc::unbounded_channel();
    for task in tasks {
        let mut task_rx = task.subscribe();
        let tx = tx.clone();
        let task = Arc::clone(task);
        tokio::spawn(async move {
            if task.status().is_terminal() {
                // Forward whatever beat the subscription, then stop; no more
                // events are coming.
                while let Ok(event) = task_rx.try_recv() {
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                return;
            }
            loop {
                match task_rx.recv().await {
                    Ok(event) => {
                        let terminal = event.status.is_terminal();
                        if tx.send(event).is_err() || terminal {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }
    rx
}
