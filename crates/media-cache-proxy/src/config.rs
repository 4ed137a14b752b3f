//! Unified configuration for the proxy.
//!
//! This structure flattens all tunables into a single type so that callers
//! configure the server, the cache tiers, and the download pool in one place.
//!
//! Included configuration domains:
//! - Listener behavior (bind address, base port, health-check cadence)
//! - Cache tiers (memory/disk byte budgets, on-disk root, segment grid)
//! - Download pool (worker count, retries, backoff, timeouts)

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Unified settings for the media cache proxy.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    // ----------------------------
    // Listener
    // ----------------------------
    /// IP address the proxy binds to.
    /// Default: 127.0.0.1.
    pub ip: IpAddr,

    /// Base port the proxy binds to. When the port is already in use the
    /// server increments and retries until a free port is found.
    /// Default: 20250.
    pub port: u16,

    /// Interval between health-check self-dials.
    /// Default: 10 seconds.
    pub health_check_interval: Duration,

    /// Timeout for a single health-check dial.
    /// Default: 1 second.
    pub health_check_timeout: Duration,

    // ----------------------------
    // Cache tiers
    // ----------------------------
    /// Byte budget for the in-memory tier.
    /// Default: 100 MB.
    pub memory_cache_size: u64,

    /// Byte budget for the on-disk tier.
    /// Default: 1 GB.
    pub storage_cache_size: u64,

    /// Size of one cache window in bytes.
    /// Default: 2 MB.
    pub segment_size: u64,

    /// Size of the first window of every resource. Smaller values speed up
    /// playback start; the default keeps a uniform grid.
    /// Default: equal to `segment_size`.
    pub first_segment_size: u64,

    /// Request header whose value partitions otherwise-identical URLs into
    /// separate cache namespaces.
    /// Default: `"Custom-Cache-ID"`.
    pub custom_cache_id: String,

    /// Override for the disk cache root. When unset, a `media-cache-proxy`
    /// directory under the OS temp dir is used.
    pub cache_root_path: Option<PathBuf>,

    // ----------------------------
    // Download pool
    // ----------------------------
    /// Number of concurrent download workers.
    /// Default: 4.
    pub pool_size: usize,

    /// Windows kept warm ahead of the client read position.
    /// Default: 2.
    pub cache_segments: usize,

    /// Origin connect timeout.
    /// Default: 5 seconds.
    pub connect_timeout: Duration,

    /// Idle timeout between body chunks from the origin.
    /// Default: 15 seconds.
    pub read_timeout: Duration,

    /// Maximum number of retry attempts for failed origin fetches.
    /// Default: 3 retries.
    pub max_retries: u32,

    /// Base delay for exponential backoff between retries.
    /// Default: 200ms.
    pub retry_base_delay: Duration,

    /// Maximum backoff delay (cap for exponential growth).
    /// Default: 5 seconds.
    pub max_retry_delay: Duration,

    /// Install a default `tracing` subscriber during `Engine::init`.
    /// Default: false.
    pub log_print: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 20250,
            health_check_interval: Duration::from_secs(10),
            health_check_timeout: Duration::from_secs(1),

            memory_cache_size: 100 * 1000 * 1000,
            storage_cache_size: 1000 * 1000 * 1000,
            segment_size: 2 * 1000 * 1000,
            first_segment_size: 2 * 1000 * 1000,
            custom_cache_id: "Custom-Cache-ID".to_string(),
            cache_root_path: None,

            pool_size: 4,
            cache_segments: 2,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(15),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(200),
            max_retry_delay: Duration::from_secs(5),

            log_print: false,
        }
    }
}

impl ProxyConfig {
    /// Create default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// The configured bind address.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Resolved disk cache root (`<root>/videos` holds the segment tree).
    pub fn cache_root(&self) -> PathBuf {
        self.cache_root_path
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("media-cache-proxy"))
    }

    // -------------------------
    // Listener setters
    // -------------------------

    pub fn ip(mut self, v: IpAddr) -> Self {
        self.ip = v;
        self
    }

    pub fn port(mut self, v: u16) -> Self {
        self.port = v;
        self
    }

    // -------------------------
    // Cache setters
    // -------------------------

    pub fn memory_cache_size(mut self, v: u64) -> Self {
        self.memory_cache_size = v;
        self
    }

    pub fn storage_cache_size(mut self, v: u64) -> Self {
        self.storage_cache_size = v;
        self
    }

    pub fn segment_size(mut self, v: u64) -> Self {
        self.segment_size = v;
        self
    }

    pub fn first_segment_size(mut self, v: u64) -> Self {
        self.first_segment_size = v;
        self
    }

    pub fn custom_cache_id(mut self, v: impl Into<String>) -> Self {
        self.custom_cache_id = v.into();
        self
    }

    pub fn cache_root_path(mut self, v: impl Into<PathBuf>) -> Self {
        self.cache_root_path = Some(v.into());
        self
    }

    // -------------------------
    // Pool setters
    // -------------------------

    pub fn pool_size(mut self, v: usize) -> Self {
        self.pool_size = v.max(1);
        self
    }

    pub fn cache_segments(mut self, v: usize) -> Self {
        self.cache_segments = v.max(1);
        self
    }

    pub fn connect_timeout(mut self, v: Duration) -> Self {
        self.connect_timeout = v;
        self
    }

    pub fn read_timeout(mut self, v: Duration) -> Self {
        self.read_timeout = v;
        self
    }

    pub fn max_retries(mut self, v: u32) -> Self {
        self.max_retries = v;
        self
    }

    pub fn retry_base_delay(mut self, v: Duration) -> Self {
        self.retry_base_delay = v;
        self
    }

    pub fn max_retry_delay(mut self, v: Duration) -> Self {
        self.max_retry_delay = v;
        self
    }

    pub fn log_print(mut self, v: bool) -> Self {
        self.log_print = v;
        self
    }

    /// Size of the window whose grid index is `index`.
    ///
    /// The first window may differ from the rest to allow faster startup.
    pub fn window_size(&self, index: u64) -> u64 {
        if index == 0 {
            self.first_segment_size
        } else {
            self.segment_size
        }
    }

    /// Start offset of the window with grid index `index`.
    pub fn window_start(&self, index: u64) -> u64 {
        if index == 0 {
            0
        } else {
            self.first_segment_size + (index - 1) * self.segment_size
        }
    }

    /// Grid index of the window containing byte `offset`.
    pub fn window_index(&self, offset: u64) -> u64 {
        if offset < self.first_segment_size {
            0
        } else {
            1 + (offset - self.first_segment_size) / self.segment_size
        }
    }
}
