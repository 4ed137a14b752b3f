//! Local HTTP proxy that accelerates media playback with a two-tier byte
//! cache.
//!
//! Point a player at the loopback address this crate binds and it will:
//! - rewrite each request into ranged fetches against the origin,
//! - stream the bytes back while populating a memory + disk LRU cache keyed
//!   by stable URL fingerprints,
//! - rewrite HLS playlists so segments flow back through the proxy,
//! - pre-cache resources on request (by window count or byte budget).
//!
//! This crate is composed of several modules:
//! - `key`: URL canonicalization and cache key derivation.
//! - `cache`: the two-tier (memory → disk) LRU segment cache.
//! - `fetch`: the shared origin HTTP client.
//! - `task` / `pool`: download tasks, coalescing registry, and worker pool.
//! - `proxy`: the HTTP/1.1 server, request framing, and the ranged/HLS
//!   serving pipelines.
//! - `registry`: pre-cache de-duplication and cached-video snapshots.
//! - `engine`: the facade owning all of the above.
//!
//! This file (`lib.rs`) acts as a facade: it re-exports the main types from
//! the internal modules to form the public API of the `media-cache-proxy`
//! crate.
//!
//! ```no_run
//! use media_cache_proxy::{Engine, ProxyConfig};
//!
//! # async fn demo() -> media_cache_proxy::ProxyResult<()> {
//! let engine = Engine::init(ProxyConfig::default());
//! let addr = engine.wait_ready().await?;
//! let origin = url::Url::parse("https://cdn.example.com/v.mp4").unwrap();
//! let play_me = engine.local_url(&origin).await?;
//! println!("proxy on {addr}, play {play_me}");
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod key;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod task;

pub use crate::cache::{CachedSegment, SegmentCache};
pub use crate::config::ProxyConfig;
pub use crate::engine::{Engine, DEFAULT_PRECACHE_BYTES, DEFAULT_PRECACHE_SEGMENTS};
pub use crate::error::{ProxyError, ProxyResult};
pub use crate::key::SegmentKey;
pub use crate::pool::{DownloadPool, TaskRequest};
pub use crate::proxy::dispatch::RequestKind;
pub use crate::proxy::server::{ProxyServer, ServerState};
pub use crate::registry::{CachedVideoInfo, DownloadCacheRegistry};
pub use crate::task::{DownloadTask, Priority, TaskProgress, TaskSignal, TaskStatus};

pub use bytes::Bytes;
pub use url::Url;
