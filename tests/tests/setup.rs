//! Shared engine-construction helpers for the integration tests.

#![allow(dead_code)]

use std::path::PathBuf;

use media_cache_proxy::ProxyConfig;

/// Fresh, unique cache root for one test.
pub fn cache_root(tag: &str) -> PathBuf {
    let root = std::env::temp_dir()
        .join("media-cache-proxy-tests")
        .join(format!("{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&root);
    root
}

/// Base config: ephemeral port, isolated cache root.
pub fn base_config(tag: &str) -> ProxyConfig {
    ProxyConfig::default()
        .port(0)
        .cache_root_path(cache_root(tag))
}
