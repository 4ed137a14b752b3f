//! Process-wide bookkeeping of pre-cache runs and cached videos.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::cache::SegmentCache;
use crate::pool::DownloadPool;

/// Snapshot of one video's cache state, merged from live task state and a
/// one-shot walk of the disk tier.
#[derive(Clone, Debug)]
pub struct CachedVideoInfo {
    /// Fingerprint addressing the video.
    pub key: String,
    /// Origin URL when a live task knows it; empty for disk-only entries.
    pub url: String,
    pub start: u64,
    pub end: Option<u64>,
    pub cached_bytes: u64,
    pub total_bytes: u64,
    /// On-disk directory holding the video's windows, when present.
    pub cache_dir: Option<PathBuf>,
}

/// Registry indexing active pre-cache keys and cached-video snapshots.
pub struct DownloadCacheRegistry {
    cache: Arc<SegmentCache>,
    pool: Arc<DownloadPool>,
    precaching: Mutex<HashSet<String>>,
}

impl DownloadCacheRegistry {
    pub fn new(cache: Arc<SegmentCache>, pool: Arc<DownloadPool>) -> Self {
        Self {
            cache,
            pool,
            precaching: Mutex::new(HashSet::new()),
        }
    }

    /// Claim a pre-cache slot for `fingerprint`.
    ///
    /// Returns false when a run for the same fingerprint is already active,
    /// which suppresses the duplicate.
    pub fn begin_precache(&self, fingerprint: &str) -> bool {
        self.lock_precaching().insert(fingerprint.to_string())
    }

    pub fn end_precache(&self, fingerprint: &str) {
        self.lock_precaching().remove(fingerprint);
    }

    pub fn is_precaching(&self, fingerprint: &str) -> bool {
        self.lock_precaching().contains(fingerprint)
    }

    /// Merge live task state with the disk tier into per-video snapshots.
    pub fn cached_videos(&self) -> Vec<CachedVideoInfo> {
        let mut by_key: HashMap<String, CachedVideoInfo> = HashMap::new();

        for task in self.pool.tasks_snapshot() {
            let entry = by_key
                .entry(task.fingerprint.clone())
                .or_insert_with(|| CachedVideoInfo {
                    key: task.fingerprint.clone(),
                    url: task.uri.to_string(),
                    start: task.start,
                    end: task.end,
                    cached_bytes: 0,
                    total_bytes: 0,
                    cache_dir: None,
                });
            entry.start = entry.start.min(task.start);
            entry.end = match (entry.end, task.end) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };
            entry.total_bytes = entry.total_bytes.max(task.total_bytes());
        }

        // One-shot disk walk: pick up videos with no live tasks and attach
        // directories to the ones that have both.
        for key in self.cache.storage_map().keys() {
            let Some((fingerprint, _)) = key.split_once('/') else {
                continue;
            };
            by_key
                .entry(fingerprint.to_string())
                .or_insert_with(|| CachedVideoInfo {
                    key: fingerprint.to_string(),
                    url: String::new(),
                    start: 0,
                    end: None,
                    cached_bytes: 0,
                    total_bytes: 0,
                    cache_dir: None,
                });
        }

        for info in by_key.values_mut() {
            info.cached_bytes = self.cache.cached_bytes_for(&info.key);
            let dir = self.cache.video_dir(&info.key);
            if dir.is_dir() {
                info.cache_dir = Some(dir);
            }
        }

        let mut out: Vec<CachedVideoInfo> = by_key.into_values().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    fn lock_precaching(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.precaching
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
