//! Two-tier segment cache.
//!
//! The memory tier fronts the disk tier:
//! - `put` writes through to disk and keeps a copy in memory when it fits.
//! - memory eviction demotes: the evicted blob is written to disk unless a
//!   copy is already there.
//! - a memory miss that hits disk promotes: the blob is read back into memory
//!   and its disk LRU position refreshed.
//!
//! Both tiers are guarded by one mutex each; operations are short index
//! manipulations, and file writes happen outside the disk index lock.

mod disk;
mod memory;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

use crate::key::SegmentKey;

use disk::DiskCache;
use memory::MemoryCache;

/// One cached window of a remote resource.
#[derive(Clone, Debug)]
pub struct CachedSegment {
    /// The window's bytes.
    pub data: Bytes,
    /// Full resource length when known (`Content-Range` total), else 0.
    pub total_bytes: u64,
}

/// Two-tier (memory + disk) LRU byte cache keyed by [`SegmentKey`].
pub struct SegmentCache {
    memory: MemoryCache,
    disk: DiskCache,
    root: PathBuf,
}

impl SegmentCache {
    /// Open the cache under `root`, rebuilding the disk index from any
    /// existing `<root>/videos` tree.
    pub fn open(root: &Path, memory_budget: u64, disk_budget: u64) -> Self {
        Self {
            memory: MemoryCache::new(memory_budget),
            disk: DiskCache::open(root, disk_budget),
            root: root.to_path_buf(),
        }
    }

    /// Root directory the disk tier lives under.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one video's cached windows, if any exist on disk.
    pub fn video_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join("videos").join(fingerprint)
    }

    /// Fetch a window: memory first, then disk with promotion.
    pub fn get(&self, key: &SegmentKey) -> Option<CachedSegment> {
        let key_str = key.to_string();
        if let Some(seg) = self.memory.get(&key_str) {
            return Some(seg);
        }

        let data = self.disk.get(&key_str)?;
        let segment = CachedSegment {
            data,
            total_bytes: 0,
        };
        // Promote. Demoted victims are already on disk via write-through,
        // but a missing copy is restored here.
        let (evicted, _) = self.memory.put(&key_str, segment.clone());
        self.flush_demoted(evicted);
        Some(segment)
    }

    /// Insert a window, writing through to disk.
    ///
    /// A disk write failure demotes the caller to streaming-without-cache for
    /// that blob: the memory copy is still kept so the current playback session
    /// can reuse it, and the failure is reported.
    pub fn put(&self, key: &SegmentKey, segment: CachedSegment) -> std::io::Result<()> {
        let key_str = key.to_string();
        let disk_result = self.disk.put(key, &segment.data);

        let (evicted, _stored) = self.memory.put(&key_str, segment);
        self.flush_demoted(evicted);

        disk_result
    }

    /// On-disk path for a cached window, demoting a memory-only copy first.
    pub fn get_file(&self, key: &SegmentKey) -> Option<PathBuf> {
        let key_str = key.to_string();
        if let Some(path) = self.disk.get_path(&key_str) {
            return Some(path);
        }
        let seg = self.memory.get(&key_str)?;
        match self.disk.put(key, &seg.data) {
            Ok(()) => self.disk.get_path(&key_str),
            Err(e) => {
                debug!(key = %key_str, error = %e, "demote-on-get_file failed");
                None
            }
        }
    }

    /// Register an existing file as the cached blob for `key`.
    pub fn put_file(&self, key: &SegmentKey, source: &Path) -> std::io::Result<()> {
        self.disk.put_file(key, source)
    }

    /// True when the window is resident in either tier.
    pub fn contains(&self, key: &SegmentKey) -> bool {
        let key_str = key.to_string();
        self.memory.contains(&key_str) || self.disk.contains(&key_str)
    }

    /// Remove one window from both tiers.
    pub fn remove(&self, key: &SegmentKey) {
        let key_str = key.to_string();
        self.memory.remove(&key_str);
        self.disk.remove(&key_str);
    }

    /// Remove every window of one video from both tiers.
    pub fn remove_video(&self, fingerprint: &str) {
        self.memory.remove_prefix(fingerprint);
        self.disk.remove_prefix(fingerprint);
    }

    /// Consistent `key → file` snapshot of the disk tier.
    pub fn storage_map(&self) -> HashMap<String, PathBuf> {
        self.disk.storage_map()
    }

    /// Bytes cached for one video.
    ///
    /// Disk is a superset of memory under write-through, so the disk sum plus
    /// any memory-only leftovers (disk write failures) is the total.
    pub fn cached_bytes_for(&self, fingerprint: &str) -> u64 {
        let disk_bytes = self.disk.bytes_for(fingerprint);
        let prefix = format!("{fingerprint}/");
        let memory_only: u64 = self
            .memory
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(&prefix) && !self.disk.contains(k))
            .filter_map(|k| self.memory.get(&k).map(|s| s.data.len() as u64))
            .sum();
        disk_bytes + memory_only
    }

    pub fn memory_used_bytes(&self) -> u64 {
        self.memory.used_bytes()
    }

    pub fn disk_used_bytes(&self) -> u64 {
        self.disk.used_bytes()
    }

    /// Drop everything from both tiers and delete the on-disk tree.
    pub fn clear(&self) {
        self.memory.clear();
        self.disk.clear();
    }

    fn flush_demoted(&self, evicted: Vec<(String, CachedSegment)>) {
        for (key_str, seg) in evicted {
            if self.disk.contains(&key_str) {
                continue;
            }
            let Some((fingerprint, name)) = key_str.split_once('/') else {
                continue;
            };
            let Some((start, end)) = SegmentKey::range_from_file_name(name) else {
                continue;
            };
            let key = SegmentKey::new(fingerprint, start, end);
            if let Err(e) = self.disk.put(&key, &seg.data) {
                debug!(key = %key_str, error = %e, "demotion to disk failed");
            }
        }
    }
}
