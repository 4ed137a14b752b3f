//! On-disk cache tier.
//!
//! Files live at `<root>/videos/<fingerprint>/<start>-<end-or-empty>`; the
//! filename encodes everything needed to rebuild the index, so there are no
//! sidecar metadata files.
//!
//! Last-access order is tracked in-process rather than via filesystem mtime
//! (mtime granularity and mount options make it unreliable). On cold start the
//! index is reconstructed by walking the tree, with access order equal to walk
//! order.
//!
//! The actual file write happens outside the index lock; the entry becomes
//! visible by index-replace once the bytes are on disk.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bytes::Bytes;
use lru::LruCache;
use tracing::{debug, trace};

use crate::key::SegmentKey;

pub(crate) struct DiskCache {
    videos_root: PathBuf,
    budget: u64,
    inner: Mutex<Inner>,
}

struct Inner {
    index: LruCache<String, DiskEntry>,
    used: u64,
}

#[derive(Clone)]
struct DiskEntry {
    path: PathBuf,
    len: u64,
}

impl DiskCache {
    /// Open the tier rooted at `<root>/videos`, rebuilding the index from an
    /// existing tree when present.
    pub fn open(root: &Path, budget: u64) -> Self {
        let videos_root = root.join("videos");
        let mut index = LruCache::unbounded();
        let mut used = 0u64;

        if let Ok(dirs) = fs::read_dir(&videos_root) {
            for dir in dirs.flatten() {
                let Ok(file_type) = dir.file_type() else {
                    continue;
                };
                if !file_type.is_dir() {
                    continue;
                }
                let Some(fingerprint) = dir.file_name().to_str().map(str::to_owned) else {
                    continue;
                };
                let Ok(files) = fs::read_dir(dir.path()) else {
                    continue;
                };
                for file in files.flatten() {
                    let Some(name) = file.file_name().to_str().map(str::to_owned) else {
                        continue;
                    };
                    if SegmentKey::range_from_file_name(&name).is_none() {
                        continue;
                    }
                    let Ok(meta) = file.metadata() else {
                        continue;
                    };
                    if !meta.is_file() {
                        continue;
                    }
                    used += meta.len();
                    index.put(
                        format!("{fingerprint}/{name}"),
                        DiskEntry {
                            path: file.path(),
                            len: meta.len(),
                        },
                    );
                }
            }
            debug!(
                entries = index.len(),
                bytes = used,
                root = %videos_root.display(),
                "disk tier index rebuilt"
            );
        }

        Self {
            videos_root,
            budget,
            inner: Mutex::new(Inner { index, used }),
        }
    }

    pub fn path_for(&self, key: &SegmentKey) -> PathBuf {
        self.videos_root.join(&key.fingerprint).join(key.file_name())
    }

    /// Read a cached blob, refreshing its LRU position.
    ///
    /// A file that vanished underneath the index is dropped from the index and
    /// reported as a miss.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let path = {
            let mut inner = self.lock();
            inner.index.get(key)?.path.clone()
        };

        match fs::read(&path) {
            Ok(data) => Some(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.forget(key);
                None
            }
            Err(e) => {
                debug!(key, error = %e, "disk tier read failed");
                None
            }
        }
    }

    /// Path of a cached blob, refreshing its LRU position.
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        let mut inner = self.lock();
        inner.index.get(key).map(|e| e.path.clone())
    }

    pub fn contains(&self, key: &str) -> bool {
        let inner = self.lock();
        inner.index.peek(key).is_some()
    }

    /// Persist a blob and evict LRU entries down to the byte budget.
    ///
    /// A blob larger than the whole budget is refused before touching the
    /// filesystem, so the byte bound holds unconditionally; callers degrade
    /// to streaming-without-cache.
    pub fn put(&self, key: &SegmentKey, data: &Bytes) -> io::Result<()> {
        if data.len() as u64 > self.budget {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "blob larger than the disk tier budget",
            ));
        }

        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write before taking the lock; the index-replace below is the commit.
        fs::write(&path, data)?;

        let mut inner = self.lock();
        let key_str = key.to_string();
        if let Some(old) = inner.index.pop(&key_str) {
            inner.used -= old.len;
        }
        inner.used += data.len() as u64;
        inner.index.put(
            key_str,
            DiskEntry {
                path,
                len: data.len() as u64,
            },
        );

        // The incoming blob fits the budget on its own, so this can never
        // need to empty the index past the entry just inserted.
        while inner.used > self.budget {
            let Some((victim_key, victim)) = inner.index.pop_lru() else {
                break;
            };
            inner.used -= victim.len;
            trace!(key = %victim_key, bytes = victim.len, "disk tier evict");
            Self::delete_entry(&victim.path);
        }

        Ok(())
    }

    /// Register an existing file under `key`, copying it into the layout.
    pub fn put_file(&self, key: &SegmentKey, source: &Path) -> io::Result<()> {
        let data = Bytes::from(fs::read(source)?);
        self.put(key, &data)
    }

    pub fn remove(&self, key: &str) {
        let entry = {
            let mut inner = self.lock();
            let removed = inner.index.pop(key);
            if let Some(e) = &removed {
                inner.used -= e.len;
            }
            removed
        };
        if let Some(entry) = entry {
            Self::delete_entry(&entry.path);
        }
    }

    /// Drop every blob stored under `fingerprint`.
    pub fn remove_prefix(&self, fingerprint: &str) {
        let prefix = format!("{fingerprint}/");
        let victims: Vec<(String, DiskEntry)> = {
            let mut inner = self.lock();
            let keys: Vec<String> = inner
                .index
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| {
                    let entry = inner.index.pop(&k)?;
                    inner.used -= entry.len;
                    Some((k, entry))
                })
                .collect()
        };
        for (_, entry) in victims {
            Self::delete_entry(&entry.path);
        }
        let _ = fs::remove_dir(self.videos_root.join(fingerprint));
    }

    /// Consistent snapshot of `key → path` for the registry.
    pub fn storage_map(&self) -> HashMap<String, PathBuf> {
        let inner = self.lock();
        inner
            .index
            .iter()
            .map(|(k, e)| (k.clone(), e.path.clone()))
            .collect()
    }

    /// Total on-disk bytes stored under `fingerprint`.
    pub fn bytes_for(&self, fingerprint: &str) -> u64 {
        let prefix = format!("{fingerprint}/");
        let inner = self.lock();
        inner
            .index
            .iter()
            .filter(|(k, _)| k.starts_with(&prefix))
            .map(|(_, e)| e.len)
            .sum()
    }

    pub fn used_bytes(&self) -> u64 {
        self.lock().used
    }

    pub fn clear(&self) {
        {
            let mut inner = self.lock();
            inner.index.clear();
            inner.used = 0;
        }
        let _ = fs::remove_dir_all(&self.videos_root);
    }

    fn forget(&self, key: &str) {
        let mut inner = self.lock();
        if let Some(e) = inner.index.pop(key) {
            inner.used -= e.len;
        }
    }

    fn delete_entry(path: &Path) {
        let _ = fs::remove_file(path);
        // Drop the fingerprint directory once its last file is gone.
        if let Some(parent) = path.parent() {
            let _ = fs::remove_dir(parent);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
