#![deny(missing_docs)]

//! Filesystem cache engine for aptcacher: storage layout, access metadata,
//! lock manager, freshness engine and expiration sweep (spec.md §4.2-4.7,
//! §4.11).

pub mod cache_key;
pub mod freshness;
pub mod lock;
pub mod metadata;
pub mod storage;

pub use cache_key::{CacheKey, Protocol};
pub use lock::LockManager;
pub use metadata::{AccessEntry, MetadataStore};

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the top-level [`Cache`] handle.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An I/O error while touching the payload or sidecar file.
    #[error("cache I/O error at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
}

/// Ties together the Storage Layout, Access Metadata Store, and Lock
/// Manager behind a single handle, the way `main` wires a `Server` value in
/// spec.md §9's "process-wide mutable state" design note.
#[derive(Clone)]
pub struct Cache {
    root: PathBuf,
    metadata: Arc<MetadataStore>,
    locks: Arc<LockManager>,
}

impl Cache {
    /// Opens (or creates) a cache rooted at `root`, loading the existing
    /// metadata index from disk.
    pub async fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let metadata = Arc::new(MetadataStore::load(&root));
        Ok(Self {
            root,
            metadata,
            locks: LockManager::new(),
        })
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The access metadata index.
    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    /// The lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// The local payload path for `key` (spec.md §8 "Path containment").
    pub fn local_path(&self, key: &CacheKey) -> PathBuf {
        storage::local_path(&self.root, key)
    }

    /// Starts the periodic metadata flusher (spec.md §4.6).
    pub fn spawn_flusher(&self, interval: std::time::Duration) -> tokio::task::JoinHandle<()> {
        MetadataStore::spawn_flusher(self.metadata.clone(), interval)
    }

    /// Removes the payload and its metadata entry for `key`. The file
    /// removal is best-effort (a missing file is not an error); the
    /// metadata entry is always dropped (spec.md §4.11 `delete_file`).
    pub async fn delete_file(&self, key: &CacheKey) -> std::io::Result<()> {
        let path = self.local_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.metadata.remove(key);
        Ok(())
    }

    /// Removes any `*.partial` temp files left behind by a crash mid-
    /// download (spec.md §4.5). Returns the number removed.
    pub async fn cleanup_orphaned_partials(&self) -> std::io::Result<usize> {
        let root = self.root.clone();
        let removed = tokio::task::spawn_blocking(move || {
            let mut removed = 0usize;
            for entry in walkdir::WalkDir::new(&root)
                .into_iter()
                .filter_map(Result::ok)
            {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "partial")
                    && std::fs::remove_file(path).is_ok()
                {
                    removed += 1;
                }
            }
            removed
        })
        .await
        .unwrap_or(0);
        Ok(removed)
    }

    /// Runs the expiration sweep once: deletes every object whose
    /// `last_accessed` is strictly before `now - unused_days` (spec.md
    /// §4.11). Returns the number of objects deleted.
    pub async fn sweep_expired(&self, unused_days: u64) -> usize {
        if unused_days == 0 {
            return 0;
        }
        let cutoff = Utc::now() - chrono::Duration::days(unused_days as i64);
        let mut deleted = 0;
        for (key, entry) in self.metadata.snapshot() {
            if entry.last_accessed.is_some_and(|t| t < cutoff) {
                if self.delete_file(&key).await.is_ok() {
                    deleted += 1;
                }
            }
        }
        deleted
    }

    /// Spawns the background expiration sweep task described in spec.md
    /// §4.11: sleep 5s, then loop { sweep; sleep 12h }.
    pub fn spawn_expiration_sweep(&self, unused_days: u64) -> tokio::task::JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            if unused_days == 0 {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            loop {
                let deleted = cache.sweep_expired(unused_days).await;
                if deleted > 0 {
                    tracing::info!(count = deleted, "expired cache entries swept");
                }
                tokio::time::sleep(std::time::Duration::from_secs(12 * 60 * 60)).await;
            }
        })
    }

    /// Computes `(count, bytes)` over the metadata index, stat-ing each
    /// unique local path once (spec.md §4.10 `cache_usage`).
    pub async fn usage(&self) -> (usize, u64) {
        let entries = self.metadata.snapshot();
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            let mut count = 0;
            let mut bytes = 0u64;
            for (key, _) in entries {
                let path = storage::local_path(&root, &key);
                if let Ok(meta) = std::fs::metadata(&path) {
                    count += 1;
                    bytes += meta.len();
                }
            }
            (count, bytes)
        })
        .await
        .unwrap_or((0, 0))
    }
}

/// Checks invariant B from spec.md §3: if the payload exists on disk and the
/// entry's recorded size is non-zero, the on-disk size must match. Returns
/// `false` when the entry is stale and should be deleted.
pub fn sizes_agree(entry: &AccessEntry, on_disk_len: u64) -> bool {
    entry.size == 0 || entry.size == on_disk_len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_creates_root_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let cache = Cache::open(&root).await.unwrap();
        assert!(root.exists());
        assert_eq!(cache.root(), root);
    }

    #[tokio::test]
    async fn delete_file_removes_payload_and_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).await.unwrap();
        let key = CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: "/Release".to_string(),
        };
        let path = cache.local_path(&key);
        tokio::fs::create_dir_all(path.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&path, b"data").await.unwrap();
        cache.metadata.upsert(key.clone(), AccessEntry::default());

        cache.delete_file(&key).await.unwrap();
        assert!(!path.exists());
        assert!(cache.metadata.get(&key).is_none());
    }

    #[tokio::test]
    async fn delete_file_is_ok_when_payload_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).await.unwrap();
        let key = CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: "/missing".to_string(),
        };
        assert!(cache.delete_file(&key).await.is_ok());
    }

    #[tokio::test]
    async fn sweep_expired_deletes_stale_entries_only() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).await.unwrap();
        let old_key = CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: "/old".to_string(),
        };
        let fresh_key = CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: "/fresh".to_string(),
        };
        for key in [&old_key, &fresh_key] {
            let path = cache.local_path(key);
            tokio::fs::create_dir_all(path.parent().unwrap())
                .await
                .unwrap();
            tokio::fs::write(&path, b"x").await.unwrap();
        }
        cache.metadata.upsert(
            old_key.clone(),
            AccessEntry {
                last_accessed: Some(Utc::now() - chrono::Duration::days(40)),
                ..Default::default()
            },
        );
        cache.metadata.upsert(
            fresh_key.clone(),
            AccessEntry {
                last_accessed: Some(Utc::now()),
                ..Default::default()
            },
        );

        let deleted = cache.sweep_expired(30).await;
        assert_eq!(deleted, 1);
        assert!(cache.metadata.get(&old_key).is_none());
        assert!(cache.metadata.get(&fresh_key).is_some());
    }

    #[tokio::test]
    async fn cleanup_orphaned_partials_removes_them() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Cache::open(dir.path()).await.unwrap();
        let partial = cache.root().join("repo.example/file.deb.abcd.partial");
        tokio::fs::create_dir_all(partial.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&partial, b"junk").await.unwrap();
        cache.cleanup_orphaned_partials().await.unwrap();
        assert!(!partial.exists());
    }

    #[test]
    fn sizes_agree_treats_zero_as_unknown() {
        let entry = AccessEntry {
            size: 0,
            ..Default::default()
        };
        assert!(sizes_agree(&entry, 12345));
        let entry = AccessEntry {
            size: 10,
            ..Default::default()
        };
        assert!(sizes_agree(&entry, 10));
        assert!(!sizes_agree(&entry, 11));
    }
}
