//! Access Metadata Store: per-object sidecar records plus an in-memory
//! index with a dirty/revision flush discipline (spec.md §3, §4.6).

use crate::cache_key::{CacheKey, Protocol};
use crate::storage::{self, SIDECAR_SUFFIX};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Errors raised while reading or writing the metadata store.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Failure reading or writing a sidecar file.
    #[error("failed to access sidecar {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    /// A sidecar file did not parse as the expected JSON shape.
    #[error("failed to parse sidecar {0}: {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
}

/// On-disk sidecar record for one [`CacheKey`] (spec.md §3 `AccessEntry`).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AccessEntry {
    /// Absolute URL last seen for the object.
    #[serde(default)]
    pub url: String,
    /// Protocol the entry was last recorded under (`0` = http, `1` = https).
    #[serde(default)]
    pub protocol: u8,
    /// When the object was last served to a client.
    #[serde(default)]
    pub last_accessed: Option<DateTime<Utc>>,
    /// When the object was last revalidated against upstream.
    #[serde(default)]
    pub last_checked: Option<DateTime<Utc>>,
    /// The upstream `Last-Modified` timestamp, if any.
    #[serde(default)]
    pub remote_last_modified: Option<DateTime<Utc>>,
    /// The upstream `ETag`, if any.
    #[serde(default)]
    pub etag: Option<String>,
    /// Expected size of the local payload.
    #[serde(default)]
    pub size: u64,
    /// Hex SHA-256 digest of the local payload.
    #[serde(default)]
    pub sha256: Option<String>,
    /// Set once upstream has returned 404 for this object.
    #[serde(default)]
    pub marked_for_deletion: bool,
    /// When [`AccessEntry::marked_for_deletion`] was set.
    #[serde(default)]
    pub marked_for_deletion_at: Option<DateTime<Utc>>,
}

impl AccessEntry {
    /// A timestamp is "plausible" when it is not the zero value left behind
    /// by a missing upstream header (spec.md §4.4 step 2d/2e).
    pub fn is_plausible(ts: &DateTime<Utc>) -> bool {
        ts.year() > 2000
    }

    /// True if `remote_last_modified` is set and plausible.
    pub fn has_plausible_last_modified(&self) -> bool {
        self.remote_last_modified
            .as_ref()
            .is_some_and(Self::is_plausible)
    }
}

struct IndexedEntry {
    entry: AccessEntry,
    dirty: bool,
    revision: u64,
}

/// In-memory index over [`AccessEntry`] records, backed by sidecar files
/// under `cache_root`. Protected by a single read/write lock, as spec.md
/// §4.6/§5 require; writers bump a per-entry revision counter that the
/// flusher uses to detect a write racing a concurrent mutation.
pub struct MetadataStore {
    cache_root: PathBuf,
    index: RwLock<HashMap<CacheKey, IndexedEntry>>,
}

impl MetadataStore {
    /// Creates an empty store rooted at `cache_root`.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            cache_root: cache_root.into(),
            index: RwLock::new(HashMap::new()),
        }
    }

    /// Walks `cache_root` and loads every sidecar file found into the
    /// in-memory index (spec.md §4.6 "On startup, the cache directory is
    /// walked").
    pub fn load(cache_root: impl Into<PathBuf>) -> Self {
        let cache_root = cache_root.into();
        let store = Self::new(cache_root.clone());
        if !cache_root.exists() {
            return store;
        }
        for entry in walkdir::WalkDir::new(&cache_root)
            .into_iter()
            .filter_map(Result::ok)
        {
            let path = entry.path();
            if !storage::is_sidecar(path) {
                continue;
            }
            match Self::read_sidecar(path) {
                Ok(mut access_entry) => {
                    let Some(payload_path) = storage::payload_path_for_sidecar(path) else {
                        continue;
                    };
                    let protocol = Protocol::from_index(access_entry.protocol);
                    let Some(key) =
                        Self::key_from_payload_path(&cache_root, &payload_path, protocol)
                    else {
                        continue;
                    };
                    if access_entry.url.is_empty() {
                        access_entry.url = Self::derive_url(&key);
                        access_entry.protocol = key.protocol.as_index();
                    }
                    store.index.write().unwrap().insert(
                        key,
                        IndexedEntry {
                            entry: access_entry,
                            dirty: false,
                            revision: 0,
                        },
                    );
                }
                Err(err) => {
                    tracing::warn!(?path, %err, "skipping unreadable sidecar");
                }
            }
        }
        store
    }

    fn read_sidecar(path: &Path) -> Result<AccessEntry, MetadataError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| MetadataError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&contents).map_err(|e| MetadataError::Parse(path.to_path_buf(), e))
    }

    /// Reconstructs a [`CacheKey`] from a payload's location under
    /// `cache_root`: the first path component is the (already normalized)
    /// host, everything after is the URL path. `protocol` comes from the
    /// sidecar's own `protocol` field, not the file layout, since HTTP and
    /// HTTPS entries share the same on-disk path (spec.md §3, §4.6).
    fn key_from_payload_path(
        cache_root: &Path,
        payload_path: &Path,
        protocol: Protocol,
    ) -> Option<CacheKey> {
        let relative = payload_path.strip_prefix(cache_root).ok()?;
        let mut components = relative.components();
        let host = components.next()?.as_os_str().to_str()?.to_string();
        let rest: Vec<&str> = components
            .map(|c| c.as_os_str().to_str().unwrap_or_default())
            .collect();
        let path = if rest.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", rest.join("/"))
        };
        Some(CacheKey {
            protocol,
            host,
            path,
        })
    }

    fn derive_url(key: &CacheKey) -> String {
        format!("{}://{}{}", key.protocol.as_scheme(), key.host, key.path)
    }

    /// Returns a clone of the entry for `key`, if present.
    pub fn get(&self, key: &CacheKey) -> Option<AccessEntry> {
        self.index.read().unwrap().get(key).map(|i| i.entry.clone())
    }

    /// Inserts or replaces the entry for `key`, marking it dirty.
    pub fn upsert(&self, key: CacheKey, entry: AccessEntry) {
        let mut index = self.index.write().unwrap();
        let revision = index.get(&key).map_or(0, |i| i.revision) + 1;
        index.insert(
            key,
            IndexedEntry {
                entry,
                dirty: true,
                revision,
            },
        );
    }

    /// Updates `last_accessed` to `now` and ensures `url` is recorded
    /// (spec.md §4.4 step 2b). No-op if the key is absent.
    pub fn touch_access(&self, key: &CacheKey, now: DateTime<Utc>) {
        let mut index = self.index.write().unwrap();
        if let Some(indexed) = index.get_mut(key) {
            indexed.entry.last_accessed = Some(now);
            if indexed.entry.url.is_empty() {
                indexed.entry.url = Self::derive_url(key);
            }
            indexed.dirty = true;
            indexed.revision += 1;
        }
    }

    /// Marks the entry for `key` for deletion (spec.md §4.8, upstream 404).
    pub fn mark_for_deletion(&self, key: &CacheKey, now: DateTime<Utc>) {
        let mut index = self.index.write().unwrap();
        if let Some(indexed) = index.get_mut(key) {
            indexed.entry.marked_for_deletion = true;
            indexed.entry.marked_for_deletion_at = Some(now);
            indexed.dirty = true;
            indexed.revision += 1;
        }
    }

    /// Removes the entry for `key` entirely (spec.md §3 lifecycle: destroyed
    /// when the payload is deleted).
    pub fn remove(&self, key: &CacheKey) {
        self.index.write().unwrap().remove(key);
    }

    /// Returns every `(key, entry)` pair currently indexed. Used by the
    /// expiration sweep and `cache_usage`.
    pub fn snapshot(&self) -> Vec<(CacheKey, AccessEntry)> {
        self.index
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.entry.clone()))
            .collect()
    }

    /// Flushes every dirty entry to its sidecar file, via temp-file-and-
    /// rename. An entry's dirty flag is cleared only if its revision did not
    /// advance while the write was in flight (spec.md §4.6).
    pub async fn flush(&self) -> std::io::Result<usize> {
        let dirty: Vec<(CacheKey, AccessEntry, u64)> = {
            let index = self.index.read().unwrap();
            index
                .iter()
                .filter(|(_, v)| v.dirty)
                .map(|(k, v)| (k.clone(), v.entry.clone(), v.revision))
                .collect()
        };

        let mut flushed = 0;
        for (key, entry, revision) in dirty {
            let payload_path = crate::storage::local_path(&self.cache_root, &key);
            let sidecar = storage::sidecar_path(&payload_path);
            if let Some(parent) = sidecar.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let json = serde_json::to_vec_pretty(&entry).expect("AccessEntry is serializable");
            write_atomic(&sidecar, &json).await?;

            let mut index = self.index.write().unwrap();
            if let Some(indexed) = index.get_mut(&key) {
                if indexed.revision == revision {
                    indexed.dirty = false;
                }
            }
            flushed += 1;
        }
        Ok(flushed)
    }

    /// Spawns a background task that flushes dirty entries every `interval`.
    pub fn spawn_flusher(
        store: std::sync::Arc<Self>,
        interval: std::time::Duration,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match store.flush().await {
                    Ok(n) if n > 0 => tracing::debug!(count = n, "flushed metadata entries"),
                    Ok(_) => {}
                    Err(err) => tracing::error!(%err, "failed to flush metadata store"),
                }
            }
        })
    }
}

/// Writes `contents` to `path` via a temp file in the same directory
/// followed by an atomic rename, so readers never observe a partial write.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_name = format!(
        ".{}.{}{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("tmp"),
        uuid::Uuid::new_v4(),
        ".tmp"
    );
    let tmp_path = parent.join(tmp_name);
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await
}

/// Stable suffix re-exported for callers that need to filter directory
/// listings without depending on [`storage`] directly.
pub const fn sidecar_suffix() -> &'static str {
    SIDECAR_SUFFIX
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn plausible_rejects_zero_timestamps() {
        let zero = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert!(!AccessEntry::is_plausible(&zero));
        let recent = Utc::now();
        assert!(AccessEntry::is_plausible(&recent));
    }

    #[tokio::test]
    async fn upsert_and_flush_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = MetadataStore::new(dir.path());
        let key = CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: "/dists/stable/InRelease".to_string(),
        };
        let entry = AccessEntry {
            url: "http://repo.example/dists/stable/InRelease".to_string(),
            size: 3,
            sha256: Some("abc".to_string()),
            ..Default::default()
        };
        store.upsert(key.clone(), entry.clone());
        assert_eq!(store.flush().await.unwrap(), 1);

        let reloaded = MetadataStore::load(dir.path());
        let loaded = reloaded.get(&key).unwrap();
        assert_eq!(loaded.sha256, entry.sha256);
        assert_eq!(loaded.size, 3);
    }

    #[tokio::test]
    async fn sidecar_missing_url_is_repaired_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let payload = dir.path().join("repo.example/dists/stable/InRelease");
        std::fs::create_dir_all(payload.parent().unwrap()).unwrap();
        std::fs::write(&payload, b"abc").unwrap();
        let sidecar = storage::sidecar_path(&payload);
        std::fs::write(&sidecar, br#"{"size":3}"#).unwrap();

        let store = MetadataStore::load(dir.path());
        let key = CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: "/dists/stable/InRelease".to_string(),
        };
        let entry = store.get(&key).expect("entry should be indexed");
        assert_eq!(entry.url, "http://repo.example/dists/stable/InRelease");
    }

    #[tokio::test]
    async fn flusher_task_flushes_dirty_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MetadataStore::new(dir.path()));
        let key = CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: "/Release".to_string(),
        };
        store.upsert(key.clone(), AccessEntry::default());
        let handle = MetadataStore::spawn_flusher(store.clone(), std::time::Duration::from_millis(10));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();
        let sidecar = storage::sidecar_path(&crate::storage::local_path(dir.path(), &key));
        assert!(sidecar.exists());
    }
}
