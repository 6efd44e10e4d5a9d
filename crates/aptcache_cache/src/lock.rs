//! Lock Manager: exclusive write locks and shared read locks on
//! `(protocol, host, path)`, coordinating concurrent fetches and serves
//! (spec.md §3 Invariant C, §4.5).

use crate::cache_key::CacheKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

struct LockTables {
    write_locks: HashMap<CacheKey, Instant>,
    read_locks: HashMap<CacheKey, u32>,
}

/// Coordinates concurrent access to cache entries. A successful
/// [`LockManager::try_exclusive_write`] is serialised before any subsequent
/// [`LockManager::read_lock`] attempt on the same key within this process.
pub struct LockManager {
    tables: Mutex<LockTables>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    /// Creates an empty lock manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tables: Mutex::new(LockTables {
                write_locks: HashMap::new(),
                read_locks: HashMap::new(),
            }),
        })
    }

    /// Attempts to take the exclusive write lock for `key` without
    /// blocking. Succeeds iff no write lock and no read lock currently
    /// exists for `key`.
    pub fn try_exclusive_write(self: &Arc<Self>, key: &CacheKey) -> Option<WriteLockGuard> {
        let mut tables = self.tables.lock().unwrap();
        let has_writer = tables.write_locks.contains_key(key);
        let has_reader = tables.read_locks.get(key).copied().unwrap_or(0) > 0;
        if has_writer || has_reader {
            return None;
        }
        tables.write_locks.insert(key.clone(), Instant::now());
        Some(WriteLockGuard {
            manager: self.clone(),
            key: key.clone(),
        })
    }

    /// Takes a shared read lock on `key`. Multiple read locks may coexist;
    /// a read lock cannot be taken while a write lock is held — callers
    /// that need that guarantee should check [`LockManager::is_write_locked`]
    /// first, as Cache-serve's retry loop does.
    pub fn read_lock(self: &Arc<Self>, key: &CacheKey) -> ReadLockGuard {
        let mut tables = self.tables.lock().unwrap();
        *tables.read_locks.entry(key.clone()).or_insert(0) += 1;
        ReadLockGuard {
            manager: self.clone(),
            key: key.clone(),
        }
    }

    /// True if a write lock or at least one read lock is currently held for
    /// `key`.
    pub fn is_locked(&self, key: &CacheKey) -> bool {
        let tables = self.tables.lock().unwrap();
        tables.write_locks.contains_key(key) || tables.read_locks.get(key).copied().unwrap_or(0) > 0
    }

    fn release_write(&self, key: &CacheKey) {
        self.tables.lock().unwrap().write_locks.remove(key);
    }

    fn release_read(&self, key: &CacheKey) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(count) = tables.read_locks.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                tables.read_locks.remove(key);
            }
        }
    }
}

/// Releases the exclusive write lock for its key when dropped.
pub struct WriteLockGuard {
    manager: Arc<LockManager>,
    key: CacheKey,
}

impl Drop for WriteLockGuard {
    fn drop(&mut self) {
        self.manager.release_write(&self.key);
    }
}

/// Releases one shared read lock for its key when dropped.
pub struct ReadLockGuard {
    manager: Arc<LockManager>,
    key: CacheKey,
}

impl Drop for ReadLockGuard {
    fn drop(&mut self) {
        self.manager.release_read(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_key::Protocol;

    fn key(path: &str) -> CacheKey {
        CacheKey {
            protocol: Protocol::Http,
            host: "repo.example".to_string(),
            path: path.to_string(),
        }
    }

    #[test]
    fn exclusive_write_excludes_readers_and_writers() {
        let manager = LockManager::new();
        let k = key("/a");
        let guard = manager.try_exclusive_write(&k).expect("should acquire");
        assert!(manager.try_exclusive_write(&k).is_none());
        assert!(manager.is_locked(&k));
        drop(guard);
        assert!(!manager.is_locked(&k));
        let reacquired = manager.try_exclusive_write(&k);
        assert!(reacquired.is_some());
    }

    #[test]
    fn write_lock_blocked_by_existing_read_lock() {
        let manager = LockManager::new();
        let k = key("/b");
        let read_guard = manager.read_lock(&k);
        assert!(manager.try_exclusive_write(&k).is_none());
        drop(read_guard);
        assert!(manager.try_exclusive_write(&k).is_some());
    }

    #[test]
    fn read_locks_are_reentrant_and_counted() {
        let manager = LockManager::new();
        let k = key("/c");
        let g1 = manager.read_lock(&k);
        let g2 = manager.read_lock(&k);
        assert!(manager.is_locked(&k));
        drop(g1);
        assert!(manager.is_locked(&k));
        drop(g2);
        assert!(!manager.is_locked(&k));
    }

    #[test]
    fn different_keys_do_not_interfere() {
        let manager = LockManager::new();
        let a = key("/a");
        let b = key("/b");
        let _guard = manager.try_exclusive_write(&a).unwrap();
        assert!(manager.try_exclusive_write(&b).is_some());
    }
}
