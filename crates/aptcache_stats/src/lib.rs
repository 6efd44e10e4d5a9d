#![deny(missing_docs)]

//! Statistics Store: per-day request/traffic counters, flushed atomically to
//! `<cache>/.stats.json` every 30s (spec.md §4.10).

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

const SCHEMA_VERSION: u32 = 1;
const SIDECAR_NAME: &str = ".stats.json";

/// Counters for a single calendar day, keyed by a local-clock `YYYY-MM-DD`
/// string (spec.md §3 `StatsDay`).
#[derive(Debug, Default, Clone, Copy, Serialize, Deserialize)]
pub struct StatsDay {
    /// Total requests handled (cache-serve + tunnel).
    pub requests: u64,
    /// Requests served from cache without a conditional upstream hit.
    pub hits: u64,
    /// Requests that required an upstream fetch.
    pub misses: u64,
    /// CONNECT tunnel requests.
    pub tunnel: u64,
    /// Bytes sent to clients from the cache-serve path.
    pub traffic_down: u64,
    /// Bytes fetched from upstream on a miss.
    pub traffic_up: u64,
    /// Bytes relayed through CONNECT tunnels (both directions).
    pub tunnel_transfer: u64,
}

/// Aggregate totals across every tracked day, returned by [`StatsStore::snapshot`].
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StatsTotals {
    /// Sum of [`StatsDay::requests`] across all days.
    pub requests: u64,
    /// Sum of [`StatsDay::hits`].
    pub hits: u64,
    /// Sum of [`StatsDay::misses`].
    pub misses: u64,
    /// Sum of [`StatsDay::tunnel`].
    pub tunnel: u64,
    /// Sum of [`StatsDay::traffic_down`].
    pub traffic_down: u64,
    /// Sum of [`StatsDay::traffic_up`].
    pub traffic_up: u64,
    /// Sum of [`StatsDay::tunnel_transfer`].
    pub tunnel_transfer: u64,
}

/// One day's counters labeled with its date, as returned in a [`Snapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct DailyEntry {
    /// `YYYY-MM-DD`.
    pub date: String,
    /// That day's counters.
    #[serde(flatten)]
    pub stats: StatsDay,
}

/// Result of [`StatsStore::snapshot`]: totals, the most recent `limit_days`
/// days (newest first), and the oldest tracked day.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    /// Totals across every tracked day, not just the ones returned in `daily`.
    pub totals: StatsTotals,
    /// Most recent days first, truncated to the requested limit.
    pub daily: Vec<DailyEntry>,
    /// The earliest date with a tracked entry, if any.
    pub oldest_day: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SidecarFile {
    version: u32,
    daily: BTreeMap<String, StatsDay>,
}

/// Errors loading or flushing the stats sidecar.
#[derive(Debug, Error)]
pub enum StatsError {
    /// I/O error reading or writing `.stats.json`.
    #[error("stats I/O error at {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    /// The sidecar JSON couldn't be serialized.
    #[error("failed to serialize stats: {0}")]
    Serialize(#[source] serde_json::Error),
}

struct Inner {
    daily: BTreeMap<String, StatsDay>,
}

/// In-memory `date → StatsDay` map with a background flush task
/// (spec.md §4.10, §5 "Statistics map — single mutex").
pub struct StatsStore {
    path: PathBuf,
    inner: Mutex<Inner>,
    dirty: AtomicBool,
}

impl StatsStore {
    /// Loads `<cache_root>/.stats.json` if present, ignoring any day keys
    /// that don't parse as `YYYY-MM-DD` (spec.md §4.10 "load, ignore
    /// malformed dates").
    pub async fn load(cache_root: impl Into<PathBuf>) -> Self {
        let path = cache_root.into().join(SIDECAR_NAME);
        let daily = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<SidecarFile>(&bytes) {
                Ok(sidecar) => sidecar
                    .daily
                    .into_iter()
                    .filter(|(date, _)| NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok())
                    .collect(),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring malformed stats sidecar");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            inner: Mutex::new(Inner { daily }),
            dirty: AtomicBool::new(false),
        }
    }

    fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }

    /// Records a cache-serve request: a hit if served without a miss, a miss
    /// if an upstream fetch was required, and the bytes sent to the client.
    pub fn track_request(&self, hit: bool, transferred: u64) {
        let today = Self::today();
        let mut inner = self.inner.lock();
        let day = inner.daily.entry(today).or_default();
        day.requests += 1;
        if hit {
            day.hits += 1;
        } else {
            day.misses += 1;
            day.traffic_up += transferred;
        }
        day.traffic_down += transferred;
        drop(inner);
        self.dirty.store(true, Ordering::Release);
    }

    /// Records a CONNECT tunnel request and the bytes relayed through it.
    pub fn track_tunnel_request(&self, transferred: u64) {
        let today = Self::today();
        let mut inner = self.inner.lock();
        let day = inner.daily.entry(today).or_default();
        day.requests += 1;
        day.tunnel += 1;
        day.tunnel_transfer += transferred;
        drop(inner);
        self.dirty.store(true, Ordering::Release);
    }

    /// Builds a snapshot: totals over every tracked day, the most recent
    /// `limit_days` days newest-first, and the oldest tracked day.
    pub fn snapshot(&self, limit_days: usize) -> Snapshot {
        let inner = self.inner.lock();
        let mut totals = StatsTotals::default();
        for day in inner.daily.values() {
            totals.requests += day.requests;
            totals.hits += day.hits;
            totals.misses += day.misses;
            totals.tunnel += day.tunnel;
            totals.traffic_down += day.traffic_down;
            totals.traffic_up += day.traffic_up;
            totals.tunnel_transfer += day.tunnel_transfer;
        }
        let oldest_day = inner.daily.keys().next().cloned();
        let daily = inner
            .daily
            .iter()
            .rev()
            .take(limit_days)
            .map(|(date, stats)| DailyEntry {
                date: date.clone(),
                stats: *stats,
            })
            .collect();
        Snapshot {
            totals,
            daily,
            oldest_day,
        }
    }

    /// Flushes the counters to `.stats.json` if dirty, via temp-file-and-
    /// rename. No-op if nothing changed since the last flush.
    pub async fn flush(&self) -> Result<(), StatsError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let sidecar = {
            let inner = self.inner.lock();
            SidecarFile {
                version: SCHEMA_VERSION,
                daily: inner.daily.clone(),
            }
        };
        let bytes = serde_json::to_vec_pretty(&sidecar).map_err(StatsError::Serialize)?;
        let tmp_path = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StatsError::Io(parent.to_path_buf(), e))?;
        }
        tokio::fs::write(&tmp_path, &bytes)
            .await
            .map_err(|e| StatsError::Io(tmp_path.clone(), e))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| StatsError::Io(self.path.clone(), e))?;
        Ok(())
    }

    /// The path of the stats sidecar file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Spawns the periodic 30s flush task (spec.md §4.10).
    pub fn spawn_flusher(store: Arc<StatsStore>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                if let Err(e) = store.flush().await {
                    tracing::warn!(error = %e, "failed to flush stats sidecar");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn track_request_hit_updates_down_but_not_up() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::load(dir.path()).await;
        store.track_request(true, 1000);
        let snap = store.snapshot(7);
        assert_eq!(snap.totals.requests, 1);
        assert_eq!(snap.totals.hits, 1);
        assert_eq!(snap.totals.misses, 0);
        assert_eq!(snap.totals.traffic_down, 1000);
        assert_eq!(snap.totals.traffic_up, 0);
    }

    #[tokio::test]
    async fn track_request_miss_updates_both_directions() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::load(dir.path()).await;
        store.track_request(false, 2000);
        let snap = store.snapshot(7);
        assert_eq!(snap.totals.misses, 1);
        assert_eq!(snap.totals.traffic_down, 2000);
        assert_eq!(snap.totals.traffic_up, 2000);
    }

    #[tokio::test]
    async fn track_tunnel_request_counts_separately() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::load(dir.path()).await;
        store.track_tunnel_request(500);
        let snap = store.snapshot(7);
        assert_eq!(snap.totals.requests, 1);
        assert_eq!(snap.totals.tunnel, 1);
        assert_eq!(snap.totals.tunnel_transfer, 500);
        assert_eq!(snap.totals.hits, 0);
        assert_eq!(snap.totals.misses, 0);
    }

    #[tokio::test]
    async fn flush_then_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::load(dir.path()).await;
        store.track_request(true, 10);
        store.flush().await.unwrap();
        assert!(store.path().exists());

        let reloaded = StatsStore::load(dir.path()).await;
        let snap = reloaded.snapshot(7);
        assert_eq!(snap.totals.requests, 1);
        assert_eq!(snap.totals.hits, 1);
    }

    #[tokio::test]
    async fn flush_is_noop_when_not_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let store = StatsStore::load(dir.path()).await;
        store.flush().await.unwrap();
        assert!(!store.path().exists());
    }

    #[tokio::test]
    async fn malformed_sidecar_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(".stats.json"), b"not json")
            .await
            .unwrap();
        let store = StatsStore::load(dir.path()).await;
        let snap = store.snapshot(7);
        assert_eq!(snap.totals.requests, 0);
    }

    #[test]
    fn snapshot_orders_daily_newest_first() {
        let sidecar = SidecarFile {
            version: 1,
            daily: BTreeMap::from([
                ("2024-01-01".to_string(), StatsDay::default()),
                ("2024-01-03".to_string(), StatsDay::default()),
                ("2024-01-02".to_string(), StatsDay::default()),
            ]),
        };
        let store = StatsStore {
            path: PathBuf::from("/dev/null"),
            inner: Mutex::new(Inner { daily: sidecar.daily }),
            dirty: AtomicBool::new(false),
        };
        let snap = store.snapshot(2);
        assert_eq!(snap.daily.len(), 2);
        assert_eq!(snap.daily[0].date, "2024-01-03");
        assert_eq!(snap.daily[1].date, "2024-01-02");
        assert_eq!(snap.oldest_day.as_deref(), Some("2024-01-01"));
    }
}
