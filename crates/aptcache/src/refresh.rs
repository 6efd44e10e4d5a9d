//! Refresh Pipeline (spec.md §4.8): revalidates a cached object against
//! upstream with a conditional GET, and cascades revalidation to connected
//! index siblings when an index file turns out to have changed.

use aptcache_cache::{metadata::AccessEntry, Cache, CacheKey};
use aptcache_net::UpstreamClient;
use chrono::Utc;

/// Outcome of a conditional-GET revalidation.
pub enum RefreshOutcome {
    /// Upstream returned 304; the cached copy is still good.
    Unchanged,
    /// Upstream returned 200 with a (possibly) new body. The caller is
    /// responsible for streaming and storing it.
    Changed(Box<reqwest::Response>),
    /// Upstream returned 404; the object should be evicted.
    Gone,
    /// The revalidation attempt itself failed (timeout, connection error,
    /// unexpected status); the stale copy should still be served.
    Error,
}

/// Issues the conditional GET and classifies the result (spec.md §4.8).
pub async fn check(
    upstream: &UpstreamClient,
    url: &url::Url,
    entry: &AccessEntry,
) -> RefreshOutcome {
    let last_modified = entry.remote_last_modified.map(|ts| ts.to_rfc2822());
    let response = upstream
        .conditional_fetch(
            url,
            entry.etag.as_deref(),
            last_modified.as_deref(),
            entry.sha256.as_deref(),
        )
        .await;

    match response {
        Ok(response) if response.status() == reqwest::StatusCode::NOT_MODIFIED => {
            RefreshOutcome::Unchanged
        }
        Ok(response) if response.status() == reqwest::StatusCode::NOT_FOUND => RefreshOutcome::Gone,
        Ok(response) if response.status().is_success() => {
            RefreshOutcome::Changed(Box::new(response))
        }
        Ok(response) => {
            tracing::warn!(%url, status = %response.status(), "refresh got an unexpected status");
            RefreshOutcome::Error
        }
        Err(err) => {
            tracing::warn!(%url, %err, "refresh request failed");
            RefreshOutcome::Error
        }
    }
}

/// Records that `key` was revalidated at `now` without changing its
/// payload (spec.md §4.8 "200 unchanged" / 304 case).
pub fn mark_rechecked(cache: &Cache, key: &CacheKey, now: chrono::DateTime<Utc>) {
    if let Some(mut entry) = cache.metadata().get(key) {
        entry.last_checked = Some(now);
        cache.metadata().upsert(key.clone(), entry);
    }
}

/// Marks `key` for deletion after an upstream 404 during revalidation
/// (spec.md §4.8 "404").
pub fn mark_gone(cache: &Cache, key: &CacheKey, now: chrono::DateTime<Utc>) {
    cache.metadata().mark_for_deletion(key, now);
}

/// Forces every connected sibling of an index file at `dir_key` to be
/// revalidated on its next access, by clearing `last_checked` (spec.md
/// §4.7 "Connected Files"). `base_name` is the file's own name within its
/// directory (e.g. `"InRelease"`).
pub fn cascade_connected_files(cache: &Cache, dir_key: &CacheKey, base_name: &str) {
    let dir_path = match dir_key.path.rsplit_once('/') {
        Some((dir, _)) => dir.to_string(),
        None => String::new(),
    };
    for sibling in aptcache_cache::freshness::connected_files(base_name) {
        let sibling_key = CacheKey {
            protocol: dir_key.protocol,
            host: dir_key.host.clone(),
            path: format!("{dir_path}/{sibling}"),
        };
        if let Some(mut entry) = cache.metadata().get(&sibling_key) {
            entry.last_checked = None;
            cache.metadata().upsert(sibling_key, entry);
        }
    }
}
