//! Cache-serve (spec.md §4.4): the core algorithm deciding whether a
//! request is answered from disk, revalidated, or fetched fresh.
//!
//! Steps 3a (the metadata race after acquiring a write lock) and the
//! refresh pipeline's "unchanged" case both want to re-run Step 2 from the
//! top rather than recurse, so this is written as a `loop { ... continue }`
//! instead of an async-recursive function (spec.md §4.4 "re-enter
//! Cache-serve from Step 1").

use crate::body::{error_response, RespBody};
use crate::error::AptCacheError;
use crate::guarded_stream::GuardedStream;
use crate::refresh::{self, RefreshOutcome};
use crate::server::Server;
use aptcache_cache::cache_key::Protocol;
use aptcache_cache::lock::WriteLockGuard;
use aptcache_cache::metadata::AccessEntry;
use aptcache_cache::CacheKey;
use aptcache_fetch::{download_tee, DownloadError, RealPlatform};
use chrono::Utc;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::HeaderMap;
use hyper::{Response, StatusCode};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::ReaderStream;

/// Maximum attempts to acquire the write lock before giving up with 503
/// (spec.md §4.4 step 3, §7 `LockContention`).
const WRITE_LOCK_ATTEMPTS: u32 = 25;
const WRITE_LOCK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Serves one cache-eligible GET/HEAD request end to end.
pub async fn serve(
    server: Arc<Server>,
    url: url::Url,
    client_headers: HeaderMap,
    remote_addr: String,
) -> Response<RespBody> {
    let mut x_cache_override: Option<&'static str> = None;

    loop {
        let key = CacheKey::from_url(&url);
        let now = Utc::now();
        let target = server.cache.local_path(&key);
        let entry = server.cache.metadata().get(&key);
        let on_disk = tokio::fs::metadata(&target).await.ok();

        match (entry, on_disk) {
            (Some(entry), Some(meta))
                if aptcache_cache::sizes_agree(&entry, meta.len()) && !entry.marked_for_deletion =>
            {
                if aptcache_cache::freshness::is_recheck_due(&key.path, entry.last_checked, now) {
                    match refresh::check(&server.upstream, &url, &entry).await {
                        RefreshOutcome::Unchanged => {
                            refresh::mark_rechecked(&server.cache, &key, now);
                            x_cache_override = Some("HIT");
                            continue;
                        }
                        RefreshOutcome::Changed(response) => {
                            return store_and_stream(&server, &key, &url, *response, None).await;
                        }
                        RefreshOutcome::Gone => {
                            refresh::mark_gone(&server.cache, &key, now);
                            return error_response(
                                StatusCode::NOT_FOUND,
                                "upstream removed this object",
                            );
                        }
                        RefreshOutcome::Error => {
                            // Stale copy is still the best we have; fall
                            // through and serve it.
                        }
                    }
                }

                server.cache.metadata().touch_access(&key, now);
                if let Some(not_modified) = conditional_not_modified(&entry, &client_headers) {
                    server.stats.track_request(true, 0);
                    return not_modified;
                }
                let guard = server.cache.locks().read_lock(&key);
                return match serve_from_disk(
                    &target,
                    &entry,
                    x_cache_override.unwrap_or("HIT"),
                    guard,
                )
                .await
                {
                    Ok((response, bytes)) => {
                        server.stats.track_request(true, bytes);
                        response
                    }
                    Err(_) => error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "failed to read cached file",
                    ),
                };
            }
            _ => {
                let write_guard = match acquire_write_lock(&server, &key).await {
                    Some(guard) => guard,
                    None => {
                        let err = AptCacheError::LockContention;
                        return error_response(err.status(), err.to_string());
                    }
                };

                // Step 3a: another writer may have finished while we were
                // waiting for the lock. Re-enter from the top if so.
                let raced_entry = server.cache.metadata().get(&key);
                let raced_meta = tokio::fs::metadata(&target).await.ok();
                if raced_meta.is_some() && raced_entry.is_some() {
                    drop(write_guard);
                    continue;
                }

                // The payload is on disk but has no metadata: a prior
                // process was killed after writing the file but before the
                // sidecar landed. Synthesize an entry from the file itself
                // rather than re-downloading it (spec.md §4.4 step 3a
                // "round-trip" path, §4.6 "repair rule").
                if let Some(meta) = raced_meta {
                    synthesize_roundtrip_entry(&server, &key, &url, &meta, now).await;
                    drop(write_guard);
                    x_cache_override = Some("ROUNDTRIP");
                    continue;
                }

                return fetch_and_store(
                    &server,
                    &key,
                    &url,
                    &client_headers,
                    &remote_addr,
                    write_guard,
                )
                .await;
            }
        }
    }
}

/// Returns a 304 response if the client's `If-Modified-Since` header
/// parses and is not strictly before `entry.remote_last_modified` (spec.md
/// §4.4 step 2e). Only consulted when the entry's timestamp is plausible.
fn conditional_not_modified(entry: &AccessEntry, client_headers: &HeaderMap) -> Option<Response<RespBody>> {
    if !entry.has_plausible_last_modified() {
        return None;
    }
    let remote_last_modified = entry.remote_last_modified?;
    let if_modified_since = client_headers
        .get(hyper::header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc))?;

    if remote_last_modified < if_modified_since {
        Some(
            Response::builder()
                .status(StatusCode::NOT_MODIFIED)
                .header("X-Cache", "HIT")
                .body(crate::body::empty())
                .expect("static response is well-formed"),
        )
    } else {
        None
    }
}

/// Reads a cache-hit file back to the client, holding `guard` (a read lock)
/// for the full duration of the stream via [`GuardedStream`] (spec.md §4.4
/// step 2f). Emits `Last-Modified`, `ETag`, and `X-SHA256` from `entry` when
/// plausible (spec.md §4.4 step 2d).
async fn serve_from_disk(
    path: &std::path::Path,
    entry: &AccessEntry,
    x_cache: &'static str,
    guard: aptcache_cache::lock::ReadLockGuard,
) -> std::io::Result<(Response<RespBody>, u64)> {
    let file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    let stream =
        GuardedStream::new(ReaderStream::new(file), guard).map(|r| r.map(Frame::data));
    let body = StreamBody::new(stream).boxed();
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("X-Cache", x_cache)
        .header(hyper::header::CONTENT_LENGTH, len);
    if entry.has_plausible_last_modified() {
        if let Some(last_modified) = entry.remote_last_modified {
            builder = builder.header(hyper::header::LAST_MODIFIED, last_modified.to_rfc2822());
        }
    }
    if let Some(etag) = &entry.etag {
        builder = builder.header(hyper::header::ETAG, etag);
    }
    if let Some(sha256) = &entry.sha256 {
        builder = builder.header("X-SHA256", sha256);
    }
    let response = builder
        .body(body)
        .expect("static response is well-formed");
    Ok((response, len))
}

/// Hashes an orphaned payload file and records a fresh [`AccessEntry`] for
/// it, so the next pass through [`serve`] finds it as a normal HIT instead
/// of fetching it again (spec.md §4.4 step 3a, `X-Cache: ROUNDTRIP`).
async fn synthesize_roundtrip_entry(
    server: &Server,
    key: &CacheKey,
    url: &url::Url,
    meta: &std::fs::Metadata,
    now: chrono::DateTime<Utc>,
) {
    let target = server.cache.local_path(key);
    let sha256 = match tokio::task::spawn_blocking(move || aptcache_digest::compute_file_digest(&target)).await {
        Ok(Ok(hash)) => Some(aptcache_digest::to_hex(&hash)),
        Ok(Err(err)) => {
            tracing::warn!(%url, %err, "failed to hash orphaned payload during round-trip repair");
            None
        }
        Err(err) => {
            tracing::warn!(%url, %err, "round-trip hashing task panicked");
            None
        }
    };
    let mtime = meta
        .modified()
        .ok()
        .map(chrono::DateTime::<Utc>::from);

    let entry = AccessEntry {
        url: url.to_string(),
        protocol: Protocol::from_scheme(url.scheme()).as_index(),
        last_accessed: Some(now),
        last_checked: Some(now),
        remote_last_modified: mtime,
        etag: None,
        size: meta.len(),
        sha256,
        marked_for_deletion: false,
        marked_for_deletion_at: None,
    };
    server.cache.metadata().upsert(key.clone(), entry);
}

async fn acquire_write_lock(server: &Server, key: &CacheKey) -> Option<WriteLockGuard> {
    for attempt in 0..WRITE_LOCK_ATTEMPTS {
        if let Some(guard) = server.cache.locks().try_exclusive_write(key) {
            return Some(guard);
        }
        if attempt + 1 == WRITE_LOCK_ATTEMPTS {
            break;
        }
        tokio::time::sleep(WRITE_LOCK_RETRY_DELAY).await;
    }
    None
}

async fn fetch_and_store(
    server: &Arc<Server>,
    key: &CacheKey,
    url: &url::Url,
    client_headers: &HeaderMap,
    remote_addr: &str,
    write_guard: WriteLockGuard,
) -> Response<RespBody> {
    let response = match server.upstream.fetch(url, client_headers, remote_addr).await {
        Ok(response) => response,
        Err(err) => {
            drop(write_guard);
            let err = AptCacheError::Upstream(err);
            tracing::warn!(%url, %err, "upstream fetch failed");
            return error_response(err.status(), err.to_string());
        }
    };

    if response.status() == StatusCode::NOT_FOUND {
        drop(write_guard);
        let err = AptCacheError::NotFound(url.to_string());
        return error_response(err.status(), err.to_string());
    }
    if !response.status().is_success() {
        let err = AptCacheError::UpstreamStatus {
            status: response.status(),
        };
        drop(write_guard);
        return error_response(err.status(), err.to_string());
    }

    store_and_stream(server, key, url, response, Some(write_guard)).await
}

/// Streams `response`'s body to the client while simultaneously writing it
/// to disk, then updates the Access Metadata Store once the transfer
/// completes (spec.md §4.4 steps 3d-3f, §4.8 "200 changed").
///
/// The response headers and status are returned to the caller immediately;
/// the actual transfer (and the metadata/stats update that follows it) runs
/// in a spawned task so the hyper response can start streaming without
/// waiting for the whole object to land on disk. `write_guard` is `None`
/// when called from the refresh pipeline, which doesn't hold a write lock
/// while revalidating (see DESIGN.md's Open Question entry on this).
async fn store_and_stream(
    server: &Arc<Server>,
    key: &CacheKey,
    url: &url::Url,
    response: reqwest::Response,
    write_guard: Option<WriteLockGuard>,
) -> Response<RespBody> {
    let relay_headers = aptcache_net::relay_headers(response.headers());
    let content_length = response.content_length();
    let etag = response
        .headers()
        .get(reqwest::header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let last_modified = response
        .headers()
        .get(reqwest::header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let target = server.cache.local_path(key);
    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let body_stream = ReaderStream::new(reader).map(|r| r.map(Frame::data));
    let response_body = StreamBody::new(body_stream).boxed();

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header("X-Cache", "MISS");
    for (name, value) in relay_headers.iter() {
        builder = builder.header(name, value);
    }
    let response_to_client = match builder.body(response_body) {
        Ok(response) => response,
        Err(_) => {
            return error_response(StatusCode::BAD_GATEWAY, "upstream sent invalid headers");
        }
    };

    let server = server.clone();
    let key = key.clone();
    let url = url.clone();
    tokio::spawn(async move {
        let byte_stream = response.bytes_stream();
        let outcome =
            download_tee(byte_stream, writer, &target, content_length, &RealPlatform).await;
        match outcome {
            Ok(outcome) => {
                let now = Utc::now();
                let entry = AccessEntry {
                    url: url.to_string(),
                    protocol: Protocol::from_scheme(url.scheme()).as_index(),
                    last_accessed: Some(now),
                    last_checked: Some(now),
                    remote_last_modified: last_modified,
                    etag,
                    size: outcome.bytes_written,
                    sha256: Some(aptcache_digest::to_hex(&outcome.sha256)),
                    marked_for_deletion: false,
                    marked_for_deletion_at: None,
                };
                server.cache.metadata().upsert(key.clone(), entry);
                server.stats.track_request(false, outcome.bytes_written);

                if let Some(base_name) = key.path.rsplit('/').next() {
                    refresh::cascade_connected_files(&server.cache, &key, base_name);
                }
            }
            Err(err) => log_download_error(&url, &err),
        }
        drop(write_guard);
    });

    response_to_client
}

fn log_download_error(url: &url::Url, err: &DownloadError) {
    match err {
        DownloadError::ClientDisconnected => {
            tracing::info!(%url, "client disconnected before the download completed");
        }
        other => {
            tracing::warn!(%url, error = %other, "download failed");
        }
    }
}
