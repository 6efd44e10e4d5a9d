//! Repository Verifier sweep (spec.md §4.12): runs `aptcache_verify` against
//! the cache root and marks mismatching payloads for deletion, the same
//! policy already used for upstream 404s. The verifier itself never
//! mutates the cache; this is the "caller" spec.md §4.12 leaves that
//! decision to.

use crate::server::Server;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// How often the background sweep re-walks the cache root.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// Runs one verification pass, marking every mismatching entry's
/// `AccessEntry` for deletion. Returns the number of entries marked.
pub async fn run_once(server: &Server) -> usize {
    let root = server.cache.root().to_path_buf();
    let mismatches = match tokio::task::spawn_blocking(move || aptcache_verify::verify_cache(&root)).await {
        Ok(Ok(mismatches)) => mismatches,
        Ok(Err(err)) => {
            tracing::warn!(%err, "repository verifier sweep failed");
            return 0;
        }
        Err(err) => {
            tracing::warn!(%err, "repository verifier sweep task panicked");
            return 0;
        }
    };
    if mismatches.is_empty() {
        return 0;
    }

    let now = Utc::now();
    let mut marked = 0;
    for (key, _entry) in server.cache.metadata().snapshot() {
        if mismatches.contains(&server.cache.local_path(&key)) {
            server.cache.metadata().mark_for_deletion(&key, now);
            marked += 1;
        }
    }
    if marked > 0 {
        tracing::warn!(count = marked, "repository verifier found checksum mismatches");
    }
    marked
}

/// Spawns a background task that runs [`run_once`] every [`SWEEP_INTERVAL`]
/// (spec.md §4.12 "a periodic admin sweep").
pub fn spawn_periodic(server: Arc<Server>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;
            run_once(&server).await;
        }
    })
}
