//! Process-wide mutable state, gathered behind a single value (spec.md §9
//! "process-wide mutable state" design note) rather than scattered globals.

use aptcache_cache::Cache;
use aptcache_config::Config;
use aptcache_net::UpstreamClient;
use aptcache_stats::StatsStore;
use aptcache_tls::CertificateAuthority;
use std::sync::Arc;

/// Everything a request handler needs: configuration, the cache engine, the
/// stats store, the upstream client, and (if HTTPS interception is
/// enabled) the TLS interception CA.
pub struct Server {
    /// Loaded configuration.
    pub config: Config,
    /// Storage Layout + Access Metadata Store + Lock Manager.
    pub cache: Cache,
    /// Per-day request/traffic counters.
    pub stats: Arc<StatsStore>,
    /// Client used for every upstream fetch.
    pub upstream: UpstreamClient,
    /// TLS interception CA, present only when `https.intercept` is set.
    pub ca: Option<Arc<CertificateAuthority>>,
}
