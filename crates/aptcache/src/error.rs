//! Process-wide error hierarchy (spec.md §9, §7). Every fallible operation
//! in the proxy bottoms out in one of these variants so that a single
//! `status()` mapping decides what the client sees.

use http::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type returned by request-handling code.
#[derive(Debug, Error)]
pub enum AptCacheError {
    /// Configuration failed to load or was internally inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// The upstream mirror was unreachable, timed out, or reset the
    /// connection.
    #[error("upstream unreachable: {0}")]
    Upstream(#[source] aptcache_net::UpstreamError),

    /// The upstream mirror responded, but not with a status this proxy
    /// treats as success (anything other than 200/304/404 per §4.8).
    #[error("upstream returned {status}")]
    UpstreamStatus {
        /// Status line the upstream sent.
        status: StatusCode,
    },

    /// A filesystem operation on the cache store failed.
    #[error("storage error at {path}: {source}")]
    Storage {
        /// Path being operated on.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A downloaded file's checksum didn't match the one the upstream
    /// response advertised, or a referenced checksum was malformed.
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// Certificate minting for an intercepted connection failed.
    #[error("certificate minting failed: {0}")]
    TlsMint(#[source] aptcache_tls::TlsError),

    /// The write-lock retry budget (§4.4 Step 3) was exhausted.
    #[error("file is currently being downloaded")]
    LockContention,

    /// The requested path has no cache entry and no upstream mirror
    /// could be determined for it.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was rejected by policy (domain not allowlisted,
    /// CONNECT prevented, disallowed method).
    #[error("policy violation: {0}")]
    Policy(String),
}

impl AptCacheError {
    /// Maps this error to the HTTP status code a client should see.
    pub fn status(&self) -> StatusCode {
        match self {
            AptCacheError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AptCacheError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AptCacheError::UpstreamStatus { status } => *status,
            AptCacheError::Storage { source, .. } => {
                // ENOSPC has no std::io::ErrorKind variant; 28 is its errno
                // value on every platform this proxy targets.
                if source.raw_os_error() == Some(28) {
                    StatusCode::INSUFFICIENT_STORAGE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            }
            AptCacheError::Integrity(_) => StatusCode::BAD_GATEWAY,
            AptCacheError::TlsMint(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AptCacheError::LockContention => StatusCode::SERVICE_UNAVAILABLE,
            AptCacheError::NotFound(_) => StatusCode::NOT_FOUND,
            AptCacheError::Policy(_) => StatusCode::FORBIDDEN,
        }
    }
}
