#![deny(missing_docs)]

//! Upstream HTTP client for aptcacher: bounded idle connections, a
//! response-header timeout, no upstream proxy, and conditional-GET header
//! plumbing (spec.md §2 "Upstream Client", §4.4, §4.8).

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest_middleware::ClientWithMiddleware;
use std::time::Duration;
use thiserror::Error;

/// Maximum idle connections kept open per upstream host.
pub const MAX_IDLE_PER_HOST: usize = 7;

/// Timeout waiting for upstream response headers (spec.md §5).
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Request headers never forwarded upstream or back to the client: either
/// they are hop-by-hop (RFC 7230 §6.1) or they carry cache-validator state
/// the proxy manages itself (spec.md §4.4 step 3b).
pub const STRIPPED_REQUEST_HEADERS: &[&str] = &[
    "if-modified-since",
    "if-none-match",
    "e-tag",
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers stripped before relaying upstream's response to the
/// client (spec.md §4.4 step 3d); hop-by-hop only, validators are kept.
pub const STRIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Errors building or issuing upstream requests.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The upstream host was unreachable, or the connection dropped before
    /// a response arrived (spec.md §7 `UpstreamUnreachable`).
    #[error("upstream unreachable: {0}")]
    Unreachable(#[from] reqwest_middleware::Error),

    /// The upstream server responded but not with 200 OK on a cache miss.
    #[error("upstream returned {0}")]
    NonOk(reqwest::StatusCode),
}

/// Thin wrapper around [`ClientWithMiddleware`] configured per spec.md §2:
/// bounded idle connections, a response-header timeout, and no upstream
/// proxy (the proxy must reach the real Internet, not another hop).
#[derive(Clone)]
pub struct UpstreamClient {
    client: ClientWithMiddleware,
    proxy_server_header: String,
}

impl UpstreamClient {
    /// Builds a client with no retry middleware — the spec forbids
    /// handler-level retries on a non-200 response (§7 "Propagation
    /// policy"), so the middleware stack here is intentionally empty. The
    /// hook exists so a transport-level retry (e.g. for connection resets)
    /// can be composed in later without touching call sites.
    pub fn new(proxy_server_header: impl Into<String>) -> Self {
        let inner = reqwest::Client::builder()
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .timeout(RESPONSE_HEADER_TIMEOUT)
            .no_proxy()
            .build()
            .expect("reqwest client config is valid");
        Self {
            client: reqwest_middleware::ClientBuilder::new(inner).build(),
            proxy_server_header: proxy_server_header.into(),
        }
    }

    /// Issues a GET request to `url`, copying `client_headers` except the
    /// stripped set, and adding `X-Forwarded-For` / `X-Proxy-Server`
    /// (spec.md §4.4 step 3b).
    pub async fn fetch(
        &self,
        url: &url::Url,
        client_headers: &HeaderMap,
        remote_addr: &str,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut request = self.client.get(url.clone());
        request = request.headers(forward_headers(client_headers));
        request = request
            .header("X-Forwarded-For", remote_addr)
            .header("X-Proxy-Server", &self.proxy_server_header);
        request.send().await.map_err(UpstreamError::from)
    }

    /// Issues a conditional GET for a refresh (spec.md §4.8): `If-None-
    /// Match`, `If-Modified-Since`, plus the proxy's own `X-SHA256` and
    /// `X-ACTION: refresh` headers.
    pub async fn conditional_fetch(
        &self,
        url: &url::Url,
        etag: Option<&str>,
        last_modified: Option<&str>,
        sha256: Option<&str>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let mut request = self.client.get(url.clone()).header("X-ACTION", "refresh");
        if let Some(etag) = etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = last_modified {
            request = request.header(reqwest::header::IF_MODIFIED_SINCE, last_modified);
        }
        if let Some(sha256) = sha256 {
            request = request.header("X-SHA256", sha256);
        }
        request.send().await.map_err(UpstreamError::from)
    }
}

/// Filters `headers` down to those safe to forward upstream.
pub fn forward_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if STRIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Filters `headers` down to those safe to relay back to the client.
pub fn relay_headers(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if STRIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }
    out
}

/// Builds a single extra header, used by call sites that only need one
/// addition and want to avoid constructing a whole [`HeaderMap`].
pub fn header(name: &'static str, value: impl AsRef<str>) -> Option<(HeaderName, HeaderValue)> {
    let name = HeaderName::from_static(name);
    let value = HeaderValue::from_str(value.as_ref()).ok()?;
    Some((name, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH};

    #[test]
    fn forward_headers_strips_conditional_and_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, HeaderValue::from_static("\"e1\""));
        headers.insert(IF_MODIFIED_SINCE, HeaderValue::from_static("yesterday"));
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("accept", HeaderValue::from_static("*/*"));

        let forwarded = forward_headers(&headers);
        assert!(!forwarded.contains_key(IF_NONE_MATCH));
        assert!(!forwarded.contains_key(IF_MODIFIED_SINCE));
        assert!(!forwarded.contains_key("connection"));
        assert!(forwarded.contains_key("accept"));
    }

    #[test]
    fn relay_headers_keeps_validators() {
        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::ETAG, HeaderValue::from_static("\"e1\""));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        let relayed = relay_headers(&headers);
        assert!(relayed.contains_key(reqwest::header::ETAG));
        assert!(!relayed.contains_key("transfer-encoding"));
    }
}
