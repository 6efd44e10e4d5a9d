//! Top-level hyper service. The same handler serves both the plain-HTTP
//! listener and the TLS-wrapped connection produced by intercepting a
//! CONNECT (spec.md §9 — see DESIGN.md's Open Question entry for why no
//! separate response-writer trait is needed: `hyper::server::conn::http1`
//! serves any `AsyncRead + AsyncWrite`, so one `service_fn` covers both).

use crate::body::error_response;
use crate::dispatch::{self, HostClass, ADMIN_PREFIX};
use crate::error::AptCacheError;
use crate::server::Server;
use crate::{admin, cache_serve, intercept, tunnel};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::sync::Arc;

/// Which scheme to assume for a request whose URI arrives in origin-form
/// (just a path), i.e. every request except an absolute-form proxy GET.
#[derive(Clone, Copy)]
pub enum SchemeHint {
    /// The plain-HTTP listener; origin-form requests are assumed `http`.
    Http,
    /// Inside an intercepted CONNECT's TLS session; origin-form requests
    /// are `https` by construction.
    Https,
}

impl SchemeHint {
    fn as_str(self) -> &'static str {
        match self {
            SchemeHint::Http => "http",
            SchemeHint::Https => "https",
        }
    }
}

/// Handles one request on either listener.
pub async fn handle(
    server: Arc<Server>,
    req: Request<Incoming>,
    remote_addr: String,
    scheme_hint: SchemeHint,
) -> Result<Response<crate::body::RespBody>, Infallible> {
    if req.method() == Method::CONNECT {
        return Ok(intercept::handle_connect(server, req, remote_addr).await);
    }

    let path = req.uri().path().to_string();
    if let Some(rest) = path.strip_prefix(ADMIN_PREFIX) {
        return Ok(admin::handle(&server, rest, req.method()).await);
    }
    if path == "/robots.txt" {
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(crate::body::full(dispatch::ROBOTS_TXT_BODY))
            .expect("static response is well-formed"));
    }
    if path == "/" {
        return Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header(hyper::header::LOCATION, ADMIN_PREFIX)
            .body(crate::body::empty())
            .expect("static response is well-formed"));
    }
    if dispatch::is_well_known_path(&path) {
        return Ok(error_response(StatusCode::NOT_FOUND, "not found"));
    }

    let url = match resolve_target_url(&req, scheme_hint, &server.config) {
        Some(url) => url,
        None => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                "could not determine request host",
            ))
        }
    };

    let host = url.host_str().unwrap_or_default().to_string();
    match dispatch::classify_host(&host, &server.config) {
        HostClass::Unlisted => {
            let err = AptCacheError::Policy(format!("{host} is not in any configured domain list"));
            Ok(error_response(err.status(), err.to_string()))
        }
        HostClass::Passthrough => {
            let response = tunnel::passthrough_fetch(
                &server.upstream,
                &url,
                &req,
                &remote_addr,
                &server.stats,
            )
            .await;
            Ok(response)
        }
        HostClass::Cacheable => {
            if !matches!(*req.method(), Method::GET | Method::HEAD) {
                return Ok(error_response(
                    StatusCode::METHOD_NOT_ALLOWED,
                    "only GET and HEAD are cacheable",
                ));
            }
            let headers = req.headers().clone();
            Ok(cache_serve::serve(server, url, headers, remote_addr).await)
        }
    }
}

/// Rewrites the request's target into an absolute [`url::Url`], applying
/// the `overrides` host substitution and the `remap` path table (spec.md
/// §4.1). Returns `None` only if the request carries no host information
/// at all (no absolute URI and no `Host` header).
fn resolve_target_url(
    req: &Request<Incoming>,
    scheme_hint: SchemeHint,
    config: &aptcache_config::Config,
) -> Option<url::Url> {
    let uri = req.uri();

    let mut url = if uri.scheme().is_some() {
        url::Url::parse(&uri.to_string()).ok()?
    } else {
        let host = req
            .headers()
            .get(hyper::header::HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| uri.authority().map(|a| a.as_str()))?;
        url::Url::parse(&format!("{}://{}{}", scheme_hint.as_str(), host, uri)).ok()?
    };

    // An override value may carry a path prefix (e.g.
    // `mirror.example:8080/ubuntu`), so the host/port and prefix are split
    // apart before being applied to the parsed URL.
    if let Some(host) = url.host_str() {
        let path = url.path().to_string();
        if let Some(override_value) = dispatch::apply_host_override(host, &path, config) {
            let (authority, prefix) = match override_value.split_once('/') {
                Some((authority, prefix)) => (authority, Some(prefix)),
                None => (override_value.as_str(), None),
            };
            let (new_host, new_port) = match authority.split_once(':') {
                Some((host, port)) => (host, port.parse::<u16>().ok()),
                None => (authority, None),
            };
            let _ = url.set_host(Some(new_host));
            let _ = url.set_port(new_port);
            if let Some(prefix) = prefix {
                let joined = format!("/{}{}", prefix.trim_end_matches('/'), url.path());
                url.set_path(&joined);
            }
        }
    }

    let rewritten_path = dispatch::apply_remap(url.path(), config).to_string();
    url.set_path(&rewritten_path);

    Some(url)
}
