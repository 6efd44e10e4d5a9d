//! Admin endpoints under `/_goaptcacher/` (spec.md §6): the interception
//! CA certificate, its revocation list, and a JSON stats snapshot.

use crate::body::{error_response, full, RespBody};
use crate::server::Server;
use hyper::{Method, Response, StatusCode};
use serde::Serialize;

/// Filename the periodic CRL regeneration task (see `main.rs`) writes under
/// the cache root; read back verbatim here.
pub const CRL_FILENAME: &str = "revocation.crl";

/// How many days of [`aptcache_stats::Snapshot::daily`] to return.
const STATS_DAYS: usize = 30;

/// Dispatches on the path tail after `/_goaptcacher/` has been stripped.
pub async fn handle(server: &Server, rest: &str, method: &Method) -> Response<RespBody> {
    if *method != Method::GET && *method != Method::HEAD {
        return error_response(StatusCode::METHOD_NOT_ALLOWED, "only GET/HEAD are supported here");
    }

    match rest {
        "goaptcacher.crt" => serve_ca_cert(server),
        "revocation.crl" => serve_crl(server).await,
        "stats" => serve_stats(server).await,
        _ => error_response(StatusCode::NOT_FOUND, "unknown admin endpoint"),
    }
}

/// Wraps [`aptcache_stats::Snapshot`] with the on-disk cache usage totals
/// (spec.md §4.10 `cache_usage`), which live in a different store.
#[derive(Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    snapshot: aptcache_stats::Snapshot,
    cached_objects: usize,
    cached_bytes: u64,
}

fn serve_ca_cert(server: &Server) -> Response<RespBody> {
    let Some(ca) = &server.ca else {
        return error_response(
            StatusCode::NOT_FOUND,
            "HTTPS interception is not configured on this cache",
        );
    };
    Response::builder()
        .status(StatusCode::OK)
        .header(hyper::header::CONTENT_TYPE, "application/x-x509-ca-cert")
        .body(full(ca.intermediate_cert_pem().to_string()))
        .expect("static response is well-formed")
}

async fn serve_crl(server: &Server) -> Response<RespBody> {
    if !server.config.https.enable_crl {
        return error_response(StatusCode::NOT_FOUND, "CRL publishing is disabled");
    }
    let path = server.cache.root().join(CRL_FILENAME);
    match tokio::fs::read(&path).await {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/pkix-crl")
            .body(full(bytes))
            .expect("static response is well-formed"),
        Err(_) => error_response(StatusCode::NOT_FOUND, "CRL has not been generated yet"),
    }
}

async fn serve_stats(server: &Server) -> Response<RespBody> {
    let snapshot = server.stats.snapshot(STATS_DAYS);
    let (cached_objects, cached_bytes) = server.cache.usage().await;
    let response = StatsResponse {
        snapshot,
        cached_objects,
        cached_bytes,
    };
    match serde_json::to_vec_pretty(&response) {
        Ok(bytes) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(full(bytes))
            .expect("static response is well-formed"),
        Err(_) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to serialize stats"),
    }
}
