//! Tunnel (spec.md §4.2): opaque bidirectional forwarding for CONNECT
//! requests that aren't MITM-intercepted, plus passthrough GET forwarding
//! for `passthrough_domains` hosts that never touch the cache.

use crate::body::{empty, RespBody};
use aptcache_net::UpstreamClient;
use aptcache_stats::StatsStore;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;

/// How long the tunnel waits for a TCP connection to the CONNECT target
/// before giving up (spec.md §5 "5s CONNECT timeout").
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds the immediate `200 Connection Established` response hyper sends
/// before the CONNECT socket is hijacked.
pub fn connection_established() -> Response<RespBody> {
    Response::builder()
        .status(StatusCode::OK)
        .body(empty())
        .expect("static response is well-formed")
}

/// Rejects a CONNECT request outright (`https.prevent`, or a host not in
/// any configured domain list).
pub fn reject(status: StatusCode) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .body(empty())
        .expect("static response is well-formed")
}

/// Runs after the CONNECT response has been sent and the client socket is
/// upgraded: dials `target`, then copies bytes in both directions until
/// either side closes. A broken pipe mid-copy is expected client behavior,
/// not a server fault, so it's logged at INFO rather than ERROR (spec.md
/// §4.2 "Error as INFO, not ERROR").
pub async fn run_tunnel(upgraded: Upgraded, target: String, stats: Arc<StatsStore>) {
    let mut client_io = TokioIo::new(upgraded);

    let mut outbound = match tokio::time::timeout(
        CONNECT_TIMEOUT,
        tokio::net::TcpStream::connect(&target),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            tracing::warn!(%target, %err, "tunnel target unreachable");
            return;
        }
        Err(_) => {
            tracing::warn!(%target, "tunnel target connect timed out");
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client_io, &mut outbound).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            stats.track_tunnel_request(client_to_upstream + upstream_to_client);
        }
        Err(err) if is_broken_pipe(&err) => {
            tracing::info!(%target, %err, "tunnel closed");
        }
        Err(err) => {
            tracing::warn!(%target, %err, "tunnel copy failed");
        }
    }
}

fn is_broken_pipe(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}

/// Forwards a GET/HEAD request for a `passthrough_domains` host straight to
/// upstream and streams the response back without ever touching the cache
/// (spec.md §4.1 "passthrough").
pub async fn passthrough_fetch(
    upstream: &UpstreamClient,
    url: &url::Url,
    req: &Request<Incoming>,
    remote_addr: &str,
    stats: &StatsStore,
) -> Response<RespBody> {
    match upstream.fetch(url, req.headers(), remote_addr).await {
        Ok(response) => {
            let status = response.status();
            let headers = aptcache_net::relay_headers(response.headers());
            let content_length = response.content_length().unwrap_or(0);
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map(Frame::data).map_err(std::io::Error::other));
            stats.track_request(false, content_length);

            let mut builder = Response::builder().status(status);
            for (name, value) in headers.iter() {
                builder = builder.header(name, value);
            }
            builder
                .body(StreamBody::new(stream).boxed())
                .unwrap_or_else(|_| reject(StatusCode::BAD_GATEWAY))
        }
        Err(err) => {
            tracing::warn!(%url, %err, "passthrough fetch failed");
            reject(StatusCode::BAD_GATEWAY)
        }
    }
}
