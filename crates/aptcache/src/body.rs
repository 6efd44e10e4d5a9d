//! Shared response-body plumbing. Every handler in this crate returns the
//! same boxed body type so the plain listener and the TLS-intercepted
//! listener can be served by one `service_fn` (spec.md §9 "interface-based
//! polymorphism on response writers" — see DESIGN.md's Open Question entry
//! for why a hand-rolled writer trait turned out to be unnecessary).

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::{Response, StatusCode};

/// The response body type used throughout this crate.
pub type RespBody = BoxBody<Bytes, std::io::Error>;

/// An empty body, for responses with no payload (CONNECT's `200`, CONNECT
/// rejections, redirects).
pub fn empty() -> RespBody {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// A body holding the full contents of `data` in memory, for small
/// responses (admin endpoints, error pages).
pub fn full(data: impl Into<Bytes>) -> RespBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Builds a plain-text error response.
pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response<RespBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full(message.into()))
        .expect("static response is well-formed")
}
