//! Intercept-CONNECT (spec.md §4.3, §4.9): decides whether a CONNECT is
//! tunnelled opaquely or MITM-intercepted, and for the latter terminates
//! TLS with a leaf minted for the target's SNI, then re-enters the same
//! request handler used by the plain listener.

use crate::body::RespBody;
use crate::dispatch::HostClass;
use crate::server::Server;
use crate::service::{self, SchemeHint};
use crate::tunnel;
use aptcache_tls::{CertificateAuthority, IssuedCertificate, TlsError};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long an intercepted TLS connection may stay open
/// (spec.md §5 "90s/120s intercepted-TLS timeouts" — this crate uses the
/// longer of the two as a single conservative ceiling).
const INTERCEPTED_CONNECTION_TIMEOUT: Duration = Duration::from_secs(120);

/// Handles a CONNECT request: rejects it outright under `https.prevent`,
/// rejects hosts outside every configured domain list, and otherwise either
/// tunnels or MITM-intercepts depending on `https.intercept`.
pub async fn handle_connect(
    server: Arc<Server>,
    req: Request<Incoming>,
    remote_addr: String,
) -> Response<RespBody> {
    let authority = match req.uri().authority() {
        Some(authority) => authority.to_string(),
        None => return tunnel::reject(StatusCode::BAD_REQUEST),
    };
    let host = authority.split(':').next().unwrap_or(&authority).to_string();

    if server.config.https.prevent {
        return tunnel::reject(StatusCode::FORBIDDEN);
    }
    let host_class = crate::dispatch::classify_host(&host, &server.config);
    if matches!(host_class, HostClass::Unlisted) {
        return tunnel::reject(StatusCode::FORBIDDEN);
    }

    // Passthrough domains are always tunnelled opaquely, never MITM'd,
    // regardless of `https.intercept` (spec.md §4.1 step 6).
    let intercept = !matches!(host_class, HostClass::Passthrough)
        && server.config.https.intercept
        && server.ca.is_some();
    let response = tunnel::connection_established();

    tokio::spawn(async move {
        let upgraded = match hyper::upgrade::on(req).await {
            Ok(upgraded) => upgraded,
            Err(err) => {
                tracing::warn!(%err, "failed to upgrade CONNECT request");
                return;
            }
        };

        if intercept {
            let ca = server.ca.clone().expect("checked above");
            run_intercepted(server, upgraded, host, ca).await;
        } else {
            tunnel::run_tunnel(upgraded, authority, server.stats.clone()).await;
        }
    });

    response
}

async fn run_intercepted(
    server: Arc<Server>,
    upgraded: hyper::upgrade::Upgraded,
    host: String,
    ca: Arc<CertificateAuthority>,
) {
    let tls_config = match build_server_config(ca) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            tracing::warn!(%host, %err, "failed to build TLS config for intercepted connection");
            return;
        }
    };
    serve_tls(server, TokioIo::new(upgraded), tls_config, host).await;
}

/// Terminates TLS on `io` with an SNI-selected leaf and re-enters the same
/// request handler used by the plain listener. Shared by the post-CONNECT
/// path above and `main.rs`'s direct `listen_port_secure` listener
/// (spec.md §6 "HTTPS on `listen_port_secure`... dynamic SNI-based
/// certificate selector").
pub(crate) async fn serve_tls<IO>(
    server: Arc<Server>,
    io: IO,
    tls_config: Arc<ServerConfig>,
    remote_addr: String,
) where
    IO: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);

    let tls_stream = match acceptor.accept(io).await {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!(%remote_addr, %err, "TLS handshake with client failed");
            return;
        }
    };

    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |req| {
        service::handle(server.clone(), req, remote_addr.clone(), SchemeHint::Https)
    });

    let serve = hyper::server::conn::http1::Builder::new().serve_connection(io, service);
    if let Err(err) = tokio::time::timeout(INTERCEPTED_CONNECTION_TIMEOUT, serve).await {
        tracing::debug!(%err, "intercepted connection timed out");
    }
}

pub(crate) fn build_server_config(ca: Arc<CertificateAuthority>) -> Result<ServerConfig, TlsError> {
    let resolver = Arc::new(SniCertResolver { ca });
    Ok(ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver))
}

/// Resolves the leaf certificate for an intercepted TLS handshake by
/// minting (or reusing a cached mint for) the client-offered SNI.
struct SniCertResolver {
    ca: Arc<CertificateAuthority>,
}

impl std::fmt::Debug for SniCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?;
        let issued: Arc<IssuedCertificate> = self.ca.get_certificate(sni).ok()?;
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&issued.private_key()).ok()?;
        Some(Arc::new(CertifiedKey::new(issued.chain_der.clone(), signing_key)))
    }
}
