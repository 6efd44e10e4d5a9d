//! Entry point of the `aptcache` daemon.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

mod admin;
mod body;
mod cache_serve;
mod dispatch;
mod error;
mod guarded_stream;
mod intercept;
mod refresh;
mod server;
mod service;
mod tunnel;
mod verify_sweep;

use server::Server;
use service::SchemeHint;

/// Cached object metadata flush interval (spec.md §4.5 "periodically
/// flushed, not every write").
const METADATA_FLUSH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// How often the interception CRL is regenerated, independent of the TLS
/// leaf cache's own 5-minute GC (spec.md §4.9 `generate_crl`).
const CRL_REGEN_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60 * 60);

/// Identifies this proxy to upstream servers via `X-Proxy-Server`.
const PROXY_SERVER_HEADER: &str = "aptcache";

/// Command line options for the `aptcache` daemon.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Opt {
    /// Path to the YAML configuration file. Built-in defaults are used if
    /// omitted.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Log verbose (DEBUG instead of INFO).
    #[clap(short, long)]
    verbose: bool,

    /// Run one Repository Verifier sweep (spec.md §4.12) against the cache
    /// and exit, instead of starting the proxy.
    #[clap(long)]
    verify: bool,
}

fn main() -> anyhow::Result<()> {
    let num_cores = std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(2)
        .max(2);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cores / 2)
        .max_blocking_threads(num_cores)
        .enable_all()
        .build()
        .context("failed to build the tokio runtime")?;

    runtime.block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    let default_filter = if opt.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .context("invalid RUST_LOG directive")?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    let config = aptcache_config::Config::load(opt.config.as_deref())
        .context("failed to load configuration")?;

    let cache_dir = config.cache_dir();
    let cache = aptcache_cache::Cache::open(&cache_dir)
        .await
        .with_context(|| format!("failed to open cache directory {}", cache_dir.display()))?;
    if opt.verify {
        let root = cache.root().to_path_buf();
        let mismatches = tokio::task::spawn_blocking(move || aptcache_verify::verify_cache(&root))
            .await
            .context("repository verifier task panicked")?
            .context("repository verification failed")?;
        let now = chrono::Utc::now();
        let mut marked = 0;
        for (key, _entry) in cache.metadata().snapshot() {
            if mismatches.contains(&cache.local_path(&key)) {
                cache.metadata().mark_for_deletion(&key, now);
                marked += 1;
            }
        }
        cache.metadata().flush().await.ok();
        tracing::info!(count = marked, "one-shot repository verification complete");
        return Ok(());
    }

    match cache.cleanup_orphaned_partials().await {
        Ok(removed) if removed > 0 => {
            tracing::info!(count = removed, "removed orphaned .partial files from a prior crash");
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(%err, "failed to clean up orphaned .partial files"),
    }
    cache.spawn_flusher(METADATA_FLUSH_INTERVAL);
    cache.spawn_expiration_sweep(config.expiration.unused_days);

    let stats = Arc::new(aptcache_stats::StatsStore::load(&cache_dir).await);
    aptcache_stats::StatsStore::spawn_flusher(stats.clone());

    let upstream = aptcache_net::UpstreamClient::new(PROXY_SERVER_HEADER);

    let ca = if config.https.intercept {
        let cert_path = config
            .https
            .cert
            .as_deref()
            .context("https.intercept is enabled but https.cert is not set")?;
        let key_path = config
            .https
            .key
            .as_deref()
            .context("https.intercept is enabled but https.key is not set")?;
        let ca = Arc::new(
            aptcache_tls::CertificateAuthority::from_files(
                cert_path,
                key_path,
                config.https.password.as_deref(),
                None,
                format!("localhost:{}", config.listen_port_secure),
                None,
                None,
            )
            .context("failed to load the TLS interception CA")?,
        );
        ca.clone().spawn_gc();
        if config.https.enable_crl {
            spawn_crl_regeneration(ca.clone(), cache.root().join(admin::CRL_FILENAME));
        }
        Some(ca)
    } else {
        None
    };

    let server = Arc::new(Server {
        config,
        cache,
        stats,
        upstream,
        ca,
    });
    verify_sweep::spawn_periodic(server.clone());

    let plain_listener = tokio::net::TcpListener::bind(("0.0.0.0", server.config.listen_port))
        .await
        .with_context(|| format!("failed to bind port {}", server.config.listen_port))?;
    tracing::info!(port = server.config.listen_port, "listening for plain HTTP");

    let secure_listener = if server.config.https.intercept {
        let listener =
            tokio::net::TcpListener::bind(("0.0.0.0", server.config.listen_port_secure))
                .await
                .with_context(|| {
                    format!("failed to bind port {}", server.config.listen_port_secure)
                })?;
        tracing::info!(
            port = server.config.listen_port_secure,
            "listening for direct HTTPS with SNI-based certificate selection"
        );
        Some(listener)
    } else {
        None
    };

    let plain_task = tokio::spawn(accept_loop(server.clone(), plain_listener, SchemeHint::Http));
    let secure_task = secure_listener.map(|listener| {
        let ca = server
            .ca
            .clone()
            .expect("secure_listener is only bound when https.intercept (and thus ca) is set");
        tokio::spawn(secure_accept_loop(server.clone(), listener, ca))
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down on ctrl-c");
        }
        result = plain_task => {
            result.context("plain HTTP accept loop panicked")?;
        }
        result = async {
            match secure_task {
                Some(task) => task.await,
                None => std::future::pending().await,
            }
        } => {
            result.context("secure accept loop panicked")?;
        }
    }

    server.stats.flush().await.ok();
    Ok(())
}

/// Accepts connections on `listener` forever, spawning one hyper HTTP/1.1
/// connection per socket. Used for the plain listener, where CONNECT
/// requests are intercepted per-request by `intercept::handle_connect`.
async fn accept_loop(
    server: Arc<Server>,
    listener: tokio::net::TcpListener,
    scheme_hint: SchemeHint,
) {
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(%err, "failed to accept connection");
                continue;
            }
        };
        let server = server.clone();
        let io = hyper_util::rt::TokioIo::new(stream);
        let remote_addr = remote_addr.to_string();

        tokio::spawn(async move {
            let service = hyper::service::service_fn(move |req| {
                service::handle(server.clone(), req, remote_addr.clone(), scheme_hint)
            });
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .with_upgrades()
                .await
            {
                tracing::debug!(%err, "connection closed with an error");
            }
        });
    }
}

/// Accepts connections on `listen_port_secure` forever, terminating TLS
/// directly on each socket with the same SNI-based certificate resolver used
/// for intercepted CONNECT tunnels (spec.md §6, §4.9). Unlike `accept_loop`,
/// a client here speaks TLS from the first byte; there is no CONNECT
/// handshake to hijack.
async fn secure_accept_loop(
    server: Arc<Server>,
    listener: tokio::net::TcpListener,
    ca: Arc<aptcache_tls::CertificateAuthority>,
) {
    let tls_config = match intercept::build_server_config(ca) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            tracing::error!(%err, "failed to build the listen_port_secure TLS configuration");
            return;
        }
    };

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::warn!(%err, "failed to accept connection");
                continue;
            }
        };
        let server = server.clone();
        let tls_config = tls_config.clone();
        let remote_addr = remote_addr.to_string();

        tokio::spawn(async move {
            intercept::serve_tls(server, hyper_util::rt::TokioIo::new(stream), tls_config, remote_addr)
                .await;
        });
    }
}

fn spawn_crl_regeneration(
    ca: Arc<aptcache_tls::CertificateAuthority>,
    out_path: PathBuf,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let ca = ca.clone();
            let path = out_path.clone();
            let result =
                tokio::task::spawn_blocking(move || ca.generate_crl(&path)).await;
            match result {
                Ok(Ok(())) => tracing::debug!(path = %out_path.display(), "regenerated interception CRL"),
                Ok(Err(err)) => tracing::warn!(%err, "failed to regenerate interception CRL"),
                Err(err) => tracing::warn!(%err, "CRL regeneration task panicked"),
            }
            tokio::time::sleep(CRL_REGEN_INTERVAL).await;
        }
    })
}
