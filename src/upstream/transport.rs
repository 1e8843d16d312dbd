//! Upstream transport: the pooled HTTPS client.
//!
//! # Responsibilities
//! - Offer `h2` and `http/1.1` over ALPN on every new connection
//! - Share one HTTP/2 connection between all concurrent exchanges
//! - Reuse HTTP/1.1 connections only when idle
//! - Map client failures to typed [`ForwardError`]s
//!
//! # Design Decisions
//! - Pool bookkeeping is left to `hyper-util`: checkout, insertion and
//!   eviction happen under its lock, and a connection whose task has ended is
//!   never handed out again
//! - HTTP/2 keep-alive pings find dead idle connections before a request does
//! - Hop-by-hop headers are dropped here, right before the request crosses
//!   onto the upstream protocol

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use hyper::body::Incoming;
use hyper_rustls::{ConfigBuilderExt, HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::config::ProxyConfig;
use crate::http::headers::{strip_hop_by_hop, Direction};
use crate::upstream::connection::{ConnectTimeout, StatsSnapshot, UpstreamConnector, UpstreamStats};

/// Client type for the single upstream.
pub type UpstreamClient = Client<UpstreamConnector<HttpsConnector<HttpConnector>>, Body>;

/// Error building the transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("cannot build TLS client configuration: {0}")]
    Tls(#[from] rustls::Error),
}

/// Why a single forwarding attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    #[error("no response head within {0:?}")]
    ResponseTimeout(Duration),

    #[error("upstream connection closed: {0}")]
    Closed(String),

    #[error("upstream protocol error: {0}")]
    Protocol(String),
}

impl ForwardError {
    /// Short label for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ForwardError::Connect(_) => "connect",
            ForwardError::Tls(_) => "tls",
            ForwardError::ConnectTimeout(_) => "connect_timeout",
            ForwardError::ResponseTimeout(_) => "response_timeout",
            ForwardError::Closed(_) => "closed",
            ForwardError::Protocol(_) => "protocol",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ForwardError::ConnectTimeout(_) | ForwardError::ResponseTimeout(_)
        )
    }

    /// Classify a client error by walking its source chain.
    pub fn from_client_error(err: &hyper_util::client::legacy::Error) -> Self {
        let detail = describe(err);

        if let Some(timeout) = find_in_chain::<ConnectTimeout>(err) {
            return ForwardError::ConnectTimeout(timeout.0);
        }
        if find_in_chain::<rustls::Error>(err).is_some() {
            return ForwardError::Tls(detail);
        }
        if err.is_connect() {
            return ForwardError::Connect(detail);
        }

        let hyper_closed = find_in_chain::<hyper::Error>(err)
            .map(|e| e.is_canceled() || e.is_closed() || e.is_incomplete_message())
            .unwrap_or(false);
        let io_closed = find_in_chain::<io::Error>(err)
            .map(|e| {
                matches!(
                    e.kind(),
                    io::ErrorKind::BrokenPipe
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                )
            })
            .unwrap_or(false);

        if hyper_closed || io_closed {
            ForwardError::Closed(detail)
        } else {
            ForwardError::Protocol(detail)
        }
    }
}

/// Find the first error of type `T` in a source chain, looking inside `io::Error` wrappers.
///
/// `io::Error::source` skips the error it wraps, so wrapped errors are
/// searched separately, together with their own chains.
fn find_in_chain<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        if let Some(inner) = e.downcast_ref::<io::Error>().and_then(|io| io.get_ref()) {
            if let Some(found) = find_in_chain::<T>(inner) {
                return Some(found);
            }
        }
        current = e.source();
    }
    None
}

/// Flatten an error chain into one line.
fn describe(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        let text = e.to_string();
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        current = e.source();
    }
    out
}

/// TLS settings for production: ring provider, webpki roots, ALPN set by the connector.
pub fn default_tls_config() -> Result<rustls::ClientConfig, rustls::Error> {
    Ok(
        rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_webpki_roots()
        .with_no_client_auth(),
    )
}

/// Owns the upstream connection pool.
#[derive(Clone)]
pub struct Transport {
    client: UpstreamClient,
    response_timeout: Duration,
    stats: Arc<UpstreamStats>,
}

impl Transport {
    /// Build the transport with the default trust roots.
    pub fn new(config: &ProxyConfig) -> Result<Self, TransportError> {
        Ok(Self::with_tls_config(config, default_tls_config()?))
    }

    /// Build the transport with caller-supplied TLS settings.
    pub fn with_tls_config(config: &ProxyConfig, tls: rustls::ClientConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);

        let https = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_only()
            .enable_http1()
            .enable_http2()
            .wrap_connector(http);

        let stats = Arc::new(UpstreamStats::default());
        let connector =
            UpstreamConnector::new(https, config.timeouts.connect(), Arc::clone(&stats));

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .timer(TokioTimer::new())
            .pool_timer(TokioTimer::new())
            .pool_idle_timeout(config.timeouts.idle())
            .pool_max_idle_per_host(config.pool.max_idle_per_host)
            .http2_keep_alive_interval(config.pool.keep_alive_interval())
            .http2_keep_alive_timeout(config.pool.keep_alive_timeout())
            .http2_keep_alive_while_idle(true);

        Self {
            client: builder.build(connector),
            response_timeout: config.timeouts.response(),
            stats,
        }
    }

    /// Send one rewritten request upstream and wait for the response head.
    pub async fn forward(&self, mut request: Request<Body>) -> Result<Response<Incoming>, ForwardError> {
        strip_hop_by_hop(request.headers_mut(), Direction::Request);

        match tokio::time::timeout(self.response_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(ForwardError::from_client_error(&err)),
            Err(_) => Err(ForwardError::ResponseTimeout(self.response_timeout)),
        }
    }

    pub fn stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
