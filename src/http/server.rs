//! HTTP server setup and the forwarding pipeline.
//!
//! # Responsibilities
//! - Accept inbound connections, one task each, never waiting on in-flight work
//! - Serve HTTP/1.1 on each connection with an Axum router
//! - Run every request through director → transport → relay
//! - Map forwarding failures to gateway responses
//! - Drain connections on shutdown
//!
//! # Cancellation
//! When a local client disconnects, hyper drops the connection's in-flight
//! request future and response body. That drops the upstream exchange, which
//! resets the HTTP/2 stream without closing the shared connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    response::{IntoResponse, Response},
    Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tower::Service;
use tower_http::trace::TraceLayer;

use crate::config::{ProxyConfig, ValidationError};
use crate::http::director::Director;
use crate::http::failure::GatewayFailure;
use crate::http::relay::relay;
use crate::net::{ConnectionGuard, ConnectionTracker};
use crate::observability::metrics;
use crate::upstream::{Transport, UpstreamStats};

/// Error building the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Upstream(#[from] ValidationError),
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub director: Arc<Director>,
    pub transport: Transport,
}

/// HTTP server for the forwarding proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
    tracker: ConnectionTracker,
    stats: Arc<UpstreamStats>,
}

impl HttpServer {
    /// Create a server around an already-built transport.
    pub fn with_transport(config: ProxyConfig, transport: Transport) -> Result<Self, ServerError> {
        let director = Arc::new(Director::new(&config.upstream.host)?);
        let stats = transport.stats();

        tracing::info!(
            upstream = %director.authority(),
            connect_timeout_secs = config.timeouts.connect_secs,
            response_timeout_secs = config.timeouts.response_secs,
            "Forwarding to upstream over https"
        );

        let state = AppState {
            director,
            transport,
        };

        Ok(Self {
            router: Self::build_router(state),
            config,
            tracker: ConnectionTracker::new(),
            stats,
        })
    }

    /// Build the Axum router: every method and path goes to the forwarder.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(forward_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Counters for the physical upstream connections.
    pub fn upstream_stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let (drain_tx, drain_rx) = watch::channel(false);

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let guard = self.tracker.track();
                        tracing::debug!(
                            connection_id = %guard.id(),
                            peer_addr = %peer,
                            "Connection accepted"
                        );
                        tokio::spawn(serve_connection(
                            self.router.clone(),
                            stream,
                            peer,
                            guard,
                            drain_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off briefly instead of spinning.
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    }
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        let _ = drain_tx.send(true);

        let grace = self.config.lifecycle.shutdown_grace();
        let active = self.tracker.active_count();
        if active > 0 {
            tracing::info!(active_connections = active, "Draining connections");
        }
        if !self.tracker.wait_for_drain(grace).await {
            tracing::warn!(
                active_connections = self.tracker.active_count(),
                "Drain deadline passed, abandoning connections"
            );
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Serve one inbound connection to completion.
async fn serve_connection(
    router: Router,
    stream: TcpStream,
    peer: SocketAddr,
    guard: ConnectionGuard,
    mut draining: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);

    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(peer));
        router.clone().call(request)
    });

    let mut builder = http1::Builder::new();
    builder.timer(TokioTimer::new()).keep_alive(true);
    let conn = builder.serve_connection(TokioIo::new(stream), service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        // The watch guard must not live across the drain below.
        _ = async { let _ = draining.wait_for(|draining| *draining).await; } => {
            conn.as_mut().graceful_shutdown();
            conn.as_mut().await
        }
    };

    if let Err(err) = result {
        if is_client_gone(&err) {
            tracing::debug!(connection_id = %guard.id(), error = %err, "Client went away");
        } else {
            tracing::info!(connection_id = %guard.id(), error = %err, "Inbound connection ended with error");
        }
    }
}

/// True when the error only says the local client stopped listening.
fn is_client_gone(err: &hyper::Error) -> bool {
    if err.is_incomplete_message() || err.is_canceled() || err.is_closed() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            return matches!(
                io.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            );
        }
        source = e.source();
    }
    false
}

/// Forward one request upstream and relay whatever comes back.
async fn forward_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let outbound = state.director.rewrite(request);

    let response = match state.transport.forward(outbound).await {
        Ok(upstream) => {
            tracing::debug!(
                peer_addr = %peer,
                method = %method,
                path = %path,
                status = upstream.status().as_u16(),
                version = ?upstream.version(),
                "Upstream responded"
            );
            relay(upstream)
        }
        Err(err) => {
            tracing::warn!(
                peer_addr = %peer,
                method = %method,
                path = %path,
                kind = err.kind(),
                error = %err,
                "Upstream request failed"
            );
            metrics::record_gateway_failure(err.kind());
            relay(GatewayFailure::from(&err).into_response())
        }
    };

    metrics::record_request(response.status().as_u16(), start);
    response
}
