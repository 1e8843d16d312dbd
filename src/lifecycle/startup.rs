//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate the final configuration
//! - Build the upstream transport
//! - Bind the listener and begin accepting traffic
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal and returned to `main`
//! - The listener binds last so traffic only arrives once forwarding is ready

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::config::{validate_config, ConfigError, ProxyConfig};
use crate::http::{HttpServer, ServerError};
use crate::lifecycle::Shutdown;
use crate::net::{self, ListenerError};
use crate::upstream::{Transport, TransportError, UpstreamStats};

/// Anything that stops the proxy from starting.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error("server task failed: {0}")]
    Serve(#[from] io::Error),
}

/// A proxy accepting connections in the background.
#[derive(Debug)]
pub struct RunningProxy {
    local_addr: SocketAddr,
    shutdown: Shutdown,
    stats: Arc<UpstreamStats>,
    handle: JoinHandle<io::Result<()>>,
}

impl RunningProxy {
    /// Address the listener actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Counters for the physical upstream connections.
    pub fn upstream_stats(&self) -> Arc<UpstreamStats> {
        Arc::clone(&self.stats)
    }

    /// Stop accepting and start draining.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }

    /// Wait for the server task to finish.
    pub async fn wait(self) -> Result<(), StartupError> {
        match self.handle.await {
            Ok(result) => Ok(result?),
            Err(join) => Err(StartupError::Serve(io::Error::new(io::ErrorKind::Other, join))),
        }
    }
}

/// Start the proxy with the production transport.
pub async fn start(config: ProxyConfig) -> Result<RunningProxy, StartupError> {
    validate_config(&config).map_err(ConfigError::Validation)?;
    let transport = Transport::new(&config)?;
    start_with_transport(config, transport).await
}

/// Start the proxy around an already-built transport.
pub async fn start_with_transport(
    config: ProxyConfig,
    transport: Transport,
) -> Result<RunningProxy, StartupError> {
    validate_config(&config).map_err(ConfigError::Validation)?;

    let server = HttpServer::with_transport(config, transport)?;
    let listener = net::bind(&server.config().listener).await?;
    let local_addr = listener.local_addr()?;

    let stats = server.upstream_stats();
    let shutdown = Shutdown::new();
    let handle = tokio::spawn(server.run(listener, shutdown.subscribe()));

    Ok(RunningProxy {
        local_addr,
        shutdown,
        stats,
        handle,
    })
}
