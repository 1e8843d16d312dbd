use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use h2_fanin_proxy::config::{load_config, ConfigError, LogFormat, ProxyConfig, DEFAULT_PORT};
use h2_fanin_proxy::lifecycle::{self, signals, StartupError};
use h2_fanin_proxy::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "h2-fanin-proxy", version)]
#[command(about = "Forward local HTTP/1.1 clients to one https upstream over shared HTTP/2 connections", long_about = None)]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Upstream host to connect to (host or host:port).
    #[arg(long)]
    server_host: Option<String>,

    /// Port to listen on for local clients.
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to listen on for local clients.
    #[arg(long)]
    listen_address: Option<IpAddr>,

    /// Log line format.
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Defaults, then the config file, then flags.
    fn into_config(self) -> Result<ProxyConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => ProxyConfig::default(),
        };

        if let Some(host) = self.server_host {
            config.upstream.host = host;
        }

        if self.port.is_some() || self.listen_address.is_some() {
            let current = config.listener.bind_address.parse::<SocketAddr>().ok();
            let ip = self
                .listen_address
                .or(current.map(|a| a.ip()))
                .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
            let port = self.port.or(current.map(|a| a.port())).unwrap_or(DEFAULT_PORT);
            config.listener.bind_address = SocketAddr::new(ip, port).to_string();
        }

        if let Some(format) = self.log_format {
            config.observability.log_format = format;
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("h2-fanin-proxy: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = logging::init(&config.observability) {
        eprintln!("h2-fanin-proxy: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(()) => {
            tracing::info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Fatal error");
            eprintln!("h2-fanin-proxy: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ProxyConfig) -> Result<(), StartupError> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "h2-fanin-proxy starting");

    let ignore_interrupt = config.lifecycle.ignore_interrupt;
    if ignore_interrupt {
        if let Err(e) = signals::ignore_interrupt() {
            tracing::warn!(error = %e, "Cannot install interrupt handler");
        }
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(e) = metrics::init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let proxy = lifecycle::start(config).await?;
    tracing::info!(address = %proxy.local_addr(), "Listening for local clients");

    signals::stop_requested(ignore_interrupt).await;

    proxy.shutdown();
    proxy.wait().await
}
