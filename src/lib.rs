//! HTTP/1.1 to HTTP/2 fan-in forwarding proxy.
//!
//! Many short-lived local clients speak plain HTTP/1.1 to this proxy; every
//! request is forwarded over https to one configured upstream host, sharing a
//! small number of long-lived (ideally one multiplexed HTTP/2) upstream
//! connections.
//!
//! ```text
//!   local clients ──HTTP/1.1──▶ net::listener ──▶ http::server
//!                                                    │
//!                                          http::director (https + host)
//!                                                    │
//!                                          upstream::transport ──h2/TLS──▶ upstream
//!                                                    │
//!   local clients ◀──────────── http::relay ◀────────┘  (http::failure on error)
//! ```

// Core subsystems
pub mod config;
pub mod http;
pub mod net;
pub mod upstream;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;

pub use config::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::{RunningProxy, Shutdown, StartupError};
pub use upstream::Transport;
