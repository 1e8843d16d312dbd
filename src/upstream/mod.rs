//! Upstream transport subsystem.
//!
//! # Data Flow
//! ```text
//! rewritten request
//!     → transport.rs (strip per-hop headers, response deadline)
//!     → hyper-util pool (reuse h2 connection / idle h1 connection)
//!     → connection.rs (new connection: deadline, ALPN tag, counters)
//!     → TLS + TCP to the upstream host
//! ```
//!
//! # Design Decisions
//! - One logical pool, keyed by upstream authority inside the client
//! - ALPN offers `h2` first; an upstream without it gets HTTP/1.1 silently
//! - Failed connections leave the pool when their connection task ends

pub mod connection;
pub mod transport;

pub use connection::{Protocol, StatsSnapshot, UpstreamStats};
pub use transport::{default_tls_config, ForwardError, Transport, TransportError};
