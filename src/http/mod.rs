//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection from a local client
//!     → server.rs (accept loop, HTTP/1.1, Axum router)
//!     → director.rs (scheme/host rewrite)
//!     → upstream transport (pooled HTTP/2 or HTTP/1.1 over TLS)
//!     → relay.rs (head translation, streamed body)   ← failure.rs on error
//!     → Send to client
//! ```

pub mod director;
pub mod failure;
pub mod headers;
pub mod relay;
pub mod server;

pub use director::Director;
pub use failure::GatewayFailure;
pub use server::{HttpServer, ServerError};
