//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind or fail at startup)
//!     → connection.rs (id + lifecycle tracking)
//!     → Hand off to HTTP layer
//! ```
//!
//! # Design Decisions
//! - No cap on concurrent inbound connections; each gets its own task
//! - Each connection tracked for graceful shutdown
//! - Inbound traffic is plain HTTP/1.1 on a local address

pub mod connection;
pub mod listener;

pub use connection::{ConnectionGuard, ConnectionId, ConnectionTracker};
pub use listener::{bind, ListenerError};
