//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Build transport → Bind listener → Spawn server
//!
//! Shutdown (shutdown.rs):
//!     Stop requested → Stop accepting → Drain connections → Exit
//!
//! Signals (signals.rs):
//!     SIGINT  → logged and ignored (default)
//!     SIGTERM → graceful shutdown
//! ```

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use startup::{start, start_with_transport, RunningProxy, StartupError};
