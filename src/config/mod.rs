//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! defaults
//!     → config file (TOML, optional)      loader.rs
//!     → command-line overrides            main.rs
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → passed by value into startup
//! ```
//!
//! # Design Decisions
//! - Config is immutable once the process starts; the upstream host is static
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    LifecycleConfig, ListenerConfig, LogFormat, ObservabilityConfig, PoolConfig, ProxyConfig,
    TimeoutConfig, UpstreamConfig, DEFAULT_PORT, DEFAULT_UPSTREAM_HOST,
};
pub use validation::{validate_config, ValidationError};
