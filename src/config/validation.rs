//! Configuration validation.
//!
//! Serde handles the syntax; this module checks the values make sense.
//! All problems are collected so a bad file is fixed in one pass.

use std::net::SocketAddr;

use axum::http::uri::Authority;

use crate::config::schema::ProxyConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("listener.bind_address {0:?} is not a socket address")]
    BindAddress(String),

    #[error("upstream.host {0:?} is not a valid host[:port]")]
    UpstreamHost(String),

    #[error("timeouts.{0} must be greater than zero")]
    ZeroTimeout(&'static str),

    #[error("pool.http2_keep_alive_timeout_secs must be greater than zero when pings are enabled")]
    ZeroKeepAliveTimeout,

    #[error("observability.metrics_address {0:?} is not a socket address")]
    MetricsAddress(String),
}

/// Check an upstream host string is a bare authority: no scheme, path or userinfo.
pub fn validate_upstream_host(host: &str) -> Result<Authority, ValidationError> {
    let invalid = || ValidationError::UpstreamHost(host.to_string());
    if host.is_empty() || host.contains('/') || host.contains('@') {
        return Err(invalid());
    }
    host.parse::<Authority>().map_err(|_| invalid())
}

/// Validate a parsed configuration, returning every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::BindAddress(config.listener.bind_address.clone()));
    }

    if let Err(e) = validate_upstream_host(&config.upstream.host) {
        errors.push(e);
    }

    if config.timeouts.connect_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("connect_secs"));
    }
    if config.timeouts.response_secs == 0 {
        errors.push(ValidationError::ZeroTimeout("response_secs"));
    }

    if config.pool.keep_alive_interval().is_some() && config.pool.http2_keep_alive_timeout_secs == 0 {
        errors.push(ValidationError::ZeroKeepAliveTimeout);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::MetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn upstream_host_accepts_port() {
        let authority = validate_upstream_host("localhost:8443").unwrap();
        assert_eq!(authority.host(), "localhost");
        assert_eq!(authority.port_u16(), Some(8443));
    }

    #[test]
    fn upstream_host_rejects_urls() {
        for bad in ["", "https://example.com", "example.com/path", "user@example.com", "exa mple.com"] {
            assert!(validate_upstream_host(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn collects_every_error() {
        let mut config = ProxyConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.upstream.host = "https://example.com".into();
        config.timeouts.connect_secs = 0;
        config.timeouts.response_secs = 0;
        config.pool.http2_keep_alive_timeout_secs = 0;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![
                ValidationError::BindAddress("nowhere".into()),
                ValidationError::UpstreamHost("https://example.com".into()),
                ValidationError::ZeroTimeout("connect_secs"),
                ValidationError::ZeroTimeout("response_secs"),
                ValidationError::ZeroKeepAliveTimeout,
            ]
        );
    }

    #[test]
    fn metrics_address_only_checked_when_enabled() {
        let mut config = ProxyConfig::default();
        config.observability.metrics_address = "bogus".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        assert_eq!(
            validate_config(&config),
            Err(vec![ValidationError::MetricsAddress("bogus".into())])
        );
    }
}
