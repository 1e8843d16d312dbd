//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_requests_total` (counter): requests by response status
//! - `proxy_request_duration_seconds` (histogram): time to response head
//! - `proxy_gateway_failures_total` (counter): synthesized failures by kind
//! - `proxy_upstream_connections_opened_total` (counter): physical upstream connections by protocol
//! - `proxy_upstream_connections_active` (gauge): live upstream connections
//! - `proxy_inbound_connections_active` (gauge): live inbound connections
//!
//! Without an installed recorder every call here is a no-op.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start the Prometheus scrape listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(status: u16, start: Instant) {
    counter!("proxy_requests_total", "status" => status.to_string()).increment(1);
    histogram!("proxy_request_duration_seconds").record(start.elapsed().as_secs_f64());
}

pub fn record_gateway_failure(kind: &'static str) {
    counter!("proxy_gateway_failures_total", "kind" => kind).increment(1);
}

pub fn upstream_connection_opened(protocol: &'static str) {
    counter!("proxy_upstream_connections_opened_total", "protocol" => protocol).increment(1);
    gauge!("proxy_upstream_connections_active").increment(1.0);
}

pub fn upstream_connection_closed() {
    gauge!("proxy_upstream_connections_active").decrement(1.0);
}

pub fn inbound_connection_opened() {
    gauge!("proxy_inbound_connections_active").increment(1.0);
}

pub fn inbound_connection_closed() {
    gauge!("proxy_inbound_connections_active").decrement(1.0);
}
