//! Metrics collection and exposition.
//!
//! # Metrics
//! - `shard_pool_builds_total` (counter): active pools built, by identity
//! - `shard_pool_active_nodes` (gauge): nodes in the latest pool, by identity
//! - `shard_pool_reloads_total` (counter): change notifications, by outcome
//! - `shard_pool_teardown_failures_total` (counter): node pools that failed to close
//!
//! Without an installed recorder every call is a no-op.

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_pool_built(identity: &str, nodes: usize) {
    counter!("shard_pool_builds_total", "identity" => identity.to_string()).increment(1);
    gauge!("shard_pool_active_nodes", "identity" => identity.to_string()).set(nodes as f64);
}

pub fn record_reload(identity: &str, outcome: &'static str) {
    counter!(
        "shard_pool_reloads_total",
        "identity" => identity.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_teardown_failure(identity: &str) {
    counter!("shard_pool_teardown_failures_total", "identity" => identity.to_string()).increment(1);
}
