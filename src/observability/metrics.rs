//! Metrics collection and exposition.
//!
//! # Metrics
//! - `conf_runtime_transitions_total` (counter): controller transitions by server type and kind
//! - `conf_runtime_restart_failures_total` (counter): restarts that left an instance stopped
//! - `conf_runtime_publish_failures_total` (counter): failed discovery writes
//! - `conf_runtime_registry_reconnects_total` (counter): registry sessions re-established
//! - `conf_runtime_watch_events_total` (counter): notifications delivered to subscriptions
//! - `conf_runtime_server_state` (gauge): 0=stopped 1=starting 2=running 3=restarting 4=shutting down
//!
//! Metrics are recorded unconditionally; without an installed exporter the
//! `metrics` macros are no-ops.

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter with an HTTP scrape endpoint at `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), metrics_exporter_prometheus::BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    metrics::describe_counter!("conf_runtime_transitions_total", "Controller transitions");
    metrics::describe_counter!("conf_runtime_restart_failures_total", "Restarts that left an instance stopped");
    metrics::describe_counter!("conf_runtime_publish_failures_total", "Failed discovery writes");
    metrics::describe_counter!("conf_runtime_registry_reconnects_total", "Registry sessions re-established");
    metrics::describe_counter!("conf_runtime_watch_events_total", "Notifications delivered to subscriptions");
    metrics::describe_gauge!("conf_runtime_server_state", "Current controller state per server type");
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}
