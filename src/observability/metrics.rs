//! Metrics collection and exposition.
//!
//! # Metrics
//! - `ember_packets_allocated_total` (counter): buffers handed out, by pool
//! - `ember_pool_exhausted_total` (counter): failed or timed-out allocations, by pool
//! - `ember_udp_dropped_total` (counter): datagrams dropped on the receive path
//! - `ember_socket_events_dropped_total` (counter): callbacks lost to a full event queue
//! - `ember_tls_handshakes_total` (counter): by role and outcome
//! - `ember_tcp_connections_active` (gauge): connected TCP sockets
//! - `ember_interface_up` (gauge): 1 while an interface is up, by interface

use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{NetError, Result};

/// Start the Prometheus exporter on `addr`. Needs a running Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| NetError::Config(format!("metrics exporter: {e}")))?;
    tracing::info!(address = %addr, "metrics exporter listening");
    Ok(())
}

pub fn record_packet_allocated(pool: &'static str, buffers: usize) {
    metrics::counter!("ember_packets_allocated_total", "pool" => pool).increment(buffers as u64);
}

pub fn record_pool_exhausted(pool: &'static str) {
    metrics::counter!("ember_pool_exhausted_total", "pool" => pool).increment(1);
}

pub fn record_udp_dropped(reason: &'static str) {
    metrics::counter!("ember_udp_dropped_total", "reason" => reason).increment(1);
}

pub fn record_event_dropped() {
    metrics::counter!("ember_socket_events_dropped_total").increment(1);
}

pub fn record_handshake(role: &'static str, outcome: &'static str) {
    metrics::counter!("ember_tls_handshakes_total", "role" => role, "outcome" => outcome)
        .increment(1);
}

pub fn set_active_connections(count: u64) {
    metrics::gauge!("ember_tcp_connections_active").set(count as f64);
}

pub fn set_interface_up(interface: &'static str, up: bool) {
    metrics::gauge!("ember_interface_up", "interface" => interface).set(if up { 1.0 } else { 0.0 });
}
