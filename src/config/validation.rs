//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (pool sizes > 0, MSS fits a buffer)
//! - Check cross-section constraints (defrag buffer holds a full record)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function: NetConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;

use crate::config::schema::NetConfig;
use crate::packet::PacketKind;
use crate::tls::record::{MAX_FRAGMENT, RECORD_HEADER_LEN};

/// A single rejected setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check every semantic constraint, collecting all failures.
pub fn validate_config(config: &NetConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let pools = &config.pools;
    if pools.tx_buffers == 0 {
        errors.push(ValidationError::new("pools.tx_buffers", "must be at least 1"));
    }
    if pools.rx_buffers == 0 {
        errors.push(ValidationError::new("pools.rx_buffers", "must be at least 1"));
    }
    let reserve = PacketKind::Tcp.header_reserve();
    if pools.buffer_size <= reserve {
        errors.push(ValidationError::new(
            "pools.buffer_size",
            format!("must exceed the {reserve}-byte TCP header reserve"),
        ));
    }

    let tcp = &config.tcp;
    if tcp.mss == 0 {
        errors.push(ValidationError::new("tcp.mss", "must be greater than 0"));
    } else if tcp.mss + reserve > pools.buffer_size {
        errors.push(ValidationError::new(
            "tcp.mss",
            format!(
                "{} plus headers does not fit a {}-byte buffer",
                tcp.mss, pools.buffer_size
            ),
        ));
    }
    if tcp.listen_queue == 0 {
        errors.push(ValidationError::new("tcp.listen_queue", "must be at least 1"));
    }
    if tcp.receive_window == 0 {
        errors.push(ValidationError::new("tcp.receive_window", "must be at least 1"));
    }

    if config.udp.queue_depth == 0 {
        errors.push(ValidationError::new("udp.queue_depth", "must be at least 1"));
    }

    if config.sockets.max_with_callbacks == 0 {
        errors.push(ValidationError::new(
            "sockets.max_with_callbacks",
            "must be at least 1",
        ));
    }
    if config.sockets.event_queue_depth == 0 {
        errors.push(ValidationError::new(
            "sockets.event_queue_depth",
            "must be at least 1",
        ));
    }

    let tls = &config.tls;
    let min_defrag = RECORD_HEADER_LEN + MAX_FRAGMENT;
    if tls.defrag_capacity < min_defrag {
        errors.push(ValidationError::new(
            "tls.defrag_capacity",
            format!("must hold one full record ({min_defrag} bytes)"),
        ));
    }
    if tls.session_cache_size == 0 {
        errors.push(ValidationError::new("tls.session_cache_size", "must be at least 1"));
    }
    if tls.max_certificate_chain == 0 {
        errors.push(ValidationError::new(
            "tls.max_certificate_chain",
            "must be greater than 0",
        ));
    }

    let network = &config.network;
    if network.join_attempts == 0 {
        errors.push(ValidationError::new("network.join_attempts", "must be at least 1"));
    }
    if network.join_backoff_base_ms > network.join_backoff_max_ms {
        errors.push(ValidationError::new(
            "network.join_backoff_base_ms",
            "must not exceed join_backoff_max_ms",
        ));
    }
    if network.timer_period_ms == 0 {
        errors.push(ValidationError::new("network.timer_period_ms", "must be greater than 0"));
    }
    if network.max_link_subscribers == 0 {
        errors.push(ValidationError::new(
            "network.max_link_subscribers",
            "must be at least 1",
        ));
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", observability.metrics_address),
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
    fn defaults_are_valid() {
        assert!(validate_config(&NetConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = NetConfig::default();
        config.pools.tx_buffers = 0;
        config.tcp.mss = 4000;
        config.tls.defrag_capacity = 1024;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field).collect();
        assert_eq!(
            fields,
            vec!["pools.tx_buffers", "tcp.mss", "tls.defrag_capacity"]
        );
    }

    #[test]
    fn bad_metrics_address_only_matters_when_enabled() {
        let mut config = NetConfig::default();
        config.observability.metrics_address = "not-an-address".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
