//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the
//! transport. All types derive Serde traits for deserialization from TOML;
//! every section has defaults so an empty file is a valid config.

use serde::{Deserialize, Serialize};

use crate::resilience::timeouts::Timeout;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct NetConfig {
    /// Packet pool sizing.
    pub pools: PoolConfig,

    /// TCP socket behaviour and timeouts.
    pub tcp: TcpConfig,

    /// UDP socket behaviour.
    pub udp: UdpConfig,

    /// Callback table and event queue bounds.
    pub sockets: SocketConfig,

    /// TLS record layer and session cache.
    pub tls: TlsConfig,

    /// Interface bring-up, ARP and association retry.
    pub network: NetworkConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Transmit and receive pools.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Buffers in the transmit pool.
    pub tx_buffers: usize,

    /// Buffers in the receive pool.
    pub rx_buffers: usize,

    /// Size of every buffer in bytes.
    pub buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            tx_buffers: 7,
            rx_buffers: 7,
            buffer_size: 1536,
        }
    }
}

/// TCP configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Maximum segment size.
    pub mss: usize,

    /// Pending connections queued per listening port.
    pub listen_queue: usize,

    /// Packets queued per socket before senders wait.
    pub receive_window: usize,

    pub bind_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub accept_timeout_ms: u64,

    /// Accept timeout when a connect callback already signalled a pending connection.
    pub accept_callback_timeout_ms: u64,

    pub send_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub disconnect_timeout_ms: u64,

    /// Wait for a transmit buffer.
    pub allocate_timeout_ms: u64,
}

impl TcpConfig {
    pub fn bind_timeout(&self) -> Timeout {
        Timeout::from_millis(self.bind_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Timeout {
        Timeout::from_millis(self.connect_timeout_ms)
    }

    pub fn accept_timeout(&self) -> Timeout {
        Timeout::from_millis(self.accept_timeout_ms)
    }

    pub fn accept_callback_timeout(&self) -> Timeout {
        Timeout::from_millis(self.accept_callback_timeout_ms)
    }

    pub fn send_timeout(&self) -> Timeout {
        Timeout::from_millis(self.send_timeout_ms)
    }

    pub fn receive_timeout(&self) -> Timeout {
        Timeout::from_millis(self.receive_timeout_ms)
    }

    pub fn disconnect_timeout(&self) -> Timeout {
        Timeout::from_millis(self.disconnect_timeout_ms)
    }

    pub fn allocate_timeout(&self) -> Timeout {
        Timeout::from_millis(self.allocate_timeout_ms)
    }
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            mss: 1460,
            listen_queue: 5,
            receive_window: 4,
            bind_timeout_ms: 1_000,
            connect_timeout_ms: 5_000,
            accept_timeout_ms: 5_000,
            accept_callback_timeout_ms: 10,
            send_timeout_ms: 2_000,
            receive_timeout_ms: 5_000,
            disconnect_timeout_ms: 1_000,
            allocate_timeout_ms: 1_000,
        }
    }
}

/// UDP configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UdpConfig {
    /// Datagrams queued per socket before new ones are dropped.
    pub queue_depth: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self { queue_depth: 5 }
    }
}

/// Socket callback plumbing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Sockets that may have callbacks registered at once.
    pub max_with_callbacks: usize,

    /// Pending callback jobs before new events are dropped.
    pub event_queue_depth: usize,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            max_with_callbacks: 5,
            event_queue_depth: 16,
        }
    }
}

/// TLS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Defragmentation buffer size; must hold one maximum-size record.
    pub defrag_capacity: usize,

    /// Maximum encoded certificate chain accepted from a peer.
    pub max_certificate_chain: usize,

    /// Sessions kept for resumption.
    pub session_cache_size: usize,

    /// Session lifetime in seconds.
    pub session_lifetime_secs: u64,

    /// Upper bound on one handshake.
    pub handshake_timeout_ms: u64,

    /// Consecutive empty application records tolerated.
    pub max_empty_records: u32,
}

impl TlsConfig {
    pub fn handshake_timeout(&self) -> Timeout {
        Timeout::from_millis(self.handshake_timeout_ms)
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            defrag_capacity: 17 * 1024,
            max_certificate_chain: 4096,
            session_cache_size: 8,
            session_lifetime_secs: 3600,
            handshake_timeout_ms: 10_000,
            max_empty_records: 8,
        }
    }
}

/// Wireless security used by the association fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityMode {
    Open,
    WpaPsk,
    Wpa2Psk,
    Wpa3Sae,
}

/// Interface lifecycle configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Time allowed for the interface to obtain an address.
    pub address_resolution_timeout_ms: u64,

    /// Link-state subscribers per manager.
    pub max_link_subscribers: usize,

    /// Address-change subscribers per manager.
    pub max_address_subscribers: usize,

    pub arp_cache_size: usize,
    pub arp_entry_lifetime_secs: u64,

    /// Period of the stack's IP/TCP timer.
    pub timer_period_ms: u64,

    /// Association attempts before bring-up fails.
    pub join_attempts: u32,
    pub join_backoff_base_ms: u64,
    pub join_backoff_max_ms: u64,

    /// Security mode for one last join attempt. Off unless set.
    pub join_fallback: Option<SecurityMode>,
}

impl NetworkConfig {
    pub fn address_resolution_timeout(&self) -> Timeout {
        Timeout::from_millis(self.address_resolution_timeout_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            address_resolution_timeout_ms: 10_000,
            max_link_subscribers: 4,
            max_address_subscribers: 2,
            arp_cache_size: 16,
            arp_entry_lifetime_secs: 300,
            timer_period_ms: 100,
            join_attempts: 3,
            join_backoff_base_ms: 200,
            join_backoff_max_ms: 2_000,
            join_fallback: None,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub log_level: String,

    /// Emit JSON log lines.
    pub json_logs: bool,

    /// Expose Prometheus metrics.
    pub metrics_enabled: bool,

    /// Metrics listener address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "ember_net=info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9464".to_string(),
        }
    }
}
