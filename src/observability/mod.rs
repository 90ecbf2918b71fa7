//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Pools, sockets, TLS and the network manager produce:
//!     → tracing events (structured fields: interface, socket, state)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → logging.rs subscriber (stdout, text or JSON)
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Metric updates are plain macro calls; without an installed recorder they are no-ops
//! - Log level comes from config, overridden by `RUST_LOG`

pub mod logging;
pub mod metrics;
