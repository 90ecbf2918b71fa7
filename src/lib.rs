//! ember-net: an embedded transport layer over pooled packet buffers.
//!
//! # Architecture Overview
//!
//! ```text
//!   application
//!       │ write / flush                     receive ▲
//!       ▼                                           │
//!  ┌──────────────┐   ┌──────────────┐   ┌──────────┴────┐
//!  │ stream writer│──▶│ TCP/UDP      │──▶│ TLS record /  │
//!  │ (net::stream)│   │ sockets      │◀──│ handshake     │
//!  └──────────────┘   └──────┬───────┘   └───────────────┘
//!                            │ packets (tx/rx pools)
//!                            ▼
//!                     ┌──────────────┐     ┌────────────────────┐
//!                     │ IpStack      │◀───▶│ Medium (shared air) │
//!                     └──────┬───────┘     └────────────────────┘
//!                            │ driver events
//!                            ▼
//!                  ┌────────────────────┐   ┌──────────────────────┐
//!                  │ callback registry  │──▶│ event worker (tokio) │
//!                  └────────────────────┘   └──────────────────────┘
//!
//!  lifecycle::NetworkManager owns pools, registries, interfaces and the
//!  suspend/resume and link-event plumbing.
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod packet;
pub mod resilience;
pub mod tls;

pub use config::schema::NetConfig;
pub use error::{NetError, Result};
pub use lifecycle::{NetworkManager, Shutdown};
pub use resilience::timeouts::Timeout;
