//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Application
//!     → stream.rs (pack writes into MSS-sized packets)
//!     → tcp.rs / udp.rs (socket state machine, link gating)
//!     → tls (optional record layer, TCP only)
//!     → stack (in-process IPv4 model: endpoints, listen table, medium)
//!
//! Driver events (data, connect request, peer close)
//!     → callbacks.rs (bounded table → bounded queue → worker task)
//!
//! Socket States:
//!     Created → Bound → Listening/Connecting → Connected → Disconnected
//! ```
//!
//! # Design Decisions
//! - Every socket operation checks the link first and fails with `LinkDown`
//! - Connected sockets are counted so suspend can refuse while any are open
//! - TLS is attached per socket and invisible to send/receive callers

pub mod address;
pub mod callbacks;
pub mod connection;
pub mod stack;
pub mod stream;
pub mod tcp;
pub mod udp;

use std::sync::Arc;

use crate::config::schema::NetConfig;
use crate::packet::PacketPool;

use callbacks::CallbackRegistry;
use connection::ConnectionTracker;
use stack::IpStack;

pub use tcp::{SocketState, TcpSocket};
pub use udp::UdpSocket;

/// What a socket borrows from its manager: the interface stack, the transmit
/// pool and the shared registries.
#[derive(Clone)]
pub struct SocketResources {
    pub stack: IpStack,
    pub tx_pool: PacketPool,
    pub registry: Arc<CallbackRegistry>,
    pub tracker: ConnectionTracker,
    pub config: Arc<NetConfig>,
}
