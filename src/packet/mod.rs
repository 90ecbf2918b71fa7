//! Pooled, chained packet buffers.
//!
//! # Data Flow
//! ```text
//! Transmit:
//!     PacketPool::allocate(kind) → Packet (headroom reserved for headers)
//!     → payload written at the tail → socket/TLS → stack → released
//!
//! Receive (driver path):
//!     PacketPool::try_allocate → copy from the medium → socket queue
//!     → application / TLS → released on drop
//! ```
//!
//! # Design Decisions
//! - Slabs are allocated once at pool creation; nothing is heap-allocated per packet
//! - A `Packet` owns its chain; dropping it returns every slab to its pool,
//!   so a packet can never be released twice or used after release
//! - Driver-side allocation never blocks; application-side allocation takes a `Timeout`

mod buffer;
mod chain;
mod pool;

pub use buffer::Buffer;
pub use chain::Packet;
pub use pool::{PacketPool, PoolStats};

/// Physical (link) header reserve in front of every IP packet.
pub const PHYSICAL_HEADER: usize = 16;
/// IPv4 header without options.
pub const IP_HEADER: usize = 20;
/// TCP header without options.
pub const TCP_HEADER: usize = 20;
/// UDP header.
pub const UDP_HEADER: usize = 8;

/// What a packet will carry; selects the headroom reserved for lower-layer headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// No headroom.
    Raw,
    /// IP payload (ICMP, IGMP).
    Ip,
    /// UDP payload.
    Udp,
    /// TCP payload.
    Tcp,
}

impl PacketKind {
    /// Headroom reserved in the first buffer of the chain.
    pub fn header_reserve(self) -> usize {
        match self {
            PacketKind::Raw => 0,
            PacketKind::Ip => IP_HEADER + PHYSICAL_HEADER,
            PacketKind::Udp => UDP_HEADER + IP_HEADER + PHYSICAL_HEADER,
            PacketKind::Tcp => TCP_HEADER + IP_HEADER + PHYSICAL_HEADER,
        }
    }
}
