//! TLS record layer and handshake engine.
//!
//! # Responsibilities
//! - Frame, protect and reassemble records over a packet transport
//! - Drive client and server handshakes through an explicit state table
//! - Verify peer certificate chains and cache sessions for resumption
//!
//! # Data Flow
//! ```text
//! send:    Packet ──seal in place (or copy into records)──▶ RecordIo::send_packet
//! receive: RecordIo::receive_packet ──▶ lone record? decrypt in place
//!                                  └──▶ else Defragmenter ──▶ records ──▶ Packet
//! ```
//!
//! The engine never owns the transport. Sockets lend it a [`RecordIo`] for
//! the duration of one call.

pub mod certificate;
pub mod context;
pub mod crypto;
mod error;
pub mod message;
pub mod record;
pub mod session;
pub mod state;

use crate::error::Result;
use crate::packet::{Packet, PacketPool};
use crate::resilience::timeouts::Timeout;

pub use certificate::{Certificate, CertificateAuthority, TlsIdentity, TrustStore};
pub use context::{Role, TlsContext, TlsSettings, VerifyMode};
pub use crypto::CipherParams;
pub use error::TlsError;
pub use session::{Session, SessionCache};
pub use state::HandshakeState;

/// Packet transport underneath a TLS context.
#[allow(async_fn_in_trait)]
pub trait RecordIo {
    /// Hand one packet of record bytes to the transport.
    async fn send_packet(&mut self, packet: Packet) -> Result<()>;

    /// Next packet of record bytes from the transport.
    async fn receive_packet(&mut self, timeout: Timeout) -> Result<Packet>;

    /// Pool for outbound record packets.
    fn tx_pool(&self) -> &PacketPool;

    /// Pool for plaintext handed back to the application.
    fn rx_pool(&self) -> &PacketPool;

    /// Largest packet the transport carries in one segment.
    fn max_segment(&self) -> usize;

    fn allocate_timeout(&self) -> Timeout;
}
