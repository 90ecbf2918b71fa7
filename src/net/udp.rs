//! UDP sockets.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use crate::config::schema::NetConfig;
use crate::error::{NetError, Result};
use crate::net::callbacks::{CallbackRegistry, SocketCallbacks};
use crate::net::connection::SocketId;
use crate::net::stack::{IpStack, UdpEndpoint};
use crate::net::SocketResources;
use crate::packet::{Packet, PacketKind, PacketPool};
use crate::resilience::timeouts::Timeout;

/// A bound UDP port. Created bound; dropping or [`delete`](Self::delete) unbinds.
pub struct UdpSocket {
    id: SocketId,
    stack: IpStack,
    endpoint: Arc<UdpEndpoint>,
    tx_pool: PacketPool,
    registry: Arc<CallbackRegistry>,
    config: Arc<NetConfig>,
}

impl UdpSocket {
    /// Bind `port` (`0` = any free port).
    pub(crate) fn create(resources: SocketResources, port: u16) -> Result<Self> {
        if !resources.stack.is_link_up() {
            return Err(NetError::LinkDown);
        }
        let id = SocketId::new();
        let endpoint = resources.stack.udp_bind(id, port)?;
        tracing::debug!(socket = %id, port = endpoint.port(), "udp socket bound");
        Ok(Self {
            id,
            stack: resources.stack,
            endpoint,
            tx_pool: resources.tx_pool,
            registry: resources.registry,
            config: resources.config,
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port()
    }

    /// Receive callback only; connect and disconnect callbacks are rejected.
    pub fn register_callbacks(&mut self, callbacks: SocketCallbacks) -> Result<()> {
        if callbacks.connect.is_some() || callbacks.disconnect.is_some() {
            return Err(NetError::InvalidArgument(
                "udp sockets only support a receive callback".into(),
            ));
        }
        self.registry.register(self.id, callbacks)?;
        self.endpoint.set_hook(Some(self.registry.hook_for(self.id)));
        Ok(())
    }

    /// Allocate a transmit packet with UDP/IP header room.
    pub async fn create_packet(&self) -> Result<Packet> {
        self.tx_pool
            .allocate(PacketKind::Udp, self.config.tcp.allocate_timeout())
            .await
    }

    /// Send `packet` to `address:port`. Broadcast and multicast destinations work.
    pub fn send(&self, address: Ipv4Addr, port: u16, packet: Packet) -> Result<()> {
        self.ensure_link()?;
        self.stack
            .udp_send(&self.endpoint, SocketAddrV4::new(address, port), packet)
    }

    /// Send `packet` back to where `received` came from.
    pub fn reply(&self, received: &Packet, packet: Packet) -> Result<()> {
        let source = received
            .source()
            .ok_or_else(|| NetError::InvalidArgument("packet has no source address".into()))?;
        self.send(*source.ip(), source.port(), packet)
    }

    /// Next datagram. Its sender is [`Packet::source`].
    pub async fn receive(&self, timeout: Timeout) -> Result<Packet> {
        self.ensure_link()?;
        self.stack.udp_receive(&self.endpoint, timeout).await
    }

    pub fn delete(self) {
        tracing::debug!(socket = %self.id, port = self.port(), "udp socket deleted");
    }

    fn ensure_link(&self) -> Result<()> {
        if self.stack.is_link_up() {
            Ok(())
        } else {
            Err(NetError::LinkDown)
        }
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        self.endpoint.set_hook(None);
        self.registry.deregister(self.id);
        if let Err(err) = self.stack.udp_unbind(&self.endpoint) {
            tracing::trace!(socket = %self.id, error = %err, "udp unbind skipped");
        }
    }
}

impl std::fmt::Debug for UdpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSocket")
            .field("id", &self.id)
            .field("port", &self.port())
            .finish()
    }
}
