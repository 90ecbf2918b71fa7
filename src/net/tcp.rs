//! TCP sockets with optional, transparently interposed TLS.
//!
//! # State Machine
//! ```text
//! Created ──bind──▶ Bound ──connect──▶ Connecting ──▶ Connected
//!    │                                                   │
//!    └──listen──▶ Listening ──accept──▶ Connected ──disconnect──▶ Disconnected
//! ```
//!
//! When a [`TlsContext`] is attached, `connect`/`accept` run its handshake
//! after the transport connects and `send`/`receive` go through its record
//! layer. Callers use the same calls either way.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use crate::config::schema::NetConfig;
use crate::error::{NetError, Result};
use crate::net::callbacks::{CallbackRegistry, SocketCallbacks, SocketEventKind};
use crate::net::connection::{ConnectionGuard, ConnectionTracker, SocketId};
use crate::net::stack::{IpStack, TcpEndpoint, TcpPhase};
use crate::net::stream::TcpStreamWriter;
use crate::net::SocketResources;
use crate::packet::{Packet, PacketKind, PacketPool};
use crate::resilience::timeouts::Timeout;
use crate::tls::{RecordIo, TlsContext, TlsSettings};

/// Application-visible socket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Created,
    Bound,
    Listening,
    Connecting,
    Connected,
    Disconnected,
}

/// Lends the stack connection to the TLS engine for one call.
pub(crate) struct TcpTransport<'a> {
    stack: &'a IpStack,
    endpoint: &'a Arc<TcpEndpoint>,
    tx_pool: &'a PacketPool,
    config: &'a NetConfig,
}

impl RecordIo for TcpTransport<'_> {
    async fn send_packet(&mut self, packet: Packet) -> Result<()> {
        self.stack
            .tcp_send(self.endpoint, packet, self.config.tcp.send_timeout())
            .await
    }

    async fn receive_packet(&mut self, timeout: Timeout) -> Result<Packet> {
        self.stack.tcp_receive(self.endpoint, timeout).await
    }

    fn tx_pool(&self) -> &PacketPool {
        self.tx_pool
    }

    fn rx_pool(&self) -> &PacketPool {
        self.stack.rx_pool()
    }

    fn max_segment(&self) -> usize {
        self.stack.mss()
    }

    fn allocate_timeout(&self) -> Timeout {
        self.config.tcp.allocate_timeout()
    }
}

/// A TCP socket on one interface.
pub struct TcpSocket {
    id: SocketId,
    stack: IpStack,
    endpoint: Arc<TcpEndpoint>,
    tx_pool: PacketPool,
    registry: Arc<CallbackRegistry>,
    tracker: ConnectionTracker,
    config: Arc<NetConfig>,
    state: SocketState,
    listen_port: Option<u16>,
    connection: Option<ConnectionGuard>,
    tls: Option<TlsContext>,
}

impl TcpSocket {
    pub(crate) fn new(resources: SocketResources) -> Self {
        let id = SocketId::new();
        tracing::debug!(socket = %id, interface = %resources.stack.interface(), "tcp socket created");
        Self {
            id,
            endpoint: TcpEndpoint::new(id),
            stack: resources.stack,
            tx_pool: resources.tx_pool,
            registry: resources.registry,
            tracker: resources.tracker,
            config: resources.config,
            state: SocketState::Created,
            listen_port: None,
            connection: None,
            tls: None,
        }
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn local_port(&self) -> Option<u16> {
        self.endpoint.local_port()
    }

    /// Remote address of the current connection.
    pub fn peer(&self) -> Option<SocketAddrV4> {
        self.endpoint.peer_address()
    }

    // ---- TLS ----

    /// Attach a fresh TLS context; later connects and accepts handshake.
    pub fn enable_tls(&mut self, settings: TlsSettings) {
        self.tls = Some(TlsContext::new(settings));
    }

    /// Attach an existing context, e.g. one holding a resumable session.
    pub fn attach_tls(&mut self, tls: TlsContext) {
        self.tls = Some(tls);
    }

    /// Detach the TLS context so it outlives the socket.
    pub fn take_tls(&mut self) -> Option<TlsContext> {
        self.tls.take()
    }

    pub fn tls(&self) -> Option<&TlsContext> {
        self.tls.as_ref()
    }

    // ---- callbacks ----

    /// Switch the socket to event-driven operation.
    pub fn register_callbacks(&mut self, callbacks: SocketCallbacks) -> Result<()> {
        self.registry.register(self.id, callbacks)?;
        self.endpoint.set_hook(Some(self.registry.hook_for(self.id)));
        Ok(())
    }

    pub fn deregister_callbacks(&mut self) {
        self.endpoint.set_hook(None);
        self.registry.deregister(self.id);
    }

    // ---- transport ----

    /// Bind a local port; `0` picks an ephemeral one. Returns the port.
    pub fn bind(&mut self, port: u16) -> Result<u16> {
        self.ensure_link()?;
        let port = self.stack.tcp_bind(&self.endpoint, port)?;
        self.state = SocketState::Bound;
        tracing::debug!(socket = %self.id, port, "tcp socket bound");
        Ok(port)
    }

    /// Connect to `address:port`, then run the client handshake if TLS is attached.
    ///
    /// A failed handshake disconnects the transport and returns the TLS error.
    pub async fn connect(&mut self, address: Ipv4Addr, port: u16, timeout: Timeout) -> Result<()> {
        self.ensure_link()?;
        if self.endpoint.local_port().is_none() {
            self.bind(0)?;
        }
        let remote = SocketAddrV4::new(address, port);
        self.state = SocketState::Connecting;
        if let Err(err) = self.stack.tcp_connect(&self.endpoint, remote, timeout).await {
            self.state = SocketState::Bound;
            tracing::debug!(socket = %self.id, %remote, error = %err, "tcp connect failed");
            return Err(err);
        }
        self.state = SocketState::Connected;
        self.connection = Some(self.tracker.track(self.id));
        tracing::debug!(socket = %self.id, %remote, "tcp connected");

        if let Some(tls) = self.tls.as_mut() {
            tls.reset();
            let mut io = TcpTransport {
                stack: &self.stack,
                endpoint: &self.endpoint,
                tx_pool: &self.tx_pool,
                config: &self.config,
            };
            if let Err(err) = tls.handshake(&mut io, self.config.tls.handshake_timeout()).await {
                self.drop_transport();
                return Err(err);
            }
        }
        Ok(())
    }

    /// Listen on `port`. Re-listens when a registration already exists.
    pub fn listen(&mut self, port: u16) -> Result<()> {
        self.ensure_link()?;
        if self.stack.is_listening(port) {
            self.stack.tcp_relisten(&self.endpoint, port)?;
        } else {
            self.stack.tcp_listen(&self.endpoint, port)?;
        }
        self.listen_port = Some(port);
        self.state = SocketState::Listening;
        tracing::debug!(socket = %self.id, port, "tcp listening");
        Ok(())
    }

    /// Accept the next connection on the listening port and run the server
    /// handshake if TLS is attached. Returns the peer address.
    ///
    /// Without a connect callback the socket is first returned to a clean
    /// listening state, so calling `accept` twice without `disconnect` is
    /// fine. With one, the pending connection is taken with a short timeout.
    pub async fn accept(&mut self) -> Result<SocketAddrV4> {
        self.ensure_link()?;
        let port = self
            .listen_port
            .ok_or_else(|| NetError::failed("socket not listening"))?;
        let event_driven = self.registry.has(self.id, SocketEventKind::Connect);
        let listening = matches!(self.endpoint.phase(), TcpPhase::Listening(_));
        if !event_driven || !listening {
            self.relisten(port)?;
        }
        let timeout = if event_driven {
            self.config.tcp.accept_callback_timeout()
        } else {
            self.config.tcp.accept_timeout()
        };

        let peer = self.stack.tcp_accept(&self.endpoint, timeout).await?;
        self.state = SocketState::Connected;
        self.connection = Some(self.tracker.track(self.id));
        tracing::debug!(socket = %self.id, %peer, "tcp connection accepted");

        if let Some(tls) = self.tls.as_mut() {
            tls.reset();
            let mut io = TcpTransport {
                stack: &self.stack,
                endpoint: &self.endpoint,
                tx_pool: &self.tx_pool,
                config: &self.config,
            };
            if let Err(err) = tls.handshake(&mut io, self.config.tls.handshake_timeout()).await {
                self.drop_transport();
                return Err(err);
            }
        }
        Ok(peer)
    }

    /// Disconnect if needed, drop the old listen ownership and take it back.
    fn relisten(&mut self, port: u16) -> Result<()> {
        if !matches!(self.endpoint.phase(), TcpPhase::Listening(_)) {
            self.drop_transport();
        }
        self.stack.tcp_unaccept(&self.endpoint)?;
        self.stack.tcp_relisten(&self.endpoint, port)?;
        if let Some(tls) = self.tls.as_mut() {
            tls.reset();
        }
        self.state = SocketState::Listening;
        Ok(())
    }

    fn drop_transport(&mut self) {
        if let Err(err) = self.stack.tcp_disconnect(&self.endpoint) {
            tracing::warn!(socket = %self.id, error = %err, "tcp disconnect failed");
        }
        self.connection = None;
        self.state = SocketState::Disconnected;
    }

    /// Payload bytes one packet from [`create_packet`](Self::create_packet)
    /// can carry so it leaves as a single segment (and a single record).
    pub fn segment_capacity(&self) -> usize {
        let room = self
            .tx_pool
            .buffer_size()
            .saturating_sub(PacketKind::Tcp.header_reserve());
        let mut capacity = self.stack.mss().min(room);
        if let Some(tls) = &self.tls {
            capacity = capacity.saturating_sub(tls.record_overhead());
        }
        capacity.max(1)
    }

    /// Allocate a transmit packet with header room for TCP and TLS.
    pub async fn create_packet(&self) -> Result<Packet> {
        self.tx_pool
            .allocate(PacketKind::Tcp, self.config.tcp.allocate_timeout())
            .await
    }

    /// Send one packet, encrypting it when TLS is active.
    pub async fn send_packet(&mut self, packet: Packet) -> Result<()> {
        self.ensure_link()?;
        self.ensure_connected()?;
        match self.tls.as_mut() {
            Some(tls) => {
                let mut io = TcpTransport {
                    stack: &self.stack,
                    endpoint: &self.endpoint,
                    tx_pool: &self.tx_pool,
                    config: &self.config,
                };
                tls.send(&mut io, packet).await
            }
            None => {
                self.stack
                    .tcp_send(&self.endpoint, packet, self.config.tcp.send_timeout())
                    .await
            }
        }
    }

    /// Send `data` in as many packets as it takes.
    pub async fn send_buffer(&mut self, data: &[u8]) -> Result<()> {
        let mut writer = self.stream();
        writer.write(data).await?;
        writer.finish().await
    }

    /// Buffered writer that packs writes into full segments.
    pub fn stream(&mut self) -> TcpStreamWriter<'_> {
        TcpStreamWriter::new(self)
    }

    /// Next packet of application data.
    pub async fn receive(&mut self, timeout: Timeout) -> Result<Packet> {
        self.ensure_link()?;
        self.ensure_connected()?;
        match self.tls.as_mut() {
            Some(tls) => {
                let mut io = TcpTransport {
                    stack: &self.stack,
                    endpoint: &self.endpoint,
                    tx_pool: &self.tx_pool,
                    config: &self.config,
                };
                tls.receive(&mut io, timeout).await
            }
            None => self.stack.tcp_receive(&self.endpoint, timeout).await,
        }
    }

    /// Close the connection and release the local port.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.ensure_link()?;
        self.close_notify().await;
        self.drop_transport();
        if self.listen_port.is_none() && self.endpoint.local_port().is_some() {
            if let Err(err) = self.stack.tcp_unbind(&self.endpoint) {
                tracing::warn!(socket = %self.id, error = %err, "tcp unbind failed");
            }
        }
        if let Some(tls) = self.tls.as_mut() {
            tls.reset();
        }
        tracing::debug!(socket = %self.id, "tcp disconnected");
        Ok(())
    }

    async fn close_notify(&mut self) {
        let Some(tls) = self.tls.as_mut() else {
            return;
        };
        if !tls.is_established() || !self.stack.is_link_up() {
            return;
        }
        let mut io = TcpTransport {
            stack: &self.stack,
            endpoint: &self.endpoint,
            tx_pool: &self.tx_pool,
            config: &self.config,
        };
        if let Err(err) = tls.close_notify(&mut io).await {
            tracing::warn!(socket = %self.id, error = %err, "tls close_notify failed");
        }
    }

    /// Tear the socket down. Every step is attempted; failures are logged.
    pub async fn delete(mut self) {
        self.close_notify().await;
        self.tls = None;
        self.release();
        tracing::debug!(socket = %self.id, "tcp socket deleted");
    }

    fn release(&mut self) {
        self.deregister_callbacks();
        if let Some(port) = self.listen_port.take() {
            if self.stack.is_listening(port) {
                if let Err(err) = self.stack.tcp_unlisten(&self.endpoint, port) {
                    tracing::warn!(socket = %self.id, port, error = %err, "tcp unlisten failed");
                }
            }
        }
        self.stack.tcp_release(&self.endpoint);
        self.connection = None;
    }

    fn ensure_link(&self) -> Result<()> {
        if self.stack.is_link_up() {
            Ok(())
        } else {
            Err(NetError::LinkDown)
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.state == SocketState::Connected {
            Ok(())
        } else {
            Err(NetError::failed(format!("socket not connected ({:?})", self.state)))
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for TcpSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocket")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("local_port", &self.local_port())
            .field("peer", &self.peer())
            .field("tls", &self.tls.as_ref().map(|t| t.state()))
            .finish()
    }
}
