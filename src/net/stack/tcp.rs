//! TCP endpoints and the listen table.

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::Notify;

use super::{EventHook, IpStack, Protocol, StackEvent, StackInner};
use crate::error::{NetError, Result};
use crate::net::connection::SocketId;
use crate::packet::{Packet, PacketKind};
use crate::resilience::timeouts::{wait_until, Timeout};

/// Transport state of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpPhase {
    Closed,
    /// Owns the listen registration for this port.
    Listening(u16),
    SynSent,
    Established,
    /// Peer closed; queued data can still be read.
    CloseWait,
    /// Connection attempt was refused.
    Refused,
}

#[derive(Clone)]
struct PeerLink {
    id: SocketId,
    endpoint: Weak<TcpEndpoint>,
    stack: Weak<StackInner>,
    address: SocketAddrV4,
}

struct EndpointState {
    local_port: Option<u16>,
    phase: TcpPhase,
    peer: Option<PeerLink>,
    rx: VecDeque<Packet>,
}

/// The stack side of one TCP socket.
pub struct TcpEndpoint {
    id: SocketId,
    state: Mutex<EndpointState>,
    /// Wakes the owner: connection progress, data, peer close.
    notify: Notify,
    /// Wakes the remote sender when the receive queue drains.
    drained: Notify,
    hook: Mutex<Option<EventHook>>,
}

impl TcpEndpoint {
    pub fn new(id: SocketId) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(EndpointState {
                local_port: None,
                phase: TcpPhase::Closed,
                peer: None,
                rx: VecDeque::new(),
            }),
            notify: Notify::new(),
            drained: Notify::new(),
            hook: Mutex::new(None),
        })
    }

    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn phase(&self) -> TcpPhase {
        self.lock().phase
    }

    pub fn local_port(&self) -> Option<u16> {
        self.lock().local_port
    }

    pub fn peer_address(&self) -> Option<SocketAddrV4> {
        self.lock().peer.as_ref().map(|p| p.address)
    }

    /// Packets waiting to be received.
    pub fn queued(&self) -> usize {
        self.lock().rx.len()
    }

    pub fn set_hook(&self, hook: Option<EventHook>) {
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    fn raise(&self, event: StackEvent) {
        let hook = self.hook.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(hook) = hook {
            hook(event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_linked_to(state: &EndpointState, id: SocketId) -> bool {
        state.peer.as_ref().map(|p| p.id) == Some(id)
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.phase() {
            TcpPhase::SynSent | TcpPhase::Established | TcpPhase::CloseWait => {
                Err(NetError::failed("socket is busy"))
            }
            _ => Ok(()),
        }
    }
}

struct PendingSyn {
    client: Weak<TcpEndpoint>,
    stack: Weak<StackInner>,
    address: SocketAddrV4,
}

/// A listening port: its current owner and the connections waiting for it.
pub(crate) struct ListenEntry {
    owner: Option<(SocketId, Weak<TcpEndpoint>)>,
    backlog: VecDeque<PendingSyn>,
    queue_max: usize,
}

impl ListenEntry {
    fn is_owner(&self, id: SocketId) -> bool {
        self.owner.as_ref().map(|(o, _)| *o) == Some(id)
    }

    /// Refuse every queued connection attempt.
    pub(crate) fn refuse_all(self) {
        for syn in self.backlog {
            if let Some(client) = syn.client.upgrade() {
                {
                    let mut st = client.lock();
                    if st.phase == TcpPhase::SynSent {
                        st.phase = TcpPhase::Refused;
                    }
                }
                client.notify.notify_one();
            }
        }
    }
}

impl StackInner {
    /// A connection request arriving at this stack.
    fn incoming_syn(&self, port: u16, syn: PendingSyn) -> Result<()> {
        let refused = || NetError::failed("connection refused");
        if !self.link_up.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NetError::failed("host unreachable"));
        }
        let owner = {
            let mut st = self.lock_state();
            if !st.features.tcp {
                return Err(refused());
            }
            let entry = st.listeners.get_mut(&port).ok_or_else(refused)?;
            if entry.backlog.len() >= entry.queue_max {
                return Err(refused());
            }
            entry.backlog.push_back(syn);
            entry.owner.as_ref().and_then(|(_, w)| w.upgrade())
        };
        if let Some(owner) = owner {
            owner.notify.notify_one();
            owner.raise(StackEvent::ConnectRequest);
        }
        Ok(())
    }
}

impl IpStack {
    /// Bind a local port; `0` picks an ephemeral one.
    pub fn tcp_bind(&self, ep: &Arc<TcpEndpoint>, port: u16) -> Result<u16> {
        self.ensure_alive()?;
        self.ensure_protocol(Protocol::Tcp)?;
        if ep.local_port().is_some() {
            return Err(NetError::failed("socket already bound"));
        }
        let port = {
            let mut st = self.inner.lock_state();
            let port = if port == 0 {
                self.allocate_ephemeral(|p| st.tcp_ports.contains(&p))?
            } else if st.tcp_ports.contains(&port) {
                return Err(NetError::failed(format!("port {port} in use")));
            } else {
                port
            };
            st.tcp_ports.insert(port);
            port
        };
        ep.lock().local_port = Some(port);
        Ok(port)
    }

    pub fn tcp_unbind(&self, ep: &Arc<TcpEndpoint>) -> Result<()> {
        let port = ep
            .lock()
            .local_port
            .take()
            .ok_or_else(|| NetError::failed("socket not bound"))?;
        self.inner.lock_state().tcp_ports.remove(&port);
        Ok(())
    }

    pub fn is_listening(&self, port: u16) -> bool {
        self.inner.lock_state().listeners.contains_key(&port)
    }

    /// Create a listen registration owned by `ep`.
    pub fn tcp_listen(&self, ep: &Arc<TcpEndpoint>, port: u16) -> Result<()> {
        self.ensure_alive()?;
        self.ensure_protocol(Protocol::Tcp)?;
        if port == 0 {
            return Err(NetError::InvalidArgument("cannot listen on port 0".into()));
        }
        ep.ensure_idle()?;
        {
            let mut st = self.inner.lock_state();
            if st.listeners.contains_key(&port) {
                return Err(NetError::failed(format!("port {port} already listening")));
            }
            st.listeners.insert(
                port,
                ListenEntry {
                    owner: Some((ep.id, Arc::downgrade(ep))),
                    backlog: VecDeque::new(),
                    queue_max: self.inner.options.listen_queue,
                },
            );
        }
        ep.lock().phase = TcpPhase::Listening(port);
        Ok(())
    }

    /// Attach `ep` to an existing listen registration.
    pub fn tcp_relisten(&self, ep: &Arc<TcpEndpoint>, port: u16) -> Result<()> {
        self.ensure_alive()?;
        ep.ensure_idle()?;
        let pending = {
            let mut st = self.inner.lock_state();
            let entry = st
                .listeners
                .get_mut(&port)
                .ok_or_else(|| NetError::failed(format!("port {port} not listening")))?;
            entry.owner = Some((ep.id, Arc::downgrade(ep)));
            !entry.backlog.is_empty()
        };
        ep.lock().phase = TcpPhase::Listening(port);
        if pending {
            ep.notify.notify_one();
        }
        Ok(())
    }

    /// Remove the listen registration on `port`, refusing queued peers.
    pub fn tcp_unlisten(&self, ep: &Arc<TcpEndpoint>, port: u16) -> Result<()> {
        let entry = {
            let mut st = self.inner.lock_state();
            match st.listeners.get(&port) {
                Some(e) if e.owner.is_none() || e.is_owner(ep.id) => st.listeners.remove(&port),
                Some(_) => return Err(NetError::failed("port owned by another socket")),
                None => return Err(NetError::failed(format!("port {port} not listening"))),
            }
        };
        if let Some(entry) = entry {
            entry.refuse_all();
        }
        let mut st = ep.lock();
        if st.phase == TcpPhase::Listening(port) {
            st.phase = TcpPhase::Closed;
        }
        Ok(())
    }

    /// Detach `ep` from any listen registration it owns.
    pub fn tcp_unaccept(&self, ep: &Arc<TcpEndpoint>) -> Result<()> {
        {
            let mut st = self.inner.lock_state();
            for entry in st.listeners.values_mut() {
                if entry.is_owner(ep.id) {
                    entry.owner = None;
                }
            }
        }
        let mut st = ep.lock();
        if matches!(st.phase, TcpPhase::Listening(_)) {
            st.phase = TcpPhase::Closed;
        }
        Ok(())
    }

    /// Wait for a queued connection and take it. Returns the peer address.
    pub async fn tcp_accept(&self, ep: &Arc<TcpEndpoint>, timeout: Timeout) -> Result<SocketAddrV4> {
        self.ensure_alive()?;
        let TcpPhase::Listening(port) = ep.phase() else {
            return Err(NetError::failed("socket not listening"));
        };
        let local_ip = self.ensure_ready()?;
        let local = SocketAddrV4::new(local_ip, port);

        wait_until(&ep.notify, timeout, || {
            if self.is_deleted() {
                return Some(Err(NetError::failed("interface deleted")));
            }
            let mut st = self.inner.lock_state();
            let entry = match st.listeners.get_mut(&port) {
                Some(e) if e.is_owner(ep.id) => e,
                _ => return Some(Err(NetError::failed("listen registration lost"))),
            };
            while let Some(syn) = entry.backlog.pop_front() {
                let Some(client) = syn.client.upgrade() else {
                    continue;
                };
                {
                    let mut cs = client.lock();
                    if cs.phase != TcpPhase::SynSent {
                        continue;
                    }
                    cs.phase = TcpPhase::Established;
                    cs.peer = Some(PeerLink {
                        id: ep.id,
                        endpoint: Arc::downgrade(ep),
                        stack: Arc::downgrade(&self.inner),
                        address: local,
                    });
                }
                {
                    let mut ss = ep.lock();
                    ss.phase = TcpPhase::Established;
                    ss.peer = Some(PeerLink {
                        id: client.id,
                        endpoint: syn.client.clone(),
                        stack: syn.stack.clone(),
                        address: syn.address,
                    });
                }
                client.notify.notify_one();
                return Some(Ok(syn.address));
            }
            None
        })
        .await
    }

    /// Open a connection to `remote`. `ep` must be bound.
    pub async fn tcp_connect(
        &self,
        ep: &Arc<TcpEndpoint>,
        remote: SocketAddrV4,
        timeout: Timeout,
    ) -> Result<()> {
        let local_ip = self.ensure_ready()?;
        self.ensure_protocol(Protocol::Tcp)?;
        let local_port = ep
            .local_port()
            .ok_or_else(|| NetError::failed("socket not bound"))?;
        ep.ensure_idle()?;
        {
            let mut st = ep.lock();
            st.phase = TcpPhase::SynSent;
            st.peer = None;
        }
        self.record_arp(*remote.ip());

        let sent = match self.inner.medium.lookup(*remote.ip()) {
            Some(peer_stack) => peer_stack.incoming_syn(
                remote.port(),
                PendingSyn {
                    client: Arc::downgrade(ep),
                    stack: Arc::downgrade(&self.inner),
                    address: SocketAddrV4::new(local_ip, local_port),
                },
            ),
            None => Err(NetError::failed("no route to host")),
        };
        if let Err(e) = sent {
            ep.lock().phase = TcpPhase::Closed;
            return Err(e);
        }

        let result = wait_until(&ep.notify, timeout, || match ep.phase() {
            TcpPhase::Established => Some(Ok(())),
            TcpPhase::Refused => Some(Err(NetError::failed("connection refused"))),
            TcpPhase::SynSent => None,
            other => Some(Err(NetError::failed(format!("connect aborted ({other:?})")))),
        })
        .await;
        if result.is_err() {
            let mut st = ep.lock();
            if matches!(st.phase, TcpPhase::SynSent | TcpPhase::Refused) {
                st.phase = TcpPhase::Closed;
            }
        }
        result
    }

    /// Deliver `packet` to the peer, segmented by MSS.
    ///
    /// The packet is released once copied. Waits while the peer's receive
    /// window is full or its rx pool is empty.
    pub async fn tcp_send(&self, ep: &Arc<TcpEndpoint>, packet: Packet, timeout: Timeout) -> Result<()> {
        self.ensure_ready()?;
        let link = {
            let st = ep.lock();
            match (st.phase, st.peer.clone()) {
                (TcpPhase::Established, Some(link)) => link,
                (TcpPhase::CloseWait, _) => return Err(NetError::failed("connection closed by peer")),
                _ => return Err(NetError::failed("socket not connected")),
            }
        };
        let data = packet.to_vec();
        drop(packet);

        self.record_arp(*link.address.ip());
        let deadline = timeout.deadline();
        let reset = || NetError::failed("connection reset");

        for chunk in data.chunks(self.mss().max(1)) {
            let peer = link.endpoint.upgrade().ok_or_else(reset)?;
            let peer_stack = link.stack.upgrade().ok_or_else(reset)?;
            let window = peer_stack.options.receive_window;

            wait_until(&peer.drained, Timeout::remaining(deadline), || {
                if peer_stack.deleted.load(std::sync::atomic::Ordering::SeqCst) {
                    return Some(Err(reset()));
                }
                let st = peer.lock();
                if !TcpEndpoint::is_linked_to(&st, ep.id) {
                    return Some(Err(reset()));
                }
                (st.rx.len() < window).then_some(Ok(()))
            })
            .await?;

            let segment = peer_stack
                .rx_pool
                .packet_from_slice(PacketKind::Tcp, chunk, Timeout::remaining(deadline))
                .await?;
            {
                let mut st = peer.lock();
                if !TcpEndpoint::is_linked_to(&st, ep.id) {
                    return Err(reset());
                }
                st.rx.push_back(segment);
            }
            peer.notify.notify_one();
            peer.raise(StackEvent::DataReceived);
        }
        Ok(())
    }

    /// Take the next received segment.
    pub async fn tcp_receive(&self, ep: &Arc<TcpEndpoint>, timeout: Timeout) -> Result<Packet> {
        self.ensure_alive()?;
        let packet = wait_until(&ep.notify, timeout, || {
            let mut st = ep.lock();
            if let Some(p) = st.rx.pop_front() {
                return Some(Ok(p));
            }
            match st.phase {
                TcpPhase::Established => None,
                TcpPhase::CloseWait => Some(Err(NetError::failed("connection closed by peer"))),
                _ => Some(Err(NetError::failed("socket not connected"))),
            }
        })
        .await?;
        ep.drained.notify_one();
        Ok(packet)
    }

    /// Close the connection and tell the peer. A listening endpoint stays listening.
    pub fn tcp_disconnect(&self, ep: &Arc<TcpEndpoint>) -> Result<()> {
        let (was, link, dropped) = {
            let mut st = ep.lock();
            let was = st.phase;
            if !matches!(was, TcpPhase::Listening(_)) {
                st.phase = TcpPhase::Closed;
            }
            (was, st.peer.take(), std::mem::take(&mut st.rx))
        };
        drop(dropped);
        ep.drained.notify_one();

        if let Some(peer) = link.and_then(|l| l.endpoint.upgrade()) {
            let linked = {
                let mut st = peer.lock();
                let linked = TcpEndpoint::is_linked_to(&st, ep.id);
                if linked {
                    st.peer = None;
                    if st.phase == TcpPhase::Established {
                        st.phase = TcpPhase::CloseWait;
                    }
                }
                linked
            };
            if linked {
                peer.notify.notify_one();
                peer.drained.notify_one();
                peer.raise(StackEvent::Disconnected);
            }
        }
        tracing::trace!(socket = %ep.id, from = ?was, "tcp endpoint disconnected");
        Ok(())
    }

    /// Drop every stack resource `ep` holds. A failing step is logged and
    /// the remaining steps still run.
    pub fn tcp_release(&self, ep: &Arc<TcpEndpoint>) {
        let report = |step: &str, result: Result<()>| {
            if let Err(err) = result {
                tracing::debug!(socket = %ep.id, step, error = %err, "tcp release step failed");
            }
        };
        report("disconnect", self.tcp_disconnect(ep));
        let owned: Vec<u16> = self
            .inner
            .lock_state()
            .listeners
            .iter()
            .filter(|(_, e)| e.is_owner(ep.id))
            .map(|(port, _)| *port)
            .collect();
        for port in owned {
            report("unlisten", self.tcp_unlisten(ep, port));
        }
        report("unaccept", self.tcp_unaccept(ep));
        report("unbind", self.tcp_unbind(ep));
        ep.set_hook(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::address::{Interface, IpSettings};
    use crate::net::stack::{Medium, StackOptions};
    use crate::packet::PacketPool;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn stack(medium: &Medium, last: u8) -> IpStack {
        let s = IpStack::create(
            Interface::Station,
            medium.clone(),
            PacketPool::new("rx", 16, 1536),
            StackOptions::default(),
            Some(IpSettings::new(
                Ipv4Addr::new(10, 0, 0, last),
                Ipv4Addr::new(255, 255, 255, 0),
                Ipv4Addr::new(10, 0, 0, 1),
            )),
        );
        s.enable(Protocol::Tcp).unwrap();
        s
    }

    fn addr(last: u8, port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, last), port)
    }

    const T: Timeout = Timeout::After(Duration::from_secs(2));

    async fn connected_pair(medium: &Medium) -> (IpStack, Arc<TcpEndpoint>, IpStack, Arc<TcpEndpoint>) {
        let a = stack(medium, 2);
        let b = stack(medium, 3);
        let server = TcpEndpoint::new(SocketId::new());
        b.tcp_listen(&server, 80).unwrap();

        let client = TcpEndpoint::new(SocketId::new());
        a.tcp_bind(&client, 0).unwrap();

        let (b2, s2) = (b.clone(), server.clone());
        let accept = tokio::spawn(async move { b2.tcp_accept(&s2, T).await });
        a.tcp_connect(&client, addr(3, 80), T).await.unwrap();
        let peer = accept.await.unwrap().unwrap();
        assert_eq!(peer.ip(), &Ipv4Addr::new(10, 0, 0, 2));
        (a, client, b, server)
    }

    #[tokio::test]
    async fn connect_accept_and_exchange() {
        let medium = Medium::new();
        let (a, client, b, server) = connected_pair(&medium).await;

        let payload: Vec<u8> = (0..3000u32).map(|i| i as u8).collect();
        let pool = PacketPool::new("tx", 4, 1536);
        let packet = pool
            .packet_from_slice(PacketKind::Tcp, &payload, Timeout::NoWait)
            .await
            .unwrap();
        a.tcp_send(&client, packet, T).await.unwrap();
        assert_eq!(pool.stats().in_use(), 0);

        let mut received = Vec::new();
        while received.len() < payload.len() {
            let p = b.tcp_receive(&server, T).await.unwrap();
            assert!(p.len() <= b.mss());
            received.extend(p.to_vec());
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn connect_without_listener_is_refused() {
        let medium = Medium::new();
        let a = stack(&medium, 2);
        let _b = stack(&medium, 3);
        let client = TcpEndpoint::new(SocketId::new());
        a.tcp_bind(&client, 0).unwrap();
        let err = a.tcp_connect(&client, addr(3, 81), T).await.unwrap_err();
        assert!(err.to_string().contains("refused"));
        assert_eq!(client.phase(), TcpPhase::Closed);
    }

    #[tokio::test]
    async fn duplicate_listen_fails_but_relisten_attaches() {
        let medium = Medium::new();
        let b = stack(&medium, 3);
        let first = TcpEndpoint::new(SocketId::new());
        let second = TcpEndpoint::new(SocketId::new());
        b.tcp_listen(&first, 90).unwrap();
        assert!(b.tcp_listen(&second, 90).is_err());

        b.tcp_unaccept(&first).unwrap();
        b.tcp_relisten(&second, 90).unwrap();
        assert_eq!(second.phase(), TcpPhase::Listening(90));
        assert_eq!(first.phase(), TcpPhase::Closed);
    }

    #[tokio::test]
    async fn disconnect_notifies_peer() {
        let medium = Medium::new();
        let (a, client, b, server) = connected_pair(&medium).await;

        let events = Arc::new(AtomicUsize::new(0));
        let seen = events.clone();
        server.set_hook(Some(Arc::new(move |e| {
            if e == StackEvent::Disconnected {
                seen.fetch_add(1, Ordering::SeqCst);
            }
        })));

        a.tcp_disconnect(&client).unwrap();
        assert_eq!(events.load(Ordering::SeqCst), 1);
        assert_eq!(server.phase(), TcpPhase::CloseWait);
        assert!(b.tcp_receive(&server, Timeout::NoWait).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn accept_times_out_without_peers() {
        let medium = Medium::new();
        let b = stack(&medium, 3);
        let server = TcpEndpoint::new(SocketId::new());
        b.tcp_listen(&server, 80).unwrap();
        let result = b
            .tcp_accept(&server, Timeout::After(Duration::from_millis(50)))
            .await;
        assert!(matches!(result, Err(NetError::Timeout)));
        assert_eq!(server.phase(), TcpPhase::Listening(80));
    }

    #[tokio::test]
    async fn ephemeral_ports_are_distinct() {
        let medium = Medium::new();
        let a = stack(&medium, 2);
        let e1 = TcpEndpoint::new(SocketId::new());
        let e2 = TcpEndpoint::new(SocketId::new());
        let p1 = a.tcp_bind(&e1, 0).unwrap();
        let p2 = a.tcp_bind(&e2, 0).unwrap();
        assert_ne!(p1, p2);
        assert!(p1 >= 49152 && p2 >= 49152);
        a.tcp_unbind(&e1).unwrap();
        assert!(a.tcp_unbind(&e1).is_err());
    }

    #[tokio::test]
    async fn release_keeps_going_past_failed_steps() {
        let medium = Medium::new();
        let (a, client, b, server) = connected_pair(&medium).await;
        let port = client.local_port().unwrap();

        a.tcp_disconnect(&client).unwrap();
        assert_eq!(server.phase(), TcpPhase::CloseWait);
        a.tcp_release(&client);
        // Nothing left to unbind the second time round.
        a.tcp_release(&client);
        assert_eq!(client.local_port(), None);

        b.tcp_release(&server);
        let listener = TcpEndpoint::new(SocketId::new());
        b.tcp_listen(&listener, 80).unwrap();
        let rebound = TcpEndpoint::new(SocketId::new());
        assert_eq!(a.tcp_bind(&rebound, port).unwrap(), port);
    }
}
