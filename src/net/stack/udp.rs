//! UDP port bindings and datagram delivery.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use super::{EventHook, IpStack, Protocol, StackEvent, StackInner};
use crate::error::{NetError, Result};
use crate::net::connection::SocketId;
use crate::observability::metrics;
use crate::packet::{Packet, PacketKind};
use crate::resilience::timeouts::{wait_until, Timeout};

/// A bound UDP port with its receive queue.
pub struct UdpEndpoint {
    id: SocketId,
    port: u16,
    depth: usize,
    queue: Mutex<UdpQueue>,
    notify: Notify,
    hook: Mutex<Option<EventHook>>,
}

struct UdpQueue {
    packets: VecDeque<Packet>,
    closed: bool,
}

impl UdpEndpoint {
    pub fn id(&self) -> SocketId {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn queued(&self) -> usize {
        self.lock().packets.len()
    }

    pub fn set_hook(&self, hook: Option<EventHook>) {
        *self.hook.lock().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    fn lock(&self) -> MutexGuard<'_, UdpQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn close(&self) {
        {
            let mut q = self.lock();
            q.closed = true;
            q.packets.clear();
        }
        self.notify.notify_one();
    }

    /// Queue a datagram; drops it when the queue is full.
    fn deliver(&self, packet: Packet) {
        {
            let mut q = self.lock();
            if q.closed {
                return;
            }
            if q.packets.len() >= self.depth {
                metrics::record_udp_dropped("queue_full");
                tracing::trace!(socket = %self.id, port = self.port, "udp queue full, datagram dropped");
                return;
            }
            q.packets.push_back(packet);
        }
        self.notify.notify_one();
        let hook = self.hook.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(hook) = hook {
            hook(StackEvent::DataReceived);
        }
    }
}

impl StackInner {
    /// Driver-side receive: copy into an rx packet without blocking.
    fn deliver_udp(&self, source: SocketAddrV4, port: u16, data: &[u8]) {
        if !self.link_up.load(Ordering::SeqCst) {
            return;
        }
        let endpoint = {
            let st = self.lock_state();
            if !st.features.udp {
                return;
            }
            st.udp.get(&port).cloned()
        };
        let Some(endpoint) = endpoint else {
            metrics::record_udp_dropped("no_socket");
            return;
        };
        match self.rx_pool.try_packet_from_slice(PacketKind::Udp, data) {
            Ok(mut packet) => {
                packet.set_source(source);
                endpoint.deliver(packet);
            }
            Err(_) => metrics::record_udp_dropped("pool_empty"),
        }
    }
}

impl IpStack {
    /// Bind a UDP port (`0` picks an ephemeral one).
    pub fn udp_bind(&self, id: SocketId, port: u16) -> Result<Arc<UdpEndpoint>> {
        self.ensure_alive()?;
        self.ensure_protocol(Protocol::Udp)?;
        let mut st = self.inner.lock_state();
        let port = if port == 0 {
            self.allocate_ephemeral(|p| st.udp.contains_key(&p))?
        } else if st.udp.contains_key(&port) {
            return Err(NetError::failed(format!("udp port {port} in use")));
        } else {
            port
        };
        let endpoint = Arc::new(UdpEndpoint {
            id,
            port,
            depth: self.inner.options.udp_queue_depth,
            queue: Mutex::new(UdpQueue {
                packets: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
            hook: Mutex::new(None),
        });
        st.udp.insert(port, endpoint.clone());
        Ok(endpoint)
    }

    pub fn udp_unbind(&self, ep: &Arc<UdpEndpoint>) -> Result<()> {
        let removed = {
            let mut st = self.inner.lock_state();
            match st.udp.get(&ep.port) {
                Some(bound) if Arc::ptr_eq(bound, ep) => st.udp.remove(&ep.port),
                _ => None,
            }
        };
        ep.close();
        removed
            .map(|_| ())
            .ok_or_else(|| NetError::failed("udp socket not bound"))
    }

    /// Send one datagram. Unicast, subnet broadcast and multicast are supported.
    pub fn udp_send(&self, ep: &Arc<UdpEndpoint>, dest: SocketAddrV4, packet: Packet) -> Result<()> {
        let settings = self.settings();
        let local_ip = self.ensure_ready()?;
        self.ensure_protocol(Protocol::Udp)?;
        if packet.len() > self.mss() && !self.is_enabled(Protocol::Fragmentation) {
            return Err(NetError::failed("datagram exceeds MTU and fragmentation is off"));
        }
        let data = packet.to_vec();
        drop(packet);

        let source = SocketAddrV4::new(local_ip, ep.port);
        let ip = *dest.ip();
        let is_broadcast = ip.is_broadcast()
            || settings.is_some_and(|s| u32::from(ip) | u32::from(s.netmask) == u32::MAX && s.is_local(ip));

        if ip.is_multicast() || is_broadcast {
            for member in self.inner.medium.members() {
                if Arc::ptr_eq(&member, &self.inner) {
                    continue;
                }
                let joined = ip.is_multicast() && member.lock_state().groups.contains(&ip);
                if joined || is_broadcast {
                    member.deliver_udp(source, dest.port(), &data);
                }
            }
            return Ok(());
        }

        self.record_arp(ip);
        if let Some(target) = self.inner.medium.lookup(ip) {
            target.deliver_udp(source, dest.port(), &data);
        }
        Ok(())
    }

    /// Take the next datagram; its source is available via [`Packet::source`].
    pub async fn udp_receive(&self, ep: &Arc<UdpEndpoint>, timeout: Timeout) -> Result<Packet> {
        wait_until(&ep.notify, timeout, || {
            let mut q = ep.lock();
            if let Some(p) = q.packets.pop_front() {
                return Some(Ok(p));
            }
            q.closed.then(|| Err(NetError::failed("udp socket closed")))
        })
        .await
    }
}

/// Broadcast address of a subnet.
pub fn subnet_broadcast(address: Ipv4Addr, netmask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(address) | !u32::from(netmask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::address::{Interface, IpSettings};
    use crate::net::stack::{Medium, StackOptions};
    use crate::packet::PacketPool;
    use std::time::Duration;

    fn stack(medium: &Medium, last: u8, rx: usize) -> IpStack {
        let s = IpStack::create(
            Interface::Station,
            medium.clone(),
            PacketPool::new("rx", rx, 1536),
            StackOptions::default(),
            Some(IpSettings::new(
                Ipv4Addr::new(10, 0, 0, last),
                Ipv4Addr::new(255, 255, 255, 0),
                Ipv4Addr::new(10, 0, 0, 1),
            )),
        );
        s.enable(Protocol::Udp).unwrap();
        s
    }

    fn datagram(pool: &PacketPool, data: &[u8]) -> Packet {
        pool.try_packet_from_slice(PacketKind::Udp, data).unwrap()
    }

    #[tokio::test]
    async fn datagram_carries_source() {
        let medium = Medium::new();
        let a = stack(&medium, 2, 4);
        let b = stack(&medium, 3, 4);
        let tx = PacketPool::new("tx", 4, 1536);

        let sender = a.udp_bind(SocketId::new(), 0).unwrap();
        let receiver = b.udp_bind(SocketId::new(), 5000).unwrap();

        a.udp_send(&sender, SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), 5000), datagram(&tx, b"ping"))
            .unwrap();
        let got = b.udp_receive(&receiver, Timeout::NoWait).await.unwrap();
        assert_eq!(got.to_vec(), b"ping");
        assert_eq!(
            got.source(),
            Some(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), sender.port()))
        );
    }

    #[tokio::test]
    async fn full_rx_pool_drops_instead_of_blocking() {
        let medium = Medium::new();
        let a = stack(&medium, 2, 4);
        let b = stack(&medium, 3, 1);
        let tx = PacketPool::new("tx", 4, 1536);
        let sender = a.udp_bind(SocketId::new(), 0).unwrap();
        let receiver = b.udp_bind(SocketId::new(), 5000).unwrap();
        let dest = SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 3), 5000);

        a.udp_send(&sender, dest, datagram(&tx, b"one")).unwrap();
        a.udp_send(&sender, dest, datagram(&tx, b"two")).unwrap();
        assert_eq!(receiver.queued(), 1);
    }

    #[tokio::test]
    async fn multicast_reaches_members_only() {
        let medium = Medium::new();
        let a = stack(&medium, 2, 4);
        let b = stack(&medium, 3, 4);
        let c = stack(&medium, 4, 4);
        let group = Ipv4Addr::new(239, 0, 0, 9);
        b.enable(Protocol::Igmp).unwrap();
        b.join_group(group).unwrap();

        let tx = PacketPool::new("tx", 4, 1536);
        let sender = a.udp_bind(SocketId::new(), 0).unwrap();
        let rb = b.udp_bind(SocketId::new(), 6000).unwrap();
        let rc = c.udp_bind(SocketId::new(), 6000).unwrap();
        a.udp_send(&sender, SocketAddrV4::new(group, 6000), datagram(&tx, b"hello"))
            .unwrap();
        assert_eq!(rb.queued(), 1);
        assert_eq!(rc.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_times_out() {
        let medium = Medium::new();
        let b = stack(&medium, 3, 4);
        let r = b.udp_bind(SocketId::new(), 7000).unwrap();
        let result = b
            .udp_receive(&r, Timeout::After(Duration::from_millis(20)))
            .await;
        assert!(matches!(result, Err(NetError::Timeout)));
    }

    #[test]
    fn broadcast_address() {
        assert_eq!(
            subnet_broadcast(Ipv4Addr::new(192, 168, 4, 1), Ipv4Addr::new(255, 255, 255, 0)),
            Ipv4Addr::new(192, 168, 4, 255)
        );
    }
}
