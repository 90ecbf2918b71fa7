//! In-process IPv4 protocol stack.
//!
//! # Architecture
//!
//! ```text
//! +-------------+      +----------------------+      +-------------+
//! |  IpStack    | <--> |  Medium              | <--> |  IpStack    |
//! |  (device A) |      |  address → stack map |      |  (device B) |
//! +------+------+      +----------------------+      +------+------+
//!        |                                                  |
//!        v                                                  v
//!  TcpEndpoint / UdpEndpoint                   rx pool → endpoint queue
//! ```
//!
//! One `IpStack` exists per interface that is up. Sending copies payload
//! into packets taken from the *receiving* stack's rx pool, segmented by
//! MSS, and queues them on the destination endpoint; the destination's
//! event hook runs on the sender's task, which is the driver context.
//!
//! # Design Decisions
//! - Lock order: stack state before endpoint state; hooks run with no lock held
//! - Protocols must be enabled before use, mirroring the bring-up sequence
//! - A periodic timer ages the ARP cache and ticks TCP; suspend freezes both

mod medium;
mod tcp;
mod udp;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::schema::NetConfig;
use crate::error::{NetError, Result};
use crate::lifecycle::Shutdown;
use crate::net::address::{Interface, IpSettings};
use crate::packet::PacketPool;
use crate::resilience::timeouts::{wait_until, Timeout};

pub use medium::Medium;
pub use tcp::{TcpEndpoint, TcpPhase};
pub use udp::UdpEndpoint;

use tcp::ListenEntry;

const EPHEMERAL_PORT_START: u16 = 49152;
const EPHEMERAL_PORT_END: u16 = 65535;

/// Protocol features enabled during bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Arp,
    Tcp,
    Udp,
    Icmp,
    Igmp,
    Fragmentation,
}

/// Notification raised on an endpoint from the delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEvent {
    /// A peer is waiting in the listen backlog.
    ConnectRequest,
    /// Data was queued on the endpoint.
    DataReceived,
    /// The peer closed the connection.
    Disconnected,
}

/// Runs on the delivery path; must not block.
pub type EventHook = Arc<dyn Fn(StackEvent) + Send + Sync>;

/// Called when the interface address changes (`None` when removed).
pub type AddressHook = Arc<dyn Fn(Option<Ipv4Addr>) + Send + Sync>;

/// Sizing and timing knobs, taken from [`NetConfig`].
#[derive(Debug, Clone)]
pub struct StackOptions {
    pub mss: usize,
    pub listen_queue: usize,
    pub receive_window: usize,
    pub udp_queue_depth: usize,
    pub arp_cache_size: usize,
    pub arp_lifetime: Duration,
    pub timer_period: Duration,
}

impl StackOptions {
    pub fn from_config(config: &NetConfig) -> Self {
        Self {
            mss: config.tcp.mss,
            listen_queue: config.tcp.listen_queue,
            receive_window: config.tcp.receive_window,
            udp_queue_depth: config.udp.queue_depth,
            arp_cache_size: config.network.arp_cache_size,
            arp_lifetime: Duration::from_secs(config.network.arp_entry_lifetime_secs),
            timer_period: Duration::from_millis(config.network.timer_period_ms),
        }
    }
}

impl Default for StackOptions {
    fn default() -> Self {
        Self::from_config(&NetConfig::default())
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Features {
    arp: bool,
    tcp: bool,
    udp: bool,
    icmp: bool,
    igmp: bool,
    fragmentation: bool,
}

struct StackState {
    settings: Option<IpSettings>,
    features: Features,
    tcp_ports: HashSet<u16>,
    listeners: HashMap<u16, ListenEntry>,
    udp: HashMap<u16, Arc<UdpEndpoint>>,
    arp: HashMap<Ipv4Addr, Instant>,
    groups: HashSet<Ipv4Addr>,
}

pub(crate) struct StackInner {
    interface: Interface,
    medium: Medium,
    rx_pool: PacketPool,
    options: StackOptions,
    link_up: AtomicBool,
    ip_suspended: AtomicBool,
    tcp_suspended: AtomicBool,
    deleted: AtomicBool,
    next_ephemeral: AtomicU16,
    timer_ticks: AtomicU64,
    tcp_ticks: AtomicU64,
    state: Mutex<StackState>,
    address_notify: Notify,
    address_hook: Mutex<Option<AddressHook>>,
    shutdown: Shutdown,
}

/// Handle to one interface's stack. Clones share the same stack.
#[derive(Clone)]
pub struct IpStack {
    inner: Arc<StackInner>,
}

impl IpStack {
    /// Create the stack and start its timer. `settings` is `None` for DHCP.
    pub fn create(
        interface: Interface,
        medium: Medium,
        rx_pool: PacketPool,
        options: StackOptions,
        settings: Option<IpSettings>,
    ) -> Self {
        let inner = Arc::new(StackInner {
            interface,
            medium,
            rx_pool,
            next_ephemeral: AtomicU16::new(fastrand::u16(..)),
            options,
            link_up: AtomicBool::new(true),
            ip_suspended: AtomicBool::new(false),
            tcp_suspended: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            timer_ticks: AtomicU64::new(0),
            tcp_ticks: AtomicU64::new(0),
            state: Mutex::new(StackState {
                settings: None,
                features: Features::default(),
                tcp_ports: HashSet::new(),
                listeners: HashMap::new(),
                udp: HashMap::new(),
                arp: HashMap::new(),
                groups: HashSet::new(),
            }),
            address_notify: Notify::new(),
            address_hook: Mutex::new(None),
            shutdown: Shutdown::new(),
        });
        let stack = Self { inner };
        if let Some(settings) = settings {
            stack.set_address(Some(settings));
        }
        stack.spawn_timer();
        tracing::debug!(interface = %interface, "ip stack created");
        stack
    }

    pub fn interface(&self) -> Interface {
        self.inner.interface
    }

    pub fn medium(&self) -> &Medium {
        &self.inner.medium
    }

    pub fn options(&self) -> &StackOptions {
        &self.inner.options
    }

    pub fn mss(&self) -> usize {
        self.inner.options.mss
    }

    pub fn rx_pool(&self) -> &PacketPool {
        &self.inner.rx_pool
    }

    /// Enable one protocol feature.
    pub fn enable(&self, protocol: Protocol) -> Result<()> {
        self.ensure_alive()?;
        let mut state = self.inner.lock_state();
        let f = &mut state.features;
        match protocol {
            Protocol::Arp => f.arp = true,
            Protocol::Tcp => f.tcp = true,
            Protocol::Udp => f.udp = true,
            Protocol::Icmp => f.icmp = true,
            Protocol::Igmp => f.igmp = true,
            Protocol::Fragmentation => f.fragmentation = true,
        }
        tracing::trace!(interface = %self.inner.interface, ?protocol, "protocol enabled");
        Ok(())
    }

    pub fn is_enabled(&self, protocol: Protocol) -> bool {
        let f = self.inner.lock_state().features;
        match protocol {
            Protocol::Arp => f.arp,
            Protocol::Tcp => f.tcp,
            Protocol::Udp => f.udp,
            Protocol::Icmp => f.icmp,
            Protocol::Igmp => f.igmp,
            Protocol::Fragmentation => f.fragmentation,
        }
    }

    pub fn is_link_up(&self) -> bool {
        self.inner.link_up.load(Ordering::SeqCst)
    }

    pub fn set_link(&self, up: bool) {
        self.inner.link_up.store(up, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.inner.deleted.load(Ordering::SeqCst)
    }

    // ---- addressing ----

    pub fn settings(&self) -> Option<IpSettings> {
        self.inner.lock_state().settings
    }

    /// Current unicast address, if one is assigned.
    pub fn address(&self) -> Option<Ipv4Addr> {
        self.settings()
            .map(|s| s.address)
            .filter(|a| !a.is_unspecified())
    }

    /// Assign or remove the interface address and re-register on the medium.
    pub fn set_address(&self, settings: Option<IpSettings>) {
        let settings = settings.filter(|s| !s.address.is_unspecified());
        let previous = {
            let mut state = self.inner.lock_state();
            std::mem::replace(&mut state.settings, settings)
        };
        if let Some(old) = previous {
            self.inner.medium.detach(old.address, &self.inner);
        }
        if let Some(new) = settings {
            if !self.is_deleted() {
                self.inner.medium.attach(new.address, &self.inner);
            }
        }
        tracing::info!(
            interface = %self.inner.interface,
            address = ?settings.map(|s| s.address),
            "interface address changed"
        );
        self.inner.address_notify.notify_one();

        let hook = self.inner.address_hook.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if let Some(hook) = hook {
            hook(settings.map(|s| s.address));
        }
    }

    /// Install the address-change hook.
    pub fn on_address_change(&self, hook: Option<AddressHook>) {
        *self.inner.address_hook.lock().unwrap_or_else(|e| e.into_inner()) = hook;
    }

    /// Wait until an address is assigned.
    pub async fn wait_for_address(&self, timeout: Timeout) -> Result<Ipv4Addr> {
        wait_until(&self.inner.address_notify, timeout, || {
            if self.is_deleted() {
                return Some(Err(NetError::failed("interface deleted")));
            }
            self.address().map(Ok)
        })
        .await
    }

    // ---- ARP ----

    pub(crate) fn record_arp(&self, address: Ipv4Addr) {
        let mut state = self.inner.lock_state();
        if !state.features.arp {
            return;
        }
        if !state.arp.contains_key(&address) && state.arp.len() >= self.inner.options.arp_cache_size {
            if let Some(oldest) = state.arp.iter().min_by_key(|(_, at)| **at).map(|(a, _)| *a) {
                state.arp.remove(&oldest);
            }
        }
        state.arp.insert(address, Instant::now());
    }

    pub fn arp_entries(&self) -> usize {
        self.inner.lock_state().arp.len()
    }

    /// Drop every ARP entry.
    pub fn invalidate_arp(&self) {
        let removed = {
            let mut state = self.inner.lock_state();
            let n = state.arp.len();
            state.arp.clear();
            n
        };
        tracing::debug!(interface = %self.inner.interface, removed, "arp cache invalidated");
    }

    // ---- ICMP / IGMP ----

    /// Echo request to `target`; returns the round-trip time.
    pub async fn ping(&self, target: Ipv4Addr, timeout: Timeout) -> Result<Duration> {
        self.ensure_ready()?;
        if !self.is_enabled(Protocol::Icmp) {
            return Err(NetError::failed("icmp not enabled"));
        }
        let start = Instant::now();
        self.record_arp(target);
        let reachable = self
            .inner
            .medium
            .lookup(target)
            .map(|peer| {
                let state = peer.lock_state();
                state.features.icmp && peer.link_up.load(Ordering::SeqCst)
            })
            .unwrap_or(false);
        if reachable {
            return Ok(start.elapsed());
        }
        if let Some(deadline) = timeout.deadline() {
            tokio::time::sleep_until(deadline).await;
        }
        Err(NetError::Timeout)
    }

    pub fn join_group(&self, group: Ipv4Addr) -> Result<()> {
        self.ensure_link()?;
        if !group.is_multicast() {
            return Err(NetError::InvalidArgument(format!("{group} is not multicast")));
        }
        let mut state = self.inner.lock_state();
        if !state.features.igmp {
            return Err(NetError::failed("igmp not enabled"));
        }
        state.groups.insert(group);
        Ok(())
    }

    pub fn leave_group(&self, group: Ipv4Addr) -> Result<()> {
        self.ensure_link()?;
        let mut state = self.inner.lock_state();
        if state.groups.remove(&group) {
            Ok(())
        } else {
            Err(NetError::failed(format!("not a member of {group}")))
        }
    }

    pub fn is_member(&self, group: Ipv4Addr) -> bool {
        self.inner.lock_state().groups.contains(&group)
    }

    // ---- suspend ----

    pub fn suspend_ip(&self) {
        self.inner.ip_suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume_ip(&self) {
        self.inner.ip_suspended.store(false, Ordering::SeqCst);
    }

    pub fn suspend_tcp(&self) {
        self.inner.tcp_suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume_tcp(&self) {
        self.inner.tcp_suspended.store(false, Ordering::SeqCst);
    }

    /// IP timer ticks processed (frozen while IP is suspended).
    pub fn timer_ticks(&self) -> u64 {
        self.inner.timer_ticks.load(Ordering::SeqCst)
    }

    /// TCP timer ticks processed (frozen while TCP is suspended).
    pub fn tcp_ticks(&self) -> u64 {
        self.inner.tcp_ticks.load(Ordering::SeqCst)
    }

    /// Tear the stack down: stop timers, leave the medium, refuse pending peers.
    pub fn delete(&self) {
        if self.inner.deleted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.trigger();
        let (settings, listeners, udp) = {
            let mut state = self.inner.lock_state();
            state.tcp_ports.clear();
            state.arp.clear();
            state.groups.clear();
            (
                state.settings.take(),
                std::mem::take(&mut state.listeners),
                std::mem::take(&mut state.udp),
            )
        };
        if let Some(s) = settings {
            self.inner.medium.detach(s.address, &self.inner);
        }
        for (_, entry) in listeners {
            entry.refuse_all();
        }
        for (_, endpoint) in udp {
            endpoint.close();
        }
        self.inner.address_notify.notify_one();
        tracing::debug!(interface = %self.inner.interface, "ip stack deleted");
    }

    // ---- internals ----

    fn ensure_alive(&self) -> Result<()> {
        if self.is_deleted() {
            Err(NetError::failed("interface deleted"))
        } else {
            Ok(())
        }
    }

    fn ensure_protocol(&self, protocol: Protocol) -> Result<()> {
        if self.is_enabled(protocol) {
            Ok(())
        } else {
            Err(NetError::failed(format!("{protocol:?} not enabled")))
        }
    }

    /// Alive, link up and addressed.
    fn ensure_link(&self) -> Result<()> {
        self.ensure_alive()?;
        if self.is_link_up() {
            Ok(())
        } else {
            Err(NetError::LinkDown)
        }
    }

    fn ensure_ready(&self) -> Result<Ipv4Addr> {
        self.ensure_link()?;
        self.address()
            .ok_or_else(|| NetError::failed("interface has no address"))
    }

    fn allocate_ephemeral(&self, in_use: impl Fn(u16) -> bool) -> Result<u16> {
        let range = EPHEMERAL_PORT_END - EPHEMERAL_PORT_START + 1;
        for _ in 0..range {
            let seed = self.inner.next_ephemeral.fetch_add(1, Ordering::Relaxed);
            let candidate = EPHEMERAL_PORT_START + (seed % range);
            if !in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(NetError::failed("no free ephemeral ports"))
    }

    fn spawn_timer(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut stop = self.inner.shutdown.subscribe();
        let period = self.inner.options.timer_period;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.on_timer();
                    }
                    _ = stop.recv() => break,
                }
            }
        });
    }
}

impl StackInner {
    fn lock_state(&self) -> MutexGuard<'_, StackState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn on_timer(&self) {
        if !self.ip_suspended.load(Ordering::SeqCst) {
            self.timer_ticks.fetch_add(1, Ordering::SeqCst);
            let lifetime = self.options.arp_lifetime;
            let now = Instant::now();
            self.lock_state()
                .arp
                .retain(|_, at| now.duration_since(*at) < lifetime);
        }
        if !self.tcp_suspended.load(Ordering::SeqCst) {
            self.tcp_ticks.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl std::fmt::Debug for IpStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpStack")
            .field("interface", &self.inner.interface)
            .field("address", &self.address())
            .field("link_up", &self.is_link_up())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(last: u8) -> IpSettings {
        IpSettings::new(
            Ipv4Addr::new(10, 0, 0, last),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(10, 0, 0, 1),
        )
    }

    fn stack(medium: &Medium, last: Option<u8>) -> IpStack {
        IpStack::create(
            Interface::Station,
            medium.clone(),
            PacketPool::new("rx", 7, 1536),
            StackOptions::default(),
            last.map(settings),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn address_wait_completes_when_assigned() {
        let medium = Medium::new();
        let s = stack(&medium, None);
        let waiter = {
            let s = s.clone();
            tokio::spawn(async move { s.wait_for_address(Timeout::After(Duration::from_secs(5))).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        s.set_address(Some(settings(9)));
        assert_eq!(waiter.await.unwrap().unwrap(), Ipv4Addr::new(10, 0, 0, 9));
        assert!(medium.lookup(Ipv4Addr::new(10, 0, 0, 9)).is_some());
    }

    #[tokio::test]
    async fn arp_cache_is_bounded_and_invalidated() {
        let medium = Medium::new();
        let s = stack(&medium, Some(2));
        s.record_arp(Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(s.arp_entries(), 0, "arp disabled");

        s.enable(Protocol::Arp).unwrap();
        for i in 0..40u8 {
            s.record_arp(Ipv4Addr::new(10, 0, 1, i));
        }
        assert_eq!(s.arp_entries(), StackOptions::default().arp_cache_size);
        s.invalidate_arp();
        assert_eq!(s.arp_entries(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_timers_do_not_tick() {
        let medium = Medium::new();
        let s = stack(&medium, Some(2));
        tokio::time::sleep(Duration::from_millis(350)).await;
        let before = (s.timer_ticks(), s.tcp_ticks());
        assert!(before.0 > 0);

        s.suspend_ip();
        s.suspend_tcp();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!((s.timer_ticks(), s.tcp_ticks()), before);

        s.resume_ip();
        s.resume_tcp();
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert!(s.timer_ticks() > before.0);
    }

    #[tokio::test(start_paused = true)]
    async fn ping_reaches_icmp_enabled_peer_only() {
        let medium = Medium::new();
        let a = stack(&medium, Some(2));
        let b = stack(&medium, Some(3));
        a.enable(Protocol::Icmp).unwrap();

        let timeout = Timeout::After(Duration::from_millis(200));
        assert!(matches!(
            a.ping(Ipv4Addr::new(10, 0, 0, 3), timeout).await,
            Err(NetError::Timeout)
        ));
        b.enable(Protocol::Icmp).unwrap();
        assert!(a.ping(Ipv4Addr::new(10, 0, 0, 3), timeout).await.is_ok());
    }

    #[tokio::test]
    async fn multicast_membership_requires_igmp() {
        let medium = Medium::new();
        let s = stack(&medium, Some(2));
        let group = Ipv4Addr::new(239, 1, 2, 3);
        assert!(s.join_group(group).is_err());
        s.enable(Protocol::Igmp).unwrap();
        s.join_group(group).unwrap();
        assert!(s.is_member(group));
        assert!(matches!(
            s.join_group(Ipv4Addr::new(10, 0, 0, 1)),
            Err(NetError::InvalidArgument(_))
        ));
        s.leave_group(group).unwrap();
        assert!(s.leave_group(group).is_err());
    }

    #[tokio::test]
    async fn multicast_membership_is_gated_on_link() {
        let medium = Medium::new();
        let s = stack(&medium, Some(2));
        let group = Ipv4Addr::new(239, 1, 2, 3);
        s.enable(Protocol::Igmp).unwrap();
        s.join_group(group).unwrap();

        s.set_link(false);
        assert!(matches!(s.join_group(Ipv4Addr::new(239, 9, 9, 9)), Err(NetError::LinkDown)));
        assert!(matches!(s.leave_group(group), Err(NetError::LinkDown)));
        assert!(s.is_member(group));

        s.set_link(true);
        s.leave_group(group).unwrap();
    }

    #[tokio::test]
    async fn delete_detaches_from_medium() {
        let medium = Medium::new();
        let s = stack(&medium, Some(2));
        s.delete();
        assert!(medium.lookup(Ipv4Addr::new(10, 0, 0, 2)).is_none());
        assert!(s.enable(Protocol::Tcp).is_err());
    }
}
