//! Interface lifecycle: bring-up, bring-down, suspend/resume and link events.
//!
//! # Bring-up sequence
//! ```text
//! join (station, with retry) / start AP
//!   → create stack → enable ARP, TCP, UDP, ICMP, IGMP, fragmentation
//!   → static address | DHCP client | static address + DHCP server
//!   → wait for address → mark up
//! ```
//! Any failure unwinds every step already taken. Bring-down runs the same
//! steps in reverse and keeps going past failures, logging each one.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use super::collaborators::{DhcpState, Services};
use super::events::{
    AddressCallback, LinkCallback, LinkEvent, Subscribers, SubscriptionId,
};
use super::shutdown::Shutdown;
use crate::config::schema::NetConfig;
use crate::config::validation::validate_config;
use crate::error::{NetError, Result};
use crate::net::address::{Addressing, Interface, IpSettings};
use crate::net::callbacks::CallbackRegistry;
use crate::net::connection::ConnectionTracker;
use crate::net::stack::{IpStack, Medium, Protocol, StackOptions};
use crate::net::{SocketResources, TcpSocket, UdpSocket};
use crate::observability::metrics;
use crate::packet::PacketPool;
use crate::resilience::backoff::JoinRetry;
use crate::resilience::timeouts::Timeout;
use crate::tls::{SessionCache, TlsIdentity, TlsSettings};

/// Fallback resolver added next to the lease's DNS server.
const PUBLIC_DNS: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

const PROTOCOLS: [Protocol; 6] = [
    Protocol::Arp,
    Protocol::Tcp,
    Protocol::Udp,
    Protocol::Icmp,
    Protocol::Igmp,
    Protocol::Fragmentation,
];

#[derive(Clone)]
struct InterfaceEntry {
    stack: IpStack,
    addressing: Addressing,
}

/// Owns the pools, registries and interfaces of one device.
///
/// Must be created inside a Tokio runtime: the socket event worker is
/// spawned by [`NetworkManager::new`] and stopped by [`shutdown`](Self::shutdown).
pub struct NetworkManager {
    config: Arc<NetConfig>,
    medium: Medium,
    services: Services,
    tx_pool: PacketPool,
    rx_pool: PacketPool,
    registry: Arc<CallbackRegistry>,
    tracker: ConnectionTracker,
    sessions: SessionCache,
    interfaces: Mutex<HashMap<Interface, InterfaceEntry>>,
    // Serializes bring-up and bring-down.
    lifecycle: tokio::sync::Mutex<()>,
    link_subscribers: Arc<Subscribers<LinkCallback>>,
    address_subscribers: Arc<Subscribers<AddressCallback>>,
    suspended_at: Mutex<Option<Instant>>,
    shutdown: Shutdown,
}

impl NetworkManager {
    /// Validate `config` and allocate the pools and registries.
    pub fn new(config: NetConfig, medium: Medium, services: Services) -> Result<Self> {
        if let Err(errors) = validate_config(&config) {
            let joined = errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(NetError::Config(joined));
        }

        let shutdown = Shutdown::new();
        let pools = &config.pools;
        let registry = CallbackRegistry::new(
            config.sockets.max_with_callbacks,
            config.sockets.event_queue_depth,
            &shutdown,
        );
        let manager = Self {
            tx_pool: PacketPool::new("tx", pools.tx_buffers, pools.buffer_size),
            rx_pool: PacketPool::new("rx", pools.rx_buffers, pools.buffer_size),
            registry,
            tracker: ConnectionTracker::new(),
            sessions: SessionCache::new(
                config.tls.session_cache_size,
                Duration::from_secs(config.tls.session_lifetime_secs),
            ),
            interfaces: Mutex::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            link_subscribers: Arc::new(Subscribers::new(
                "link subscribers",
                config.network.max_link_subscribers,
            )),
            address_subscribers: Arc::new(Subscribers::new(
                "address subscribers",
                config.network.max_address_subscribers,
            )),
            suspended_at: Mutex::new(None),
            config: Arc::new(config),
            medium,
            services,
            shutdown,
        };
        tracing::debug!(
            tx_buffers = manager.config.pools.tx_buffers,
            rx_buffers = manager.config.pools.rx_buffers,
            "network manager initialized"
        );
        Ok(manager)
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    pub fn medium(&self) -> &Medium {
        &self.medium
    }

    pub fn tx_pool(&self) -> &PacketPool {
        &self.tx_pool
    }

    pub fn rx_pool(&self) -> &PacketPool {
        &self.rx_pool
    }

    // ---- bring-up / bring-down ----

    /// Bring `interface` up. Calling it on an interface that is already up
    /// does nothing and succeeds.
    pub async fn bring_up(&self, interface: Interface, addressing: Addressing) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.is_up(interface) {
            tracing::debug!(%interface, "interface already up");
            return Ok(());
        }
        match (interface, &addressing) {
            (Interface::Station, Addressing::InternalDhcpServer(_))
            | (Interface::AccessPoint, Addressing::ExternalDhcp) => {
                return Err(NetError::InvalidArgument(format!(
                    "{addressing:?} is not valid on {interface}"
                )));
            }
            _ => {}
        }

        self.associate(interface).await?;

        let stack = IpStack::create(
            interface,
            self.medium.clone(),
            self.rx_pool.clone(),
            StackOptions::from_config(&self.config),
            None,
        );
        let entry = InterfaceEntry { stack, addressing };
        if let Err(err) = self.configure(interface, &entry).await {
            tracing::warn!(%interface, error = %err, "bring-up failed, unwinding");
            self.teardown(interface, &entry);
            return Err(err);
        }

        if entry.addressing.uses_dhcp_client() {
            self.add_lease_dns();
        }
        let address = entry.stack.address();
        self.lock_interfaces().insert(interface, entry);
        metrics::set_interface_up(interface.as_str(), true);
        tracing::info!(%interface, address = ?address, "interface up");
        Ok(())
    }

    /// Take `interface` down. Every step runs even if an earlier one fails.
    pub async fn bring_down(&self, interface: Interface) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        let Some(entry) = self.lock_interfaces().remove(&interface) else {
            tracing::debug!(%interface, "interface already down");
            return Ok(());
        };
        self.teardown(interface, &entry);
        metrics::set_interface_up(interface.as_str(), false);
        tracing::info!(%interface, "interface down");
        Ok(())
    }

    pub fn is_up(&self, interface: Interface) -> bool {
        self.lock_interfaces().contains_key(&interface)
    }

    async fn associate(&self, interface: Interface) -> Result<()> {
        match interface {
            Interface::AccessPoint => self.services.join.start_access_point(),
            Interface::Station => self.join_with_retry().await,
        }
    }

    async fn join_with_retry(&self) -> Result<()> {
        let network = &self.config.network;
        let retry = JoinRetry::from_config(network);
        let mut last_error = None;
        for attempt in 0..retry.attempts() {
            retry.pause(attempt).await;
            match self.services.join.join(None).await {
                Ok(()) => {
                    tracing::debug!(attempt = attempt + 1, "joined network");
                    return Ok(());
                }
                Err(err) => {
                    tracing::debug!(attempt = attempt + 1, error = %err, "join attempt failed");
                    last_error = Some(err);
                }
            }
        }

        if let Some(security) = network.join_fallback {
            tracing::warn!(?security, "join failed, retrying with fallback security");
            return self.services.join.join(Some(security)).await;
        }
        Err(last_error.unwrap_or_else(|| NetError::failed("join failed")))
    }

    async fn configure(&self, interface: Interface, entry: &InterfaceEntry) -> Result<()> {
        let stack = &entry.stack;
        for protocol in PROTOCOLS {
            stack.enable(protocol)?;
        }

        let subscribers = Arc::clone(&self.address_subscribers);
        stack.on_address_change(Some(Arc::new(move |address| {
            subscribers.dispatch(interface, address);
        })));

        match entry.addressing {
            Addressing::Static(settings) => stack.set_address(Some(settings)),
            Addressing::ExternalDhcp => self.services.dhcp_client.start(stack)?,
            Addressing::InternalDhcpServer(settings) => {
                stack.set_address(Some(settings));
                self.services.dhcp_server.start(stack, settings)?;
            }
        }

        stack
            .wait_for_address(self.config.network.address_resolution_timeout())
            .await?;
        Ok(())
    }

    fn add_lease_dns(&self) {
        let lease_dns = self.services.dhcp_client.lease().and_then(|l| l.dns_server);
        for server in lease_dns.into_iter().chain([PUBLIC_DNS]) {
            log_failure("dns add server", self.services.dns.add_server(server));
        }
    }

    fn teardown(&self, interface: Interface, entry: &InterfaceEntry) {
        match entry.addressing {
            Addressing::ExternalDhcp => {
                log_failure("dhcp client stop", self.services.dhcp_client.stop());
                self.services.dns.remove_all_servers();
            }
            Addressing::InternalDhcpServer(_) => {
                log_failure("dhcp server stop", self.services.dhcp_server.stop());
            }
            Addressing::Static(_) => {}
        }
        if entry.stack.address().is_some() {
            entry.stack.set_address(None);
        }
        entry.stack.on_address_change(None);
        entry.stack.delete();
        match interface {
            Interface::Station => log_failure("leave", self.services.join.leave()),
            Interface::AccessPoint => {
                log_failure("stop access point", self.services.join.stop_access_point())
            }
        }
    }

    // ---- suspend / resume ----

    /// Freeze IP and TCP timers and the DHCP client.
    ///
    /// Refused while any TCP connection is open, or while DHCP is in use
    /// without a bound lease.
    ///
    /// # Panics
    /// If already suspended.
    pub fn suspend(&self) -> Result<()> {
        let mut suspended_at = lock(&self.suspended_at);
        assert!(suspended_at.is_none(), "suspend called while already suspended");

        let active = self.tracker.active_count();
        if active > 0 {
            return Err(NetError::failed(format!(
                "cannot suspend with {active} open tcp connections"
            )));
        }
        let entries = self.entries();
        let uses_dhcp = entries.iter().any(|(_, e)| e.addressing.uses_dhcp_client());
        if uses_dhcp && self.services.dhcp_client.state() != DhcpState::Bound {
            return Err(NetError::failed("cannot suspend without a bound dhcp lease"));
        }

        for (_, entry) in &entries {
            entry.stack.suspend_ip();
            entry.stack.suspend_tcp();
        }
        if uses_dhcp {
            self.services.dhcp_client.suspend();
        }
        *suspended_at = Some(Instant::now());
        tracing::info!(interfaces = entries.len(), "network suspended");
        Ok(())
    }

    /// Undo [`suspend`](Self::suspend) and charge the time spent suspended
    /// against the DHCP lease. Returns that time.
    ///
    /// # Panics
    /// If not suspended.
    pub fn resume(&self) -> Duration {
        let mut suspended_at = lock(&self.suspended_at);
        assert!(suspended_at.is_some(), "resume called without a matching suspend");
        let elapsed = suspended_at.take().map(|at| at.elapsed()).unwrap_or_default();

        let entries = self.entries();
        for (_, entry) in &entries {
            entry.stack.resume_ip();
            entry.stack.resume_tcp();
        }
        if entries.iter().any(|(_, e)| e.addressing.uses_dhcp_client()) {
            self.services.dhcp_client.resume();
            self.services.dhcp_client.update_time_remaining(elapsed);
        }
        tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "network resumed");
        elapsed
    }

    pub fn is_suspended(&self) -> bool {
        lock(&self.suspended_at).is_some()
    }

    // ---- events ----

    /// Feed a driver link event for `interface`.
    pub fn handle_link_event(&self, interface: Interface, event: LinkEvent) {
        let Some(entry) = self.entry(interface) else {
            tracing::debug!(%interface, ?event, "link event for interface that is down");
            return;
        };
        let dhcp = entry.addressing.uses_dhcp_client();
        match event {
            LinkEvent::Down => {
                entry.stack.set_link(false);
                if dhcp {
                    log_failure("dhcp client stop", self.services.dhcp_client.stop());
                }
                entry.stack.invalidate_arp();
            }
            LinkEvent::Up => {
                entry.stack.set_link(true);
                if dhcp {
                    log_failure("dhcp reinitialize", self.services.dhcp_client.reinitialize());
                    log_failure("dhcp client start", self.services.dhcp_client.start(&entry.stack));
                }
            }
        }
        metrics::set_interface_up(interface.as_str(), event == LinkEvent::Up);
        tracing::info!(%interface, ?event, "link event");
        self.link_subscribers.dispatch(interface, event);
    }

    /// Force a DHCP renew on `interface`.
    pub fn renew(&self, interface: Interface) -> Result<()> {
        let entry = self.require(interface)?;
        if !entry.addressing.uses_dhcp_client() {
            return Err(NetError::failed(format!("{interface} does not use dhcp")));
        }
        self.services.dhcp_client.force_renew()
    }

    pub fn subscribe_link(
        &self,
        callback: impl Fn(Interface, LinkEvent) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        self.link_subscribers.subscribe(Arc::new(callback))
    }

    /// Remove the subscription `id` returned by [`subscribe_link`](Self::subscribe_link).
    ///
    /// Closures cannot be compared, so the handle stands in for matching
    /// on callback and argument. Returns false if `id` is not registered.
    pub fn unsubscribe_link(&self, id: SubscriptionId) -> bool {
        self.link_subscribers.unsubscribe(id)
    }

    pub fn subscribe_address(
        &self,
        callback: impl Fn(Interface, Option<Ipv4Addr>) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        self.address_subscribers.subscribe(Arc::new(callback))
    }

    /// Remove the subscription `id` returned by
    /// [`subscribe_address`](Self::subscribe_address). See [`unsubscribe_link`](Self::unsubscribe_link).
    pub fn unsubscribe_address(&self, id: SubscriptionId) -> bool {
        self.address_subscribers.unsubscribe(id)
    }

    // ---- queries ----

    /// Resolve `hostname`; dotted-quad strings are parsed without DNS.
    ///
    /// Fails with `LinkDown` while the station link is down.
    pub async fn hostname_lookup(&self, hostname: &str, timeout: Timeout) -> Result<Ipv4Addr> {
        if self
            .entry(Interface::Station)
            .is_some_and(|e| !e.stack.is_link_up())
        {
            return Err(NetError::LinkDown);
        }
        if let Ok(address) = hostname.parse::<Ipv4Addr>() {
            return Ok(address);
        }
        self.services.dns.lookup(hostname, timeout).await
    }

    /// Echo request; returns the round-trip time.
    pub async fn ping(&self, interface: Interface, target: IpAddr, timeout: Timeout) -> Result<Duration> {
        let IpAddr::V4(target) = target else {
            return Err(NetError::Unsupported);
        };
        self.require(interface)?.stack.ping(target, timeout).await
    }

    pub fn multicast_join(&self, interface: Interface, group: IpAddr) -> Result<()> {
        let IpAddr::V4(group) = group else {
            return Err(NetError::Unsupported);
        };
        self.require(interface)?.stack.join_group(group)
    }

    pub fn multicast_leave(&self, interface: Interface, group: IpAddr) -> Result<()> {
        let IpAddr::V4(group) = group else {
            return Err(NetError::Unsupported);
        };
        self.require(interface)?.stack.leave_group(group)
    }

    pub fn ipv4_address(&self, interface: Interface) -> Option<Ipv4Addr> {
        self.entry(interface).and_then(|e| e.stack.address())
    }

    pub fn netmask(&self, interface: Interface) -> Option<Ipv4Addr> {
        self.settings(interface).map(|s| s.netmask)
    }

    pub fn gateway(&self, interface: Interface) -> Option<Ipv4Addr> {
        self.settings(interface).map(|s| s.gateway)
    }

    /// Stack of an interface that is up.
    pub fn stack(&self, interface: Interface) -> Option<IpStack> {
        self.entry(interface).map(|e| e.stack)
    }

    pub fn active_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    // ---- sockets ----

    /// A fresh TCP socket on `interface`.
    pub fn tcp_socket(&self, interface: Interface) -> Result<TcpSocket> {
        Ok(TcpSocket::new(self.resources(interface)?))
    }

    /// A UDP socket bound to `port` (`0` = any) on `interface`.
    pub fn udp_socket(&self, interface: Interface, port: u16) -> Result<UdpSocket> {
        UdpSocket::create(self.resources(interface)?, port)
    }

    pub fn session_cache(&self) -> &SessionCache {
        &self.sessions
    }

    /// Client settings with this device's TLS limits.
    pub fn tls_client_settings(&self) -> TlsSettings {
        TlsSettings::client(&self.config.tls)
    }

    /// Server settings sharing this device's session cache.
    pub fn tls_server_settings(&self, identity: Arc<TlsIdentity>) -> TlsSettings {
        TlsSettings::server(&self.config.tls, identity).with_cache(self.sessions.clone())
    }

    /// Bring every interface down and stop background tasks.
    pub async fn shutdown(&self) {
        let interfaces: Vec<Interface> = self.lock_interfaces().keys().copied().collect();
        for interface in interfaces {
            log_failure("bring down", self.bring_down(interface).await);
        }
        self.shutdown.trigger();
        tracing::info!("network manager shut down");
    }

    fn resources(&self, interface: Interface) -> Result<SocketResources> {
        let entry = self.require(interface)?;
        Ok(SocketResources {
            stack: entry.stack,
            tx_pool: self.tx_pool.clone(),
            registry: Arc::clone(&self.registry),
            tracker: self.tracker.clone(),
            config: Arc::clone(&self.config),
        })
    }

    fn settings(&self, interface: Interface) -> Option<IpSettings> {
        self.entry(interface).and_then(|e| e.stack.settings())
    }

    fn entry(&self, interface: Interface) -> Option<InterfaceEntry> {
        self.lock_interfaces().get(&interface).cloned()
    }

    fn require(&self, interface: Interface) -> Result<InterfaceEntry> {
        self.entry(interface)
            .ok_or_else(|| NetError::failed(format!("{interface} is not up")))
    }

    fn entries(&self) -> Vec<(Interface, InterfaceEntry)> {
        self.lock_interfaces()
            .iter()
            .map(|(i, e)| (*i, e.clone()))
            .collect()
    }

    fn lock_interfaces(&self) -> MutexGuard<'_, HashMap<Interface, InterfaceEntry>> {
        lock(&self.interfaces)
    }
}

impl Drop for NetworkManager {
    fn drop(&mut self) {
        for (_, entry) in self.entries() {
            entry.stack.on_address_change(None);
            entry.stack.delete();
        }
        self.shutdown.trigger();
    }
}

impl std::fmt::Debug for NetworkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkManager")
            .field("interfaces", &self.lock_interfaces().keys().collect::<Vec<_>>())
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn log_failure(step: &'static str, result: Result<()>) {
    if let Err(err) = result {
        tracing::warn!(step, error = %err, "teardown step failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::SecurityMode;
    use crate::lifecycle::collaborators::DhcpClient;
    use crate::lifecycle::simulated::SimulatedServices;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn lease_settings() -> IpSettings {
        IpSettings::new(
            Ipv4Addr::new(192, 168, 1, 20),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 1, 1),
        )
    }

    fn manager(config: NetConfig) -> (NetworkManager, SimulatedServices) {
        let sim = SimulatedServices::new(lease_settings());
        let manager = NetworkManager::new(config, Medium::new(), sim.services()).unwrap();
        (manager, sim)
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let mut config = NetConfig::default();
        config.pools.buffer_size = 0;
        let sim = SimulatedServices::new(lease_settings());
        let err = NetworkManager::new(config, Medium::new(), sim.services()).unwrap_err();
        assert!(matches!(err, NetError::Config(_)));
    }

    #[tokio::test]
    async fn dhcp_bring_up_configures_dns_and_is_idempotent() {
        let (manager, sim) = manager(NetConfig::default());
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();

        assert_eq!(sim.join.attempts(), 1);
        assert_eq!(manager.ipv4_address(Interface::Station), Some(lease_settings().address));
        assert_eq!(manager.gateway(Interface::Station), Some(lease_settings().gateway));
        assert_eq!(sim.dns.servers(), vec![lease_settings().gateway, PUBLIC_DNS]);

        let stack = manager.stack(Interface::Station).unwrap();
        assert!(PROTOCOLS.iter().all(|p| stack.is_enabled(*p)));

        manager.bring_down(Interface::Station).await.unwrap();
        assert!(!manager.is_up(Interface::Station));
        assert!(!sim.join.is_joined());
        assert!(sim.dns.servers().is_empty());
        assert!(stack.is_deleted());
    }

    #[tokio::test]
    async fn access_point_runs_dhcp_server() {
        let (manager, sim) = manager(NetConfig::default());
        let settings = IpSettings::new(
            Ipv4Addr::new(192, 168, 4, 1),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 4, 1),
        );
        manager
            .bring_up(Interface::AccessPoint, Addressing::InternalDhcpServer(settings))
            .await
            .unwrap();
        assert!(sim.join.is_access_point_running());
        assert!(sim.dhcp_server.is_running());

        manager.bring_down(Interface::AccessPoint).await.unwrap();
        assert!(!sim.join.is_access_point_running());
        assert!(!sim.dhcp_server.is_running());
    }

    #[tokio::test]
    async fn mismatched_addressing_is_rejected() {
        let (manager, _sim) = manager(NetConfig::default());
        let err = manager
            .bring_up(Interface::AccessPoint, Addressing::ExternalDhcp)
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn join_retries_with_backoff() {
        let (manager, sim) = manager(NetConfig::default());
        sim.join.fail_next(2);
        let start = Instant::now();
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        assert_eq!(sim.join.attempts(), 3);
        assert!(start.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn join_failure_is_fatal_without_fallback() {
        let (manager, sim) = manager(NetConfig::default());
        sim.join.require_fallback(true);
        assert!(manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.is_err());
        assert_eq!(sim.join.attempts(), 3);
        assert!(!manager.is_up(Interface::Station));
    }

    #[tokio::test(start_paused = true)]
    async fn configured_fallback_gets_one_more_attempt() {
        let mut config = NetConfig::default();
        config.network.join_fallback = Some(SecurityMode::WpaPsk);
        let (manager, sim) = manager(config);
        sim.join.require_fallback(true);
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        assert_eq!(sim.join.attempts(), 4);
        assert_eq!(sim.join.last_security(), Some(SecurityMode::WpaPsk));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_address_unwinds_bring_up() {
        let mut config = NetConfig::default();
        config.network.address_resolution_timeout_ms = 50;
        let (manager, sim) = manager(config);
        let unaddressed = IpSettings::new(
            Ipv4Addr::UNSPECIFIED,
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::UNSPECIFIED,
        );
        let err = manager
            .bring_up(Interface::Station, Addressing::Static(unaddressed))
            .await
            .unwrap_err();
        assert!(matches!(err, NetError::Timeout));
        assert!(!manager.is_up(Interface::Station));
        assert!(!sim.join.is_joined());
    }

    #[tokio::test]
    async fn link_events_reach_subscribers_after_dhcp_handling() {
        let (manager, sim) = manager(NetConfig::default());
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        let stack = manager.stack(Interface::Station).unwrap();
        stack.record_arp(Ipv4Addr::new(192, 168, 1, 1));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let dhcp = sim.dhcp_client.clone();
        manager
            .subscribe_link(move |iface, event| {
                lock(&sink).push((iface, event, dhcp.state()));
            })
            .unwrap();

        manager.handle_link_event(Interface::Station, LinkEvent::Down);
        assert!(!stack.is_link_up());
        assert_eq!(stack.arp_entries(), 0);

        manager.handle_link_event(Interface::Station, LinkEvent::Up);
        assert!(stack.is_link_up());

        assert_eq!(
            *lock(&seen),
            vec![
                (Interface::Station, LinkEvent::Down, DhcpState::Stopped),
                (Interface::Station, LinkEvent::Up, DhcpState::Bound),
            ]
        );
    }

    #[tokio::test]
    async fn address_changes_are_dispatched() {
        let (manager, _sim) = manager(NetConfig::default());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = manager
            .subscribe_address(move |iface, address| {
                assert_eq!(iface, Interface::Station);
                if address.is_some() {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(manager.unsubscribe_address(id));
        manager.subscribe_address(|_, _| {}).unwrap();
        manager.subscribe_address(|_, _| {}).unwrap();
        assert!(matches!(
            manager.subscribe_address(|_, _| {}),
            Err(NetError::CapacityExceeded { capacity: 2, .. })
        ));
    }

    #[tokio::test]
    async fn queries_reject_ipv6_and_parse_dotted_quads() {
        let (manager, sim) = manager(NetConfig::default());
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();

        let v6: IpAddr = "ff02::1".parse().unwrap();
        assert!(matches!(
            manager.ping(Interface::Station, v6, Timeout::NoWait).await,
            Err(NetError::Unsupported)
        ));
        assert!(matches!(
            manager.multicast_join(Interface::Station, v6),
            Err(NetError::Unsupported)
        ));
        manager
            .multicast_join(Interface::Station, Ipv4Addr::new(239, 1, 2, 3).into())
            .unwrap();
        manager
            .multicast_leave(Interface::Station, Ipv4Addr::new(239, 1, 2, 3).into())
            .unwrap();

        assert_eq!(
            manager.hostname_lookup("10.1.2.3", Timeout::NoWait).await.unwrap(),
            Ipv4Addr::new(10, 1, 2, 3)
        );
        sim.dns.insert("broker.local", Ipv4Addr::new(192, 168, 1, 50));
        assert_eq!(
            manager.hostname_lookup("broker.local", Timeout::NoWait).await.unwrap(),
            Ipv4Addr::new(192, 168, 1, 50)
        );
    }

    #[tokio::test]
    async fn link_down_gates_multicast_and_lookup() {
        let (manager, sim) = manager(NetConfig::default());
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        sim.dns.insert("broker.local", Ipv4Addr::new(192, 168, 1, 50));
        let group: IpAddr = Ipv4Addr::new(239, 1, 2, 3).into();
        manager.multicast_join(Interface::Station, group).unwrap();

        manager.handle_link_event(Interface::Station, LinkEvent::Down);
        assert!(matches!(
            manager.multicast_join(Interface::Station, Ipv4Addr::new(239, 4, 5, 6).into()),
            Err(NetError::LinkDown)
        ));
        assert!(matches!(
            manager.multicast_leave(Interface::Station, group),
            Err(NetError::LinkDown)
        ));
        assert!(matches!(
            manager.hostname_lookup("broker.local", Timeout::NoWait).await,
            Err(NetError::LinkDown)
        ));
        assert!(matches!(
            manager.hostname_lookup("10.1.2.3", Timeout::NoWait).await,
            Err(NetError::LinkDown)
        ));

        manager.handle_link_event(Interface::Station, LinkEvent::Up);
        manager.multicast_leave(Interface::Station, group).unwrap();
        assert_eq!(
            manager.hostname_lookup("broker.local", Timeout::NoWait).await.unwrap(),
            Ipv4Addr::new(192, 168, 1, 50)
        );
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_the_given_handle() {
        let (manager, _sim) = manager(NetConfig::default());
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let ids: Vec<SubscriptionId> = (0..2)
            .map(|_| {
                let counter = hits.clone();
                manager
                    .subscribe_link(move |_, _| {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap()
            })
            .collect();

        assert!(manager.unsubscribe_link(ids[0]));
        assert!(!manager.unsubscribe_link(ids[0]));
        manager.handle_link_event(Interface::Station, LinkEvent::Down);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(manager.unsubscribe_link(ids[1]));
        manager.handle_link_event(Interface::Station, LinkEvent::Up);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn renew_requires_dhcp() {
        let (manager, sim) = manager(NetConfig::default());
        assert!(manager.renew(Interface::Station).is_err());
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        manager.renew(Interface::Station).unwrap();
        assert_eq!(sim.dhcp_client.renewals(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn suspend_freezes_timers_and_charges_the_lease() {
        let (manager, sim) = manager(NetConfig::default());
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        let before = sim.dhcp_client.lease_remaining().unwrap();

        manager.suspend().unwrap();
        assert_eq!(sim.dhcp_client.state(), DhcpState::Suspended);
        let stack = manager.stack(Interface::Station).unwrap();
        let ticks = stack.timer_ticks();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(stack.timer_ticks(), ticks);

        let elapsed = manager.resume();
        assert_eq!(elapsed, Duration::from_secs(90));
        assert_eq!(sim.dhcp_client.state(), DhcpState::Bound);
        assert_eq!(sim.dhcp_client.lease_remaining().unwrap(), before - elapsed);
    }

    #[tokio::test]
    #[should_panic(expected = "without a matching suspend")]
    async fn resume_without_suspend_panics() {
        let (manager, _sim) = manager(NetConfig::default());
        manager.resume();
    }

    #[tokio::test]
    async fn shutdown_brings_everything_down() {
        let (manager, _sim) = manager(NetConfig::default());
        manager.bring_up(Interface::Station, Addressing::ExternalDhcp).await.unwrap();
        manager.shutdown().await;
        assert!(!manager.is_up(Interface::Station));
        assert!(manager.tcp_socket(Interface::Station).is_err());
    }
}
