//! In-memory collaborators for tests and the demo binary.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;

use super::collaborators::{
    BoxFuture, DhcpClient, DhcpLease, DhcpServer, DhcpState, DnsClient, JoinService, Services,
};
use crate::config::schema::SecurityMode;
use crate::error::{NetError, Result};
use crate::net::address::IpSettings;
use crate::net::stack::IpStack;
use crate::resilience::timeouts::Timeout;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Association that can be told to fail a number of attempts.
#[derive(Debug, Default)]
pub struct SimulatedJoin {
    failures_left: AtomicU32,
    attempts: AtomicU32,
    fallback_only: AtomicBool,
    joined: AtomicBool,
    access_point: AtomicBool,
    last_security: Mutex<Option<SecurityMode>>,
}

impl SimulatedJoin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` join attempts.
    pub fn fail_next(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Succeed only when a security override is supplied.
    pub fn require_fallback(&self, on: bool) {
        self.fallback_only.store(on, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_joined(&self) -> bool {
        self.joined.load(Ordering::SeqCst)
    }

    pub fn is_access_point_running(&self) -> bool {
        self.access_point.load(Ordering::SeqCst)
    }

    /// Security override used by the last successful join.
    pub fn last_security(&self) -> Option<SecurityMode> {
        *lock(&self.last_security)
    }
}

impl JoinService for SimulatedJoin {
    fn join(&self, security: Option<SecurityMode>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let forced = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if forced || (self.fallback_only.load(Ordering::SeqCst) && security.is_none()) {
                return Err(NetError::failed("association rejected"));
            }
            *lock(&self.last_security) = security;
            self.joined.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn leave(&self) -> Result<()> {
        if self.joined.swap(false, Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NetError::failed("not joined"))
        }
    }

    fn start_access_point(&self) -> Result<()> {
        self.access_point.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop_access_point(&self) -> Result<()> {
        self.access_point.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct DhcpInner {
    state: DhcpState,
    stack: Option<IpStack>,
    lease: Option<DhcpLease>,
    remaining: Option<Duration>,
    renewals: u32,
}

/// DHCP client that binds a fixed lease immediately on start.
pub struct SimulatedDhcpClient {
    offer: DhcpLease,
    inner: Mutex<DhcpInner>,
}

impl SimulatedDhcpClient {
    pub fn new(offer: DhcpLease) -> Self {
        Self {
            offer,
            inner: Mutex::new(DhcpInner {
                state: DhcpState::Stopped,
                stack: None,
                lease: None,
                remaining: None,
                renewals: 0,
            }),
        }
    }

    pub fn renewals(&self) -> u32 {
        lock(&self.inner).renewals
    }
}

impl DhcpClient for SimulatedDhcpClient {
    fn start(&self, stack: &IpStack) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            inner.state = DhcpState::Bound;
            inner.stack = Some(stack.clone());
            inner.lease = Some(self.offer);
            inner.remaining.get_or_insert(self.offer.lease_time);
        }
        stack.set_address(Some(self.offer.settings));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.state = DhcpState::Stopped;
        inner.stack = None;
        Ok(())
    }

    fn reinitialize(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        inner.state = DhcpState::Stopped;
        inner.lease = None;
        inner.remaining = None;
        Ok(())
    }

    fn force_renew(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        if inner.state != DhcpState::Bound {
            return Err(NetError::failed("no lease to renew"));
        }
        inner.remaining = Some(self.offer.lease_time);
        inner.renewals += 1;
        Ok(())
    }

    fn suspend(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == DhcpState::Bound {
            inner.state = DhcpState::Suspended;
        }
    }

    fn resume(&self) {
        let mut inner = lock(&self.inner);
        if inner.state == DhcpState::Suspended {
            inner.state = DhcpState::Bound;
        }
    }

    fn update_time_remaining(&self, elapsed: Duration) {
        let mut inner = lock(&self.inner);
        if let Some(remaining) = inner.remaining.as_mut() {
            *remaining = remaining.saturating_sub(elapsed);
        }
    }

    fn state(&self) -> DhcpState {
        lock(&self.inner).state
    }

    fn lease(&self) -> Option<DhcpLease> {
        lock(&self.inner).lease
    }

    fn lease_remaining(&self) -> Option<Duration> {
        lock(&self.inner).remaining
    }
}

#[derive(Debug, Default)]
pub struct SimulatedDhcpServer {
    running: AtomicBool,
}

impl SimulatedDhcpServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl DhcpServer for SimulatedDhcpServer {
    fn start(&self, _stack: &IpStack, settings: IpSettings) -> Result<()> {
        tracing::debug!(address = %settings.address, "dhcp server started");
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Static host table answered only while at least one server is configured.
#[derive(Debug, Default)]
pub struct SimulatedDns {
    servers: Mutex<Vec<Ipv4Addr>>,
    hosts: DashMap<String, Ipv4Addr>,
}

impl SimulatedDns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, hostname: &str, address: Ipv4Addr) {
        self.hosts.insert(hostname.to_ascii_lowercase(), address);
    }

    pub fn servers(&self) -> Vec<Ipv4Addr> {
        lock(&self.servers).clone()
    }
}

impl DnsClient for SimulatedDns {
    fn lookup<'a>(&'a self, hostname: &'a str, _timeout: Timeout) -> BoxFuture<'a, Result<Ipv4Addr>> {
        Box::pin(async move {
            if lock(&self.servers).is_empty() {
                return Err(NetError::failed("no dns server configured"));
            }
            self.hosts
                .get(&hostname.to_ascii_lowercase())
                .map(|e| *e.value())
                .ok_or_else(|| NetError::failed(format!("{hostname}: host not found")))
        })
    }

    fn add_server(&self, server: Ipv4Addr) -> Result<()> {
        let mut servers = lock(&self.servers);
        if !servers.contains(&server) {
            servers.push(server);
        }
        Ok(())
    }

    fn remove_all_servers(&self) {
        lock(&self.servers).clear();
    }
}

/// Simulated collaborators, with typed handles for inspection.
#[derive(Clone)]
pub struct SimulatedServices {
    pub join: Arc<SimulatedJoin>,
    pub dhcp_client: Arc<SimulatedDhcpClient>,
    pub dhcp_server: Arc<SimulatedDhcpServer>,
    pub dns: Arc<SimulatedDns>,
}

impl SimulatedServices {
    /// Collaborators whose DHCP client leases `settings` for an hour.
    pub fn new(settings: IpSettings) -> Self {
        Self {
            join: Arc::new(SimulatedJoin::new()),
            dhcp_client: Arc::new(SimulatedDhcpClient::new(DhcpLease {
                settings,
                dns_server: Some(settings.gateway),
                lease_time: Duration::from_secs(3600),
            })),
            dhcp_server: Arc::new(SimulatedDhcpServer::new()),
            dns: Arc::new(SimulatedDns::new()),
        }
    }

    pub fn services(&self) -> Services {
        Services {
            join: self.join.clone(),
            dhcp_client: self.dhcp_client.clone(),
            dhcp_server: self.dhcp_server.clone(),
            dns: self.dns.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn join_failures_are_consumed() {
        let join = SimulatedJoin::new();
        join.fail_next(2);
        assert!(join.join(None).await.is_err());
        assert!(join.join(None).await.is_err());
        join.join(None).await.unwrap();
        assert_eq!(join.attempts(), 3);
        assert!(join.is_joined());
    }

    #[tokio::test]
    async fn dns_needs_a_server() {
        let dns = SimulatedDns::new();
        dns.insert("Broker.Local", Ipv4Addr::new(10, 0, 0, 9));
        assert!(dns.lookup("broker.local", Timeout::NoWait).await.is_err());
        dns.add_server(Ipv4Addr::new(8, 8, 8, 8)).unwrap();
        assert_eq!(
            dns.lookup("broker.local", Timeout::NoWait).await.unwrap(),
            Ipv4Addr::new(10, 0, 0, 9)
        );
    }
}
