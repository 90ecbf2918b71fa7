//! External services the network manager drives but does not implement.
//!
//! Association, DHCP and DNS live outside this crate. The manager talks to
//! them through these traits; [`super::simulated`] provides in-memory
//! versions for tests and the demo binary.

use std::future::Future;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::config::schema::SecurityMode;
use crate::error::Result;
use crate::net::address::IpSettings;
use crate::net::stack::IpStack;
use crate::resilience::timeouts::Timeout;

/// Boxed future for the collaborator calls that take time.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Wireless association for the station and soft-AP interfaces.
pub trait JoinService: Send + Sync {
    /// Associate with the configured network. `security` overrides the
    /// configured security mode for this attempt.
    fn join(&self, security: Option<SecurityMode>) -> BoxFuture<'_, Result<()>>;

    fn leave(&self) -> Result<()>;

    fn start_access_point(&self) -> Result<()>;

    fn stop_access_point(&self) -> Result<()>;
}

/// Client lease state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpState {
    Stopped,
    Requesting,
    Bound,
    Suspended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DhcpLease {
    pub settings: IpSettings,
    pub dns_server: Option<Ipv4Addr>,
    pub lease_time: Duration,
}

/// DHCP client bound to the station stack.
pub trait DhcpClient: Send + Sync {
    /// Start acquiring a lease; the address lands on `stack` when bound.
    fn start(&self, stack: &IpStack) -> Result<()>;

    fn stop(&self) -> Result<()>;

    /// Forget the current lease so the next `start` begins from discovery.
    fn reinitialize(&self) -> Result<()>;

    fn force_renew(&self) -> Result<()>;

    /// Freeze lease timers.
    fn suspend(&self);

    fn resume(&self);

    /// Charge `elapsed` against the remaining lease time.
    fn update_time_remaining(&self, elapsed: Duration);

    fn state(&self) -> DhcpState;

    fn lease(&self) -> Option<DhcpLease>;

    fn lease_remaining(&self) -> Option<Duration>;
}

/// DHCP server for the soft-AP interface.
pub trait DhcpServer: Send + Sync {
    fn start(&self, stack: &IpStack, settings: IpSettings) -> Result<()>;

    fn stop(&self) -> Result<()>;
}

pub trait DnsClient: Send + Sync {
    fn lookup<'a>(&'a self, hostname: &'a str, timeout: Timeout) -> BoxFuture<'a, Result<Ipv4Addr>>;

    fn add_server(&self, server: Ipv4Addr) -> Result<()>;

    fn remove_all_servers(&self);
}

/// The collaborator set handed to [`NetworkManager::new`](super::NetworkManager::new).
#[derive(Clone)]
pub struct Services {
    pub join: Arc<dyn JoinService>,
    pub dhcp_client: Arc<dyn DhcpClient>,
    pub dhcp_server: Arc<dyn DhcpServer>,
    pub dns: Arc<dyn DnsClient>,
}
