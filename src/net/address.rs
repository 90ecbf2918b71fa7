//! Interfaces and IPv4 addressing.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// A network interface of the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interface {
    /// Client interface associated to an access point.
    Station,
    /// Soft access point served by this device.
    AccessPoint,
}

impl Interface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interface::Station => "sta",
            Interface::AccessPoint => "ap",
        }
    }
}

impl std::fmt::Display for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static IPv4 settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpSettings {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
}

impl IpSettings {
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> Self {
        Self {
            address,
            netmask,
            gateway,
        }
    }

    /// Whether `other` is on this subnet.
    pub fn is_local(&self, other: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask);
        u32::from(self.address) & mask == u32::from(other) & mask
    }
}

/// How an interface gets its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Addressing {
    /// Fixed settings.
    Static(IpSettings),
    /// Lease from an external DHCP server (station).
    ExternalDhcp,
    /// Fixed settings plus a local DHCP server handing out leases (access point).
    InternalDhcpServer(IpSettings),
}

impl Addressing {
    /// Settings known before bring-up.
    pub fn settings(&self) -> Option<IpSettings> {
        match self {
            Addressing::Static(s) | Addressing::InternalDhcpServer(s) => Some(*s),
            Addressing::ExternalDhcp => None,
        }
    }

    pub fn uses_dhcp_client(&self) -> bool {
        matches!(self, Addressing::ExternalDhcp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_membership() {
        let s = IpSettings::new(
            Ipv4Addr::new(192, 168, 0, 10),
            Ipv4Addr::new(255, 255, 255, 0),
            Ipv4Addr::new(192, 168, 0, 1),
        );
        assert!(s.is_local(Ipv4Addr::new(192, 168, 0, 77)));
        assert!(!s.is_local(Ipv4Addr::new(192, 168, 1, 77)));
    }

    #[test]
    fn dhcp_addressing_has_no_preset() {
        assert!(Addressing::ExternalDhcp.settings().is_none());
        assert!(Addressing::ExternalDhcp.uses_dhcp_client());
    }
}
