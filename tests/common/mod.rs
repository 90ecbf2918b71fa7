//! Shared fixture for integration tests: two devices on one medium.

#![allow(dead_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ember_net::lifecycle::simulated::SimulatedServices;
use ember_net::net::address::{Addressing, Interface, IpSettings};
use ember_net::net::stack::Medium;
use ember_net::tls::{CertificateAuthority, TlsIdentity, TlsSettings, TrustStore, VerifyMode};
use ember_net::{NetConfig, NetworkManager, Timeout};

pub const SERVER_NAME: &str = "broker.local";
pub const PORT: u16 = 8883;

pub fn settings(last: u8) -> IpSettings {
    IpSettings::new(
        Ipv4Addr::new(10, 0, 0, last),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(10, 0, 0, 1),
    )
}

pub fn wait() -> Timeout {
    Timeout::After(Duration::from_secs(5))
}

pub struct Device {
    pub manager: Arc<NetworkManager>,
    pub sim: SimulatedServices,
}

/// Server at 10.0.0.1 (static), client at 10.0.0.2 (DHCP), both up.
pub struct TwoDevices {
    pub server: Device,
    pub client: Device,
    pub authority: CertificateAuthority,
}

impl TwoDevices {
    pub async fn new() -> Self {
        Self::with_config(config()).await
    }

    pub async fn with_config(config: NetConfig) -> Self {
        let medium = Medium::new();
        let server = device(&config, &medium, 1);
        let client = device(&config, &medium, 2);
        server
            .manager
            .bring_up(Interface::Station, Addressing::Static(settings(1)))
            .await
            .unwrap();
        client
            .manager
            .bring_up(Interface::Station, Addressing::ExternalDhcp)
            .await
            .unwrap();
        Self {
            server,
            client,
            authority: CertificateAuthority::generate("test ca").unwrap(),
        }
    }

    pub fn server_address(&self) -> Ipv4Addr {
        settings(1).address
    }

    /// Server settings with a certificate issued by the test authority.
    pub fn server_tls(&self) -> TlsSettings {
        let identity = TlsIdentity::generate_issued(SERVER_NAME, &self.authority).unwrap();
        self.server.manager.tls_server_settings(Arc::new(identity))
    }

    /// Client settings that require a chain to the test authority.
    pub fn client_tls(&self) -> TlsSettings {
        self.client
            .manager
            .tls_client_settings()
            .with_trust(TrustStore::new(vec![self.authority.certificate().clone()]))
            .with_verify(VerifyMode::Required)
            .with_peer_name(SERVER_NAME)
    }
}

/// Defaults with pools deep enough for multi-segment exchanges.
pub fn config() -> NetConfig {
    let mut config = NetConfig::default();
    config.pools.tx_buffers = 24;
    config.pools.rx_buffers = 24;
    config
}

fn device(config: &NetConfig, medium: &Medium, last: u8) -> Device {
    let sim = SimulatedServices::new(settings(last));
    let manager = NetworkManager::new(config.clone(), medium.clone(), sim.services()).unwrap();
    Device {
        manager: Arc::new(manager),
        sim,
    }
}
