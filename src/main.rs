//! ember-net demo.
//!
//! Brings up two simulated devices on one shared medium, runs a TLS echo
//! exchange between them twice (the second connection resumes the first
//! session) and prints a JSON summary.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde::Serialize;

use ember_net::config::loader::load_config;
use ember_net::lifecycle::simulated::SimulatedServices;
use ember_net::net::address::{Addressing, Interface, IpSettings};
use ember_net::net::stack::Medium;
use ember_net::observability::{logging, metrics};
use ember_net::tls::{CertificateAuthority, TlsIdentity, TrustStore, VerifyMode};
use ember_net::{NetConfig, NetworkManager, Timeout};

#[derive(Parser)]
#[command(name = "ember-net")]
#[command(about = "Two-device TLS echo over the ember-net transport", long_about = None)]
struct Cli {
    /// TOML configuration file; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Payload sent on every connection.
    #[arg(short, long, default_value = "hello from ember-net")]
    message: String,

    /// Connections to make; every one after the first resumes the session.
    #[arg(short = 'n', long, default_value_t = 2)]
    connections: u32,

    #[arg(long, default_value_t = 8443)]
    port: u16,
}

#[derive(Serialize)]
struct ConnectionReport {
    echoed: bool,
    resumed: bool,
    round_trip_us: u128,
}

#[derive(Serialize)]
struct Summary {
    server: Option<Ipv4Addr>,
    client: Option<Ipv4Addr>,
    sessions_cached: usize,
    connections: Vec<ConnectionReport>,
}

fn settings(last: u8) -> IpSettings {
    IpSettings::new(
        Ipv4Addr::new(10, 0, 0, last),
        Ipv4Addr::new(255, 255, 255, 0),
        Ipv4Addr::new(10, 0, 0, 1),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => load_config(path)?,
        None => NetConfig::default(),
    };
    logging::init_logging(&config.observability)?;
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr)?,
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "failed to parse metrics address"
            ),
        }
    }
    tracing::info!("ember-net v{} starting", env!("CARGO_PKG_VERSION"));

    let medium = Medium::new();
    let server_sim = SimulatedServices::new(settings(1));
    let client_sim = SimulatedServices::new(settings(2));
    let server = Arc::new(NetworkManager::new(
        config.clone(),
        medium.clone(),
        server_sim.services(),
    )?);
    let client = NetworkManager::new(config, medium, client_sim.services())?;

    server
        .bring_up(Interface::Station, Addressing::Static(settings(1)))
        .await?;
    client
        .bring_up(Interface::Station, Addressing::ExternalDhcp)
        .await?;
    let server_address = server
        .ipv4_address(Interface::Station)
        .ok_or("server has no address")?;

    let authority = CertificateAuthority::generate("ember demo ca")?;
    let identity = Arc::new(TlsIdentity::generate_issued("echo.local", &authority)?);

    let mut listener = server.tcp_socket(Interface::Station)?;
    listener.enable_tls(server.tls_server_settings(identity));
    listener.listen(cli.port)?;

    let rounds = cli.connections;
    let echo = tokio::spawn(async move {
        for _ in 0..rounds {
            let peer = listener.accept().await?;
            let request = listener.receive(Timeout::After(Duration::from_secs(5))).await?;
            let data = request.to_vec();
            request.release();
            tracing::debug!(%peer, bytes = data.len(), "echoing");
            listener.send_buffer(&data).await?;
            listener.disconnect().await?;
        }
        listener.delete().await;
        Ok::<_, ember_net::NetError>(())
    });

    let mut socket = client.tcp_socket(Interface::Station)?;
    socket.enable_tls(
        client
            .tls_client_settings()
            .with_trust(TrustStore::new(vec![authority.certificate().clone()]))
            .with_verify(VerifyMode::Required)
            .with_peer_name("echo.local"),
    );

    let mut connections = Vec::new();
    for _ in 0..rounds {
        let started = tokio::time::Instant::now();
        socket
            .connect(server_address, cli.port, Timeout::After(Duration::from_secs(5)))
            .await?;
        let resumed = socket.tls().is_some_and(|t| t.is_resumed());
        socket.send_buffer(cli.message.as_bytes()).await?;
        let reply = socket.receive(Timeout::After(Duration::from_secs(5))).await?;
        let echoed = reply.to_vec() == cli.message.as_bytes();
        reply.release();
        socket.disconnect().await?;
        connections.push(ConnectionReport {
            echoed,
            resumed,
            round_trip_us: started.elapsed().as_micros(),
        });
    }
    socket.delete().await;
    echo.await??;

    let summary = Summary {
        server: Some(server_address),
        client: client.ipv4_address(Interface::Station),
        sessions_cached: server.session_cache().len(),
        connections,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);

    client.shutdown().await;
    server.shutdown().await;
    Ok(())
}
