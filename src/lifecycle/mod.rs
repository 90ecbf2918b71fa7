//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! NetworkManager::new:
//!     Validate config → allocate pools → callback registry + event worker
//!
//! bring_up / bring_down (network.rs):
//!     JoinService → IpStack → DhcpClient / DhcpServer → DnsClient
//!
//! Driver events (network.rs → events.rs):
//!     link up/down, address change → bounded subscriber sets
//!
//! shutdown:
//!     bring every interface down → trigger Shutdown → worker and timers exit
//! ```
//!
//! # Design Decisions
//! - Association, DHCP and DNS are collaborators behind traits (collaborators.rs)
//! - Suspend and resume are strictly paired; misuse panics
//! - Subscriber callbacks run with no registry lock held

pub mod collaborators;
pub mod events;
pub mod network;
pub mod shutdown;
pub mod simulated;

pub use collaborators::{DhcpClient, DhcpLease, DhcpServer, DhcpState, DnsClient, JoinService, Services};
pub use events::{LinkEvent, SubscriptionId};
pub use network::NetworkManager;
pub use shutdown::Shutdown;
