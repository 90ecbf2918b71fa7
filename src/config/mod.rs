//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → NetConfig (validated, immutable)
//!     → handed to NetworkManager::new, shared by reference afterwards
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a new manager
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::NetConfig;
pub use schema::{PoolConfig, SecurityMode, TcpConfig, TlsConfig};
