//! Resilience helpers shared by sockets and the network manager.
//!
//! # Data Flow
//! ```text
//! Blocking operation (allocate, accept, receive, address wait):
//!     → timeouts.rs (Timeout → deadline, wait on Notify until ready)
//!
//! Association (join) failure:
//!     → backoff.rs (exponential delay with jitter between attempts)
//! ```
//!
//! # Design Decisions
//! - Every blocking call carries an explicit `Timeout`; `Forever` is opt-in
//! - No automatic retries inside sockets or TLS; only join is retried

pub mod backoff;
pub mod timeouts;
