//! Low-level node client.
//!
//! # Data Flow
//! ```text
//! TcpConnector::connect(endpoint, policy)
//!     → tcp.rs TcpNodePool (semaphore-bounded, warmed with min_idle connections)
//!     → eviction.rs background task trims / validates / refills idle set
//!
//! acquire → idle connection (validated if asked) or new connection
//!     → PooledConnection::execute → resp.rs encode / decode
//!     → drop returns it to the idle set unless it failed
//! ```
//!
//! # Design Decisions
//! - Every live connection holds a semaphore permit, so `max_total` counts
//!   idle and borrowed connections alike
//! - Closing the semaphore wakes blocked borrowers with `Closed`
//! - Return-time validation is deferred to the next borrow

pub mod eviction;
pub mod resp;
pub mod tcp;

pub use eviction::EvictionStats;
pub use resp::RespValue;
pub use tcp::{PooledConnection, TcpConnector, TcpNodePool};
