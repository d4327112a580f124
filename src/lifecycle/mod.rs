//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (client::ShardedClient::connect):
//!     sync source → parse → build pool → register → start reload coordinator
//!
//! Shutdown (shutdown.rs):
//!     trigger → reload coordinators exit → registry closes every pool
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → trigger shutdown
//!     SIGHUP → re-read the configuration file
//! ```

pub mod shutdown;
pub mod signals;

pub use shutdown::{Shutdown, ShutdownSignal};
pub use signals::{next_signal, Signal};
