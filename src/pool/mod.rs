//! Pool lifecycle subsystem.
//!
//! # Data Flow
//! ```text
//! First access:
//!     registry.rs get_or_create(identity)
//!         → present? return current ActivePool
//!         → absent: per-identity once-cell runs the build exactly once
//!         → active.rs ActivePool::build (one NodePool per endpoint)
//!         → install, visible to readers
//!
//! Config change (reload.rs):
//!     ConfigChange → compare topology fingerprints
//!         → equal: no-op
//!         → different: build replacement outside any lock
//!         → registry swap (atomic pointer replace)
//!         → close every node pool of the old ActivePool, continue on error
//!
//! Dispatch:
//!     key → router.rs slot → owning endpoint → NodePool::acquire
//! ```
//!
//! # Design Decisions
//! - Readers load the current pool through an `ArcSwap`; they never block on
//!   the mutation lock and never see a half-built pool
//! - A failed rebuild never touches the registry
//! - Teardown errors are logged and counted, never propagated

pub mod active;
pub mod registry;
pub mod reload;
pub mod router;

use std::future::Future;

use thiserror::Error;

use crate::config::{ConfigError, Endpoint, PoolPolicy};
use crate::node::resp::RespValue;

pub use active::{ActivePool, TeardownReport};
pub use registry::{PoolRegistry, Registered};
pub use reload::{ReloadCoordinator, ReloadOutcome, ReloadStats};
pub use router::SlotRouter;

/// Errors raised while building, using, or tearing down pools.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No reachable nodes, or connection setup failed during a (re)build.
    #[error("failed to construct pool: {0}")]
    Construction(String),

    /// Closing a node pool failed.
    #[error("failed to close node pool {endpoint}: {reason}")]
    Teardown { endpoint: Endpoint, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("connection pool for {0} exhausted")]
    Exhausted(Endpoint),

    #[error("node pool {0} is closed")]
    Closed(Endpoint),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("no pool registered for identity '{0}'")]
    NotRegistered(String),
}

/// A borrowed connection able to run one command at a time.
pub trait CacheConnection: Send {
    fn execute(
        &mut self,
        args: &[&[u8]],
    ) -> impl Future<Output = Result<RespValue, PoolError>> + Send;
}

/// A connection pool for a single cluster node.
pub trait NodePool: Send + Sync + 'static {
    type Connection: CacheConnection;

    fn endpoint(&self) -> &Endpoint;

    /// Borrow a connection. Fails with [`PoolError::Closed`] once `close` began.
    fn acquire(&self) -> impl Future<Output = Result<Self::Connection, PoolError>> + Send;

    /// Close the pool and its idle connections. Idempotent.
    fn close(&self) -> impl Future<Output = Result<(), PoolError>> + Send;

    fn is_closed(&self) -> bool;
}

/// Builds node pools. This is the seam to the low-level client library.
pub trait Connector: Send + Sync + 'static {
    type Pool: NodePool;

    fn connect(
        &self,
        endpoint: &Endpoint,
        policy: &PoolPolicy,
    ) -> impl Future<Output = Result<Self::Pool, PoolError>> + Send;
}
