//! Client-side connection layer for a sharded key-value cache.

pub mod client;
pub mod config;
pub mod lifecycle;
pub mod node;
pub mod observability;
pub mod pool;

pub use client::commands::Ttl;
pub use client::ShardedClient;
pub use config::{ClusterTopology, ConfigSource, Endpoint, FileConfigSource, MemoryConfigSource, PoolPolicy};
pub use lifecycle::Shutdown;
pub use node::{TcpConnector, TcpNodePool};
pub use pool::{ActivePool, PoolError, PoolRegistry, ReloadCoordinator};
