//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! ConfigSource (memory / file)
//!     → raw document text
//!     → parser.rs (TOML → ClusterTopology + PoolPolicy, defaults filled)
//!     → ActivePool construction
//!
//! On change:
//!     source.rs / watcher.rs emit ConfigChange { old, new }
//!     → ReloadCoordinator compares topologies
//!     → rebuild + atomic swap only on a material change
//! ```
//!
//! # Design Decisions
//! - Parsed values are immutable; a change always produces new values
//! - Every optional field has a default so a node list alone is a valid config
//! - Parsing is a pure function with no state shared between calls

pub mod parser;
pub mod schema;
pub mod source;
pub mod watcher;

pub use parser::{parse, parse_topology, ConfigError};
pub use schema::{ClusterTopology, Endpoint, PoolPolicy, DEFAULT_PORT};
pub use source::{ConfigChange, ConfigSource, MemoryConfigSource};
pub use watcher::FileConfigSource;
