//! Configuration schema definitions.
//!
//! Two groups of types live here:
//! - the validated values handed to the rest of the crate
//!   ([`Endpoint`], [`ClusterTopology`], [`PoolPolicy`]), immutable once built;
//! - the raw document shape deserialized from TOML, where every field is
//!   optional and may be written either natively or as text.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Standard port of the cache server, used when an endpoint omits one.
pub const DEFAULT_PORT: u16 = 6379;

/// A single cluster node address.
///
/// Hosts are compared case-insensitively, so the host is stored lowercased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl AsRef<str>, port: u16) -> Self {
        Self {
            host: host.as_ref().trim().to_ascii_lowercase(),
            port,
        }
    }

    /// `host:port` form used for connecting.
    /// `host:port`, with IPv6 hosts in brackets.
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// The set of node endpoints one pool connects to.
///
/// Equality is defined over [`ClusterTopology::fingerprint`], the sorted,
/// case-normalized textual form, which is what reload comparison uses.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClusterTopology {
    endpoints: BTreeSet<Endpoint>,
}

impl ClusterTopology {
    pub fn new(endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
        }
    }

    /// Endpoints in sorted order.
    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter()
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.endpoints.contains(endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Sorted, lowercased `host:port` entries joined by commas.
    pub fn fingerprint(&self) -> String {
        let mut entries: Vec<String> = self
            .endpoints
            .iter()
            .map(|e| e.to_string().to_ascii_lowercase())
            .collect();
        entries.sort();
        entries.join(",")
    }
}

impl PartialEq for ClusterTopology {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint() == other.fingerprint()
    }
}

impl Eq for ClusterTopology {}

impl fmt::Display for ClusterTopology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.fingerprint())
    }
}

/// Tuning values for every per-node connection pool of one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolPolicy {
    /// Connect (and handshake) timeout for new connections.
    pub connect_timeout: Duration,

    /// Credential sent with AUTH after connecting.
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Logical database selected after connecting.
    pub database: u32,

    /// Maximum connections per node, idle plus borrowed. `None` is unbounded.
    pub max_total: Option<usize>,

    /// Maximum idle connections kept per node.
    pub max_idle: usize,

    /// Idle connections the evictor keeps warm per node.
    pub min_idle: usize,

    /// Reuse the most recently returned connection first.
    pub lifo: bool,

    /// Wait bound when `block_when_exhausted` is set.
    pub max_wait: Duration,

    /// Wait for a free slot instead of failing immediately.
    pub block_when_exhausted: bool,

    /// Idle time after which a connection is always evicted.
    pub min_evictable_idle: Duration,

    /// Idle time after which a connection is evicted if more than
    /// `min_idle` remain.
    pub soft_min_evictable_idle: Option<Duration>,

    /// Connections examined per eviction run; negative means a fraction.
    pub num_tests_per_eviction_run: i32,

    /// Interval between eviction runs. Zero disables the evictor.
    pub time_between_eviction_runs: Duration,

    pub test_on_borrow: bool,
    pub test_on_return: bool,
    pub test_while_idle: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(2000),
            password: None,
            database: 0,
            max_total: None,
            max_idle: 8,
            min_idle: 0,
            lifo: true,
            max_wait: Duration::from_millis(200),
            block_when_exhausted: false,
            min_evictable_idle: Duration::from_millis(60_000),
            soft_min_evictable_idle: None,
            num_tests_per_eviction_run: -1,
            time_between_eviction_runs: Duration::from_millis(30_000),
            test_on_borrow: false,
            test_on_return: false,
            test_while_idle: true,
        }
    }
}

/// Raw configuration document. Only the structural root is required.
#[derive(Debug, Deserialize)]
pub(crate) struct ConfigDocument {
    pub config: Option<RootSection>,
}

/// The `[config]` root table.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RootSection {
    pub timeout_ms: Option<RawValue>,
    pub password: Option<RawValue>,
    pub db_index: Option<RawValue>,
    pub nodes: Vec<String>,
    pub pool: Option<PoolSection>,
}

/// The optional `[config.pool]` table.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct PoolSection {
    pub max_total: Option<RawValue>,
    pub max_idle: Option<RawValue>,
    pub min_idle: Option<RawValue>,
    pub lifo: Option<RawValue>,
    pub max_wait_ms: Option<RawValue>,
    pub block_when_exhausted: Option<RawValue>,
    pub min_evictable_idle_ms: Option<RawValue>,
    pub soft_min_evictable_idle_ms: Option<RawValue>,
    pub num_tests_per_eviction_run: Option<RawValue>,
    pub time_between_eviction_runs_ms: Option<RawValue>,
    pub test_on_borrow: Option<RawValue>,
    pub test_on_return: Option<RawValue>,
    pub test_while_idle: Option<RawValue>,
}

/// A scalar that may be written natively or as text. Blank text is absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawValue {
    Integer(i64),
    Boolean(bool),
    Text(String),
}
