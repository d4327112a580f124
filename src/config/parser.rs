//! Configuration parsing from raw document text.
//!
//! Parsing is a pure function of its input: every document, table, and
//! intermediate value is local to the call, so concurrent parses from the
//! startup path and the reload path never observe each other.

use std::time::Duration;

use thiserror::Error;

use crate::config::schema::{
    ClusterTopology, ConfigDocument, Endpoint, PoolPolicy, PoolSection, RawValue, RootSection,
    DEFAULT_PORT,
};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document is malformed or its `[config]` root is missing.
    #[error("invalid configuration format: {0}")]
    Format(String),

    /// The configuration value is empty or has never been set.
    #[error("configuration unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),
}

/// Parse a raw document into its topology and pool policy.
pub fn parse(raw: &str) -> Result<(ClusterTopology, PoolPolicy), ConfigError> {
    let root = parse_root(raw)?;
    let topology = topology_from(&root)?;
    let policy = policy_from(&root)?;
    Ok((topology, policy))
}

/// Parse only the node topology. Used by reload comparison.
pub fn parse_topology(raw: &str) -> Result<ClusterTopology, ConfigError> {
    topology_from(&parse_root(raw)?)
}

fn parse_root(raw: &str) -> Result<RootSection, ConfigError> {
    let document: ConfigDocument =
        toml::from_str(raw).map_err(|e| ConfigError::Format(e.message().to_string()))?;
    document
        .config
        .ok_or_else(|| ConfigError::Format("missing [config] root table".to_string()))
}

fn topology_from(root: &RootSection) -> Result<ClusterTopology, ConfigError> {
    let mut endpoints = Vec::with_capacity(root.nodes.len());
    for entry in &root.nodes {
        if entry.trim().is_empty() {
            tracing::debug!("Skipping blank node entry");
            continue;
        }
        endpoints.push(parse_endpoint(entry)?);
    }
    Ok(ClusterTopology::new(endpoints))
}

/// Parse `host[:port]` or `[ipv6]:port`. A blank port falls back to
/// [`DEFAULT_PORT`]; a blank host is accepted as-is and only fails once
/// connected. An unbracketed entry with several colons is a bare IPv6 host.
fn parse_endpoint(entry: &str) -> Result<Endpoint, ConfigError> {
    let trimmed = entry.trim();
    let invalid = |what: &str| ConfigError::Format(format!("invalid {} in node entry '{}'", what, entry));

    let (host, port) = if let Some(rest) = trimmed.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| invalid("address"))?;
        match tail {
            "" => (host, ""),
            tail => (host, tail.strip_prefix(':').ok_or_else(|| invalid("address"))?.trim()),
        }
    } else {
        match trimmed.split_once(':') {
            Some((host, port)) if !port.contains(':') => (host, port.trim()),
            _ => (trimmed, ""),
        }
    };

    if host.trim().is_empty() {
        tracing::warn!(entry = %entry, "Node entry has no host");
    }

    let port = if port.is_empty() {
        DEFAULT_PORT
    } else {
        port.parse::<u16>().map_err(|_| invalid("port"))?
    };

    Ok(Endpoint::new(host, port))
}

fn policy_from(root: &RootSection) -> Result<PoolPolicy, ConfigError> {
    let mut policy = PoolPolicy::default();

    if let Some(ms) = millis(root.timeout_ms.as_ref(), "timeout_ms")? {
        policy.connect_timeout = ms;
    }
    policy.password = text(root.password.as_ref());
    if let Some(index) = integer(root.db_index.as_ref(), "db_index")? {
        policy.database = u32::try_from(index)
            .map_err(|_| ConfigError::Format(format!("db_index out of range: {}", index)))?;
    }

    let pool = match &root.pool {
        Some(pool) => pool,
        None => return Ok(policy),
    };
    apply_pool_section(&mut policy, pool)?;
    Ok(policy)
}

fn apply_pool_section(policy: &mut PoolPolicy, pool: &PoolSection) -> Result<(), ConfigError> {
    // Negative sizes follow the pool library's convention of "no limit".
    if let Some(n) = integer(pool.max_total.as_ref(), "max_total")? {
        policy.max_total = usize::try_from(n).ok();
    }
    if let Some(n) = integer(pool.max_idle.as_ref(), "max_idle")? {
        policy.max_idle = usize::try_from(n).unwrap_or(usize::MAX);
    }
    if let Some(n) = integer(pool.min_idle.as_ref(), "min_idle")? {
        policy.min_idle = usize::try_from(n).unwrap_or(0);
    }
    if let Some(b) = boolean(pool.lifo.as_ref(), "lifo")? {
        policy.lifo = b;
    }
    if let Some(ms) = millis(pool.max_wait_ms.as_ref(), "max_wait_ms")? {
        policy.max_wait = ms;
    }
    if let Some(b) = boolean(pool.block_when_exhausted.as_ref(), "block_when_exhausted")? {
        policy.block_when_exhausted = b;
    }
    if let Some(ms) = millis(pool.min_evictable_idle_ms.as_ref(), "min_evictable_idle_ms")? {
        policy.min_evictable_idle = ms;
    }
    if let Some(ms) = millis(
        pool.soft_min_evictable_idle_ms.as_ref(),
        "soft_min_evictable_idle_ms",
    )? {
        policy.soft_min_evictable_idle = Some(ms);
    }
    if let Some(n) = integer(
        pool.num_tests_per_eviction_run.as_ref(),
        "num_tests_per_eviction_run",
    )? {
        policy.num_tests_per_eviction_run = i32::try_from(n).map_err(|_| {
            ConfigError::Format(format!("num_tests_per_eviction_run out of range: {}", n))
        })?;
    }
    if let Some(ms) = millis(
        pool.time_between_eviction_runs_ms.as_ref(),
        "time_between_eviction_runs_ms",
    )? {
        policy.time_between_eviction_runs = ms;
    }
    if let Some(b) = boolean(pool.test_on_borrow.as_ref(), "test_on_borrow")? {
        policy.test_on_borrow = b;
    }
    if let Some(b) = boolean(pool.test_on_return.as_ref(), "test_on_return")? {
        policy.test_on_return = b;
    }
    if let Some(b) = boolean(pool.test_while_idle.as_ref(), "test_while_idle")? {
        policy.test_while_idle = b;
    }
    Ok(())
}

fn integer(value: Option<&RawValue>, field: &str) -> Result<Option<i64>, ConfigError> {
    match value {
        None => Ok(None),
        Some(RawValue::Integer(n)) => Ok(Some(*n)),
        Some(RawValue::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(RawValue::Text(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Format(format!("{} is not an integer: '{}'", field, s))),
        Some(RawValue::Boolean(_)) => Err(ConfigError::Format(format!(
            "{} must be an integer",
            field
        ))),
    }
}

fn millis(value: Option<&RawValue>, field: &str) -> Result<Option<Duration>, ConfigError> {
    match integer(value, field)? {
        None => Ok(None),
        Some(ms) if ms < 0 => Err(ConfigError::Format(format!(
            "{} must not be negative: {}",
            field, ms
        ))),
        Some(ms) => Ok(Some(Duration::from_millis(ms as u64))),
    }
}

/// Only a case-insensitive "true" is true, any other text is false.
fn boolean(value: Option<&RawValue>, field: &str) -> Result<Option<bool>, ConfigError> {
    match value {
        None => Ok(None),
        Some(RawValue::Boolean(b)) => Ok(Some(*b)),
        Some(RawValue::Text(s)) if s.trim().is_empty() => Ok(None),
        Some(RawValue::Text(s)) => Ok(Some(s.trim().eq_ignore_ascii_case("true"))),
        Some(RawValue::Integer(_)) => Err(ConfigError::Format(format!(
            "{} must be a boolean",
            field
        ))),
    }
}

fn text(value: Option<&RawValue>) -> Option<String> {
    match value {
        None => None,
        Some(RawValue::Text(s)) if s.trim().is_empty() => None,
        Some(RawValue::Text(s)) => Some(s.clone()),
        Some(RawValue::Integer(n)) => Some(n.to_string()),
        Some(RawValue::Boolean(b)) => Some(b.to_string()),
    }
}
