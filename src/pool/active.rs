//! The live set of per-node pools for one identity.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::join_all;

use crate::config::{ClusterTopology, Endpoint, PoolPolicy};
use crate::observability::metrics;
use crate::pool::router::SlotRouter;
use crate::pool::{Connector, NodePool, PoolError};

/// Outcome of closing an [`ActivePool`].
#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Node pools closed cleanly.
    pub closed: usize,
    /// Node pools whose close reported an error. They are discarded anyway.
    pub failed: Vec<PoolError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One node pool per endpoint, built from one topology and one policy.
///
/// Nothing is mutated after construction except the closing flag; a
/// configuration change always produces a new instance.
pub struct ActivePool<P> {
    identity: String,
    generation: u64,
    topology: ClusterTopology,
    policy: PoolPolicy,
    nodes: BTreeMap<Endpoint, P>,
    router: SlotRouter,
    closing: AtomicBool,
}

impl<P: NodePool> ActivePool<P> {
    /// Connect to every endpoint of `topology`.
    ///
    /// All nodes are connected concurrently. If any node fails the nodes
    /// already connected are closed and the whole build fails.
    pub async fn build<C>(
        identity: &str,
        generation: u64,
        topology: ClusterTopology,
        policy: PoolPolicy,
        connector: &C,
    ) -> Result<Self, PoolError>
    where
        C: Connector<Pool = P>,
    {
        if topology.is_empty() {
            return Err(PoolError::Construction(format!(
                "no nodes configured for '{}'",
                identity
            )));
        }

        let attempts = join_all(topology.endpoints().map(|endpoint| {
            let policy = &policy;
            async move { (endpoint.clone(), connector.connect(endpoint, policy).await) }
        }))
        .await;

        let mut nodes = BTreeMap::new();
        let mut failures = Vec::new();
        for (endpoint, result) in attempts {
            match result {
                Ok(pool) => {
                    nodes.insert(endpoint, pool);
                }
                Err(e) => failures.push(format!("{}: {}", endpoint, e)),
            }
        }

        if !failures.is_empty() {
            for (endpoint, pool) in &nodes {
                if let Err(e) = pool.close().await {
                    tracing::debug!(endpoint = %endpoint, error = %e, "Failed to close node pool of abandoned build");
                }
            }
            return Err(PoolError::Construction(failures.join("; ")));
        }

        tracing::info!(
            identity = %identity,
            generation,
            topology = %topology,
            "Active pool built"
        );
        metrics::record_pool_built(identity, nodes.len());

        let router = SlotRouter::new(&topology);
        Ok(Self {
            identity: identity.to_string(),
            generation,
            topology,
            policy,
            nodes,
            router,
            closing: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Monotonic build number within a registry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.nodes.keys()
    }

    pub fn node(&self, endpoint: &Endpoint) -> Option<&P> {
        self.nodes.get(endpoint)
    }

    /// Endpoint owning `key`.
    pub fn endpoint_for(&self, key: &[u8]) -> Option<&Endpoint> {
        self.router.owner(key)
    }

    /// Node pool owning `key`. Fails once teardown has begun.
    pub fn node_for(&self, key: &[u8]) -> Result<&P, PoolError> {
        let endpoint = self
            .endpoint_for(key)
            .ok_or_else(|| PoolError::NotRegistered(self.identity.clone()))?;
        if self.is_closing() {
            return Err(PoolError::Closed(endpoint.clone()));
        }
        self.nodes
            .get(endpoint)
            .ok_or_else(|| PoolError::NotRegistered(self.identity.clone()))
    }

    /// Borrow a connection from the node owning `key`.
    pub async fn connection_for(&self, key: &[u8]) -> Result<P::Connection, PoolError> {
        self.node_for(key)?.acquire().await
    }

    /// Borrow a connection from a specific node.
    pub async fn connection_on(&self, endpoint: &Endpoint) -> Result<P::Connection, PoolError> {
        if self.is_closing() {
            return Err(PoolError::Closed(endpoint.clone()));
        }
        match self.nodes.get(endpoint) {
            Some(node) => node.acquire().await,
            None => Err(PoolError::NotRegistered(self.identity.clone())),
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Close every node pool, continuing past failures.
    ///
    /// Only the first call does any work.
    pub async fn close(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.closing.swap(true, Ordering::AcqRel) {
            return report;
        }

        for (endpoint, node) in &self.nodes {
            match node.close().await {
                Ok(()) => report.closed += 1,
                Err(e) => {
                    tracing::warn!(
                        identity = %self.identity,
                        generation = self.generation,
                        endpoint = %endpoint,
                        error = %e,
                        "Failed to close node pool, discarding it anyway"
                    );
                    metrics::record_teardown_failure(&self.identity);
                    report.failed.push(e);
                }
            }
        }

        tracing::info!(
            identity = %self.identity,
            generation = self.generation,
            closed = report.closed,
            failed = report.failed.len(),
            "Active pool closed"
        );
        report
    }
}

impl<P> fmt::Debug for ActivePool<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivePool")
            .field("identity", &self.identity)
            .field("generation", &self.generation)
            .field("topology", &self.topology)
            .field("closing", &self.closing.load(Ordering::Relaxed))
            .finish()
    }
}
