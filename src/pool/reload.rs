//! Hot reload of an identity's pool on configuration change.
//!
//! # States
//! ```text
//! Idle → (non-empty new value) → Comparing
//! Comparing → topology equal → Idle
//! Comparing → topology differs → Rebuilding
//! Rebuilding → build failed → Idle (registry untouched)
//! Rebuilding → built → Swapping → DrainingOld → Idle
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::source::is_blank;
use crate::config::{parse, parse_topology, ConfigChange};
use crate::lifecycle::ShutdownSignal;
use crate::observability::metrics;
use crate::pool::active::{ActivePool, TeardownReport};
use crate::pool::registry::PoolRegistry;
use crate::pool::{Connector, PoolError};

/// Reload counters for one identity.
#[derive(Debug, Default)]
pub struct ReloadStats {
    rebuilds: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

impl ReloadStats {
    /// Replacement pools installed.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    /// Changes ignored because the topology was unchanged.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    /// Changes that could not be applied.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// What a single change notification led to.
#[derive(Debug)]
pub enum ReloadOutcome {
    /// Blank new value, or the identity is no longer registered.
    Ignored,
    /// The new topology matches the one being served.
    Unchanged,
    /// A replacement pool was installed and the old one drained.
    Reloaded {
        generation: u64,
        teardown: TeardownReport,
    },
    /// The change could not be applied; the previous pool keeps serving.
    Failed(PoolError),
}

impl ReloadOutcome {
    fn label(&self) -> &'static str {
        match self {
            ReloadOutcome::Ignored => "ignored",
            ReloadOutcome::Unchanged => "unchanged",
            ReloadOutcome::Reloaded { .. } => "reloaded",
            ReloadOutcome::Failed(_) => "failed",
        }
    }
}

/// Applies configuration changes for one identity.
pub struct ReloadCoordinator<C: Connector> {
    identity: String,
    registry: Arc<PoolRegistry<C::Pool>>,
    connector: Arc<C>,
    stats: Arc<ReloadStats>,
}

impl<C: Connector> ReloadCoordinator<C> {
    pub fn new(
        identity: impl Into<String>,
        registry: Arc<PoolRegistry<C::Pool>>,
        connector: Arc<C>,
    ) -> Self {
        let identity = identity.into();
        let stats = registry.reload_stats(&identity).unwrap_or_default();
        Self {
            identity,
            registry,
            connector,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<ReloadStats> {
        &self.stats
    }

    /// Apply changes serially until the channel closes or shutdown fires.
    pub async fn run(
        self,
        mut changes: mpsc::UnboundedReceiver<ConfigChange>,
        mut shutdown: ShutdownSignal,
    ) {
        tracing::info!(identity = %self.identity, "Reload coordinator started");
        loop {
            tokio::select! {
                change = changes.recv() => {
                    match change {
                        Some(change) => {
                            self.handle(change).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.wait() => {
                    tracing::info!(identity = %self.identity, "Reload coordinator received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }

    /// Process one change notification.
    pub async fn handle(&self, change: ConfigChange) -> ReloadOutcome {
        let outcome = self.apply(change).await;
        match &outcome {
            ReloadOutcome::Failed(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    identity = %self.identity,
                    error = %e,
                    "Failed to apply config change. Keeping current pool."
                );
            }
            ReloadOutcome::Unchanged => {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
            }
            ReloadOutcome::Reloaded { .. } => {
                self.stats.rebuilds.fetch_add(1, Ordering::Relaxed);
            }
            ReloadOutcome::Ignored => {}
        }
        metrics::record_reload(&self.identity, outcome.label());
        outcome
    }

    async fn apply(&self, change: ConfigChange) -> ReloadOutcome {
        let raw = match change.new.as_deref() {
            Some(raw) if !is_blank(Some(raw)) => raw,
            _ => {
                tracing::debug!(identity = %self.identity, "Ignoring blank config value");
                return ReloadOutcome::Ignored;
            }
        };

        let current = match self.registry.get(&self.identity) {
            Some(current) => current,
            None => {
                tracing::debug!(identity = %self.identity, "Identity not registered, ignoring change");
                return ReloadOutcome::Ignored;
            }
        };

        // Comparing
        let topology = match parse_topology(raw) {
            Ok(topology) => topology,
            Err(e) => return ReloadOutcome::Failed(e.into()),
        };
        if topology == *current.topology() {
            tracing::debug!(
                identity = %self.identity,
                topology = %topology,
                "Topology unchanged, skipping rebuild"
            );
            return ReloadOutcome::Unchanged;
        }

        // Rebuilding
        let (topology, policy) = match parse(raw) {
            Ok(parsed) => parsed,
            Err(e) => return ReloadOutcome::Failed(e.into()),
        };
        tracing::info!(
            identity = %self.identity,
            from = %current.topology(),
            to = %topology,
            "Topology changed, rebuilding pool"
        );
        let generation = self.registry.next_generation();
        let replacement = match ActivePool::build(
            &self.identity,
            generation,
            topology,
            policy,
            self.connector.as_ref(),
        )
        .await
        {
            Ok(pool) => Arc::new(pool),
            Err(e) => return ReloadOutcome::Failed(e),
        };

        // Swapping
        let previous = match self.registry.swap(&self.identity, replacement.clone()) {
            Some(previous) => previous,
            None => {
                tracing::info!(identity = %self.identity, "Identity removed during rebuild, discarding replacement");
                replacement.close().await;
                return ReloadOutcome::Ignored;
            }
        };
        drop(current);
        tracing::info!(
            identity = %self.identity,
            generation,
            replaced = previous.generation(),
            "Swapped in replacement pool"
        );

        // DrainingOld
        let teardown = previous.close().await;
        ReloadOutcome::Reloaded {
            generation,
            teardown,
        }
    }
}
