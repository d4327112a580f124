//! Identity → active pool registry.
//!
//! # Responsibilities
//! - Single construction per identity under concurrent first access
//! - Lock-free reads of the current pool
//! - Atomic replacement and removal
//!
//! Each identity owns a slot holding a once-cell around an `ArcSwap`. The
//! once-cell serializes first construction for that identity only, so a
//! slow connect for one identity never delays another. Swaps and removals
//! take a short global mutation lock; reads take none.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::pool::active::ActivePool;
use crate::pool::reload::ReloadStats;
use crate::pool::{NodePool, PoolError};

struct Slot<P> {
    pool: OnceCell<ArcSwap<ActivePool<P>>>,
    stats: Arc<ReloadStats>,
}

impl<P> Slot<P> {
    fn new() -> Self {
        Self {
            pool: OnceCell::new(),
            stats: Arc::new(ReloadStats::default()),
        }
    }
}

/// Result of [`PoolRegistry::get_or_create`].
pub struct Registered<P> {
    pub pool: Arc<ActivePool<P>>,
    /// True only for the caller whose build installed the pool.
    pub created: bool,
}

/// Process-level mapping from configuration identity to its current pool.
pub struct PoolRegistry<P> {
    entries: DashMap<String, Arc<Slot<P>>>,
    mutation: Mutex<()>,
    generation: AtomicU64,
}

impl<P: NodePool> PoolRegistry<P> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            mutation: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Return the pool for `identity`, building it with `build` if absent.
    ///
    /// Concurrent callers for the same identity wait on one build; `build`
    /// runs at most once unless it fails, in which case the next caller
    /// retries. The registry is untouched by a failed build.
    ///
    /// If the identity is removed while the build runs, the built pool is
    /// closed by its creator and every waiter gets `NotRegistered`.
    pub async fn get_or_create<F, Fut, E>(
        &self,
        identity: &str,
        build: F,
    ) -> Result<Registered<P>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ActivePool<P>, E>>,
        E: From<PoolError>,
    {
        if let Some(pool) = self.get(identity) {
            return Ok(Registered {
                pool,
                created: false,
            });
        }

        let slot = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone();

        let mut created = false;
        let flag = &mut created;
        let current = slot
            .pool
            .get_or_try_init(move || async move {
                let pool = build().await?;
                *flag = true;
                Ok::<_, E>(ArcSwap::from_pointee(pool))
            })
            .await?;
        let pool = current.load_full();

        if !self.holds(identity, &slot) {
            if created {
                tracing::warn!(
                    identity = %identity,
                    generation = pool.generation(),
                    "Identity removed while its pool was being built, closing it"
                );
                pool.close().await;
            }
            return Err(PoolError::NotRegistered(identity.to_string()).into());
        }

        Ok(Registered { pool, created })
    }

    /// Whether `slot` is still the registered slot for `identity`.
    fn holds(&self, identity: &str, slot: &Arc<Slot<P>>) -> bool {
        let _guard = self.mutation.lock().unwrap_or_else(|e| e.into_inner());
        self.entries
            .get(identity)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), slot))
    }

    /// Current pool for `identity`. Never blocks on the mutation lock.
    pub fn get(&self, identity: &str) -> Option<Arc<ActivePool<P>>> {
        let slot = self.entries.get(identity)?;
        slot.pool.get().map(|current| current.load_full())
    }

    /// Atomically replace the pool for a registered identity and return the
    /// previous one. Returns `None`, leaving the registry unchanged, when
    /// the identity has no installed pool.
    pub fn swap(
        &self,
        identity: &str,
        pool: Arc<ActivePool<P>>,
    ) -> Option<Arc<ActivePool<P>>> {
        let _guard = self.mutation.lock().unwrap_or_else(|e| e.into_inner());
        let slot = self.entries.get(identity)?.clone();
        let current = slot.pool.get()?;
        Some(current.swap(pool))
    }

    /// Remove the mapping for `identity`, returning the pool it held.
    pub fn remove(&self, identity: &str) -> Option<Arc<ActivePool<P>>> {
        let _guard = self.mutation.lock().unwrap_or_else(|e| e.into_inner());
        let (_, slot) = self.entries.remove(identity)?;
        slot.pool.get().map(|current| current.load_full())
    }

    /// Reload counters for `identity`.
    pub fn reload_stats(&self, identity: &str) -> Option<Arc<ReloadStats>> {
        self.entries.get(identity).map(|slot| slot.stats.clone())
    }

    /// Identities with an installed pool.
    pub fn identities(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.value().pool.initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Next build generation number.
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Remove and close every registered pool. Returns how many were closed.
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for identity in self.identities() {
            if let Some(pool) = self.remove(&identity) {
                pool.close().await;
                closed += 1;
            }
        }
        tracing::info!(closed, "Pool registry shut down");
        closed
    }
}

impl<P: NodePool> Default for PoolRegistry<P> {
    fn default() -> Self {
        Self::new()
    }
}
