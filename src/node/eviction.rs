//! Idle connection eviction.
//!
//! # Responsibilities
//! - Periodically examine the oldest idle connections of a node pool
//! - Evict by hard and soft idle-time limits
//! - Validate survivors when `test_while_idle` is set
//! - Top the idle set back up to `min_idle`
//!
//! The evictor task only holds a weak reference to its pool and exits once
//! the pool is closed or dropped.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time;

use crate::node::tcp::{Connection, IdleConnection, PoolInner, Reserved};

/// What one eviction pass did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EvictionStats {
    pub examined: usize,
    pub evicted: usize,
    pub created: usize,
}

pub(crate) fn spawn_evictor(pool: Weak<PoolInner>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
        loop {
            ticker.tick().await;
            let inner = match pool.upgrade() {
                Some(inner) => inner,
                None => break,
            };
            if inner.is_closed() {
                break;
            }
            let stats = run_eviction(&inner).await;
            if stats.evicted > 0 || stats.created > 0 {
                tracing::debug!(
                    endpoint = %inner.endpoint,
                    examined = stats.examined,
                    evicted = stats.evicted,
                    created = stats.created,
                    "Eviction run finished"
                );
            }
        }
    })
}

/// Connections to examine in one run. Negative `n` examines `ceil(idle / |n|)`.
pub(crate) fn tests_per_run(n: i32, idle: usize) -> usize {
    if n >= 0 {
        (n as usize).min(idle)
    } else {
        let divisor = n.unsigned_abs() as usize;
        idle.div_ceil(divisor)
    }
}

pub(crate) async fn run_eviction(inner: &Arc<PoolInner>) -> EvictionStats {
    let policy = &inner.policy;
    let now = Instant::now();

    // Take the oldest entries out so borrowers never see one mid-check.
    let (candidates, mut remaining) = {
        let mut idle = inner.lock_idle();
        let total = idle.len();
        let take = tests_per_run(policy.num_tests_per_eviction_run, total);
        let candidates: Vec<IdleConnection> = idle.drain(..take).collect();
        (candidates, total)
    };

    let mut stats = EvictionStats {
        examined: candidates.len(),
        ..EvictionStats::default()
    };
    let mut survivors = Vec::with_capacity(candidates.len());

    for mut entry in candidates {
        let idle_for = now.saturating_duration_since(entry.since);
        let hard = idle_for > policy.min_evictable_idle;
        let soft = policy
            .soft_min_evictable_idle
            .is_some_and(|limit| idle_for > limit && remaining > policy.min_idle);

        if hard || soft {
            stats.evicted += 1;
            remaining -= 1;
            continue;
        }
        if policy.test_while_idle && !entry.conn.ping().await {
            stats.evicted += 1;
            remaining -= 1;
            continue;
        }
        survivors.push(entry);
    }

    {
        let mut idle = inner.lock_idle();
        if !inner.is_closed() {
            for entry in survivors.into_iter().rev() {
                idle.push_front(entry);
            }
        }
    }

    stats.created = ensure_min_idle(inner).await;
    stats
}

async fn ensure_min_idle(inner: &Arc<PoolInner>) -> usize {
    let mut created = 0;
    loop {
        if inner.is_closed() || inner.lock_idle().len() >= inner.policy.min_idle {
            break;
        }
        let permit = match inner.reserve(None).await {
            Ok(Reserved::Permit(permit)) => permit,
            _ => break,
        };
        match Connection::open(&inner.endpoint, &inner.policy).await {
            Ok(conn) => {
                let mut idle = inner.lock_idle();
                if inner.is_closed() {
                    break;
                }
                idle.push_back(IdleConnection {
                    conn,
                    permit,
                    since: Instant::now(),
                });
                created += 1;
            }
            Err(e) => {
                tracing::warn!(endpoint = %inner.endpoint, error = %e, "Failed to create idle connection");
                break;
            }
        }
    }
    created
}
