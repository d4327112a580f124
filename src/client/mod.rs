//! Sharded cache client facade.
//!
//! # Data Flow
//! ```text
//! ShardedClient::connect(identity, source, connector, registry, shutdown)
//!     → registry.get_or_create(identity)
//!         → (first caller only) source.sync → value → parse → ActivePool::build
//!     → creator: source.monitor → ReloadCoordinator task
//!
//! execute(key, args)
//!     → registry.get(identity)   (current pool, on every call)
//!     → ActivePool::connection_for(key) → CacheConnection::execute
//! ```

pub mod commands;

use std::future::Future;
use std::sync::Arc;

use crate::config::source::is_blank;
use crate::config::{parse, ConfigChange, ConfigError, ConfigSource};
use crate::lifecycle::Shutdown;
use crate::node::resp::RespValue;
use crate::pool::{
    ActivePool, CacheConnection, Connector, PoolError, PoolRegistry, ReloadCoordinator,
    ReloadStats, TeardownReport,
};

/// Client bound to one configuration identity.
///
/// Holds no pool reference of its own: every command resolves the pool
/// currently registered for the identity.
pub struct ShardedClient<C: Connector> {
    identity: String,
    registry: Arc<PoolRegistry<C::Pool>>,
}

impl<C: Connector> Clone for ShardedClient<C> {
    fn clone(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl<C: Connector> ShardedClient<C> {
    /// Initialize the pool for `identity` if needed and return a client for it.
    ///
    /// Only the call that builds the pool installs the change monitor and
    /// starts the reload coordinator, so each identity is monitored once.
    /// Startup failures are returned to the caller.
    pub async fn connect<S: ConfigSource>(
        identity: impl Into<String>,
        source: Arc<S>,
        connector: Arc<C>,
        registry: Arc<PoolRegistry<C::Pool>>,
        shutdown: &Shutdown,
    ) -> Result<Self, PoolError> {
        let identity = identity.into();

        let registered = registry
            .get_or_create(&identity, || {
                bootstrap(&identity, source.as_ref(), connector.as_ref(), registry.as_ref())
            })
            .await?;

        if registered.created {
            let changes = source.monitor();
            let coordinator =
                ReloadCoordinator::new(identity.clone(), registry.clone(), connector.clone());

            // Catch up with any change published between the build and the
            // monitor registration. A matching topology is a no-op.
            if let Some(value) = source.value() {
                coordinator
                    .handle(ConfigChange {
                        old: None,
                        new: Some(value),
                    })
                    .await;
            }

            tokio::spawn(coordinator.run(changes, shutdown.subscribe()));
        }

        Ok(Self { identity, registry })
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// The pool registered for this identity right now.
    pub fn current(&self) -> Result<Arc<ActivePool<C::Pool>>, PoolError> {
        self.registry
            .get(&self.identity)
            .ok_or_else(|| PoolError::NotRegistered(self.identity.clone()))
    }

    /// Reload counters for this identity.
    pub fn reload_stats(&self) -> Option<Arc<ReloadStats>> {
        self.registry.reload_stats(&self.identity)
    }

    /// Run one command on the node owning `key`.
    pub async fn execute(&self, key: &[u8], args: &[&[u8]]) -> Result<RespValue, PoolError> {
        self.on_current(|pool| async move {
            let mut conn = pool.connection_for(key).await?;
            conn.execute(args).await
        })
        .await
    }

    /// Run `op` against the current pool.
    ///
    /// A reload may close the pool `op` resolved before it borrowed a
    /// connection. When `op` fails with `Closed` and a newer pool is
    /// registered, it runs once more against that pool.
    pub(crate) async fn on_current<T, F, Fut>(&self, mut op: F) -> Result<T, PoolError>
    where
        F: FnMut(Arc<ActivePool<C::Pool>>) -> Fut,
        Fut: Future<Output = Result<T, PoolError>>,
    {
        let pool = self.current()?;
        match op(pool.clone()).await {
            Err(PoolError::Closed(endpoint)) if self.superseded(&pool) => {
                tracing::debug!(
                    identity = %self.identity,
                    generation = pool.generation(),
                    endpoint = %endpoint,
                    "Pool replaced during command, retrying on current pool"
                );
                op(self.current()?).await
            }
            result => result,
        }
    }

    fn superseded(&self, pool: &ActivePool<C::Pool>) -> bool {
        self.registry
            .get(&self.identity)
            .is_some_and(|current| current.generation() != pool.generation())
    }

    /// Remove the identity from the registry and close its pool.
    pub async fn shutdown(&self) -> Option<TeardownReport> {
        let pool = self.registry.remove(&self.identity)?;
        tracing::info!(identity = %self.identity, "Shutting down client pool");
        Some(pool.close().await)
    }
}

async fn bootstrap<S, C>(
    identity: &str,
    source: &S,
    connector: &C,
    registry: &PoolRegistry<C::Pool>,
) -> Result<ActivePool<C::Pool>, PoolError>
where
    S: ConfigSource,
    C: Connector,
{
    source.sync().await?;
    let raw = source.value().unwrap_or_default();
    if is_blank(Some(&raw)) {
        return Err(ConfigError::Unavailable(format!(
            "configuration for '{}' is empty",
            identity
        ))
        .into());
    }

    let (topology, policy) = parse(&raw)?;
    ActivePool::build(identity, registry.next_generation(), topology, policy, connector).await
}
