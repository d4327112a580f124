//! Registry and hot-reload behavior against an in-memory connector.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use shard_pool::config::{ConfigChange, ConfigSource, Endpoint, MemoryConfigSource, PoolPolicy};
use shard_pool::lifecycle::Shutdown;
use shard_pool::pool::{NodePool, PoolError, PoolRegistry, ReloadCoordinator, ReloadOutcome};
use shard_pool::ShardedClient;

mod common;

use common::{document, eventually, within, MockConnector, MockPool};

const IDENTITY: &str = "shards/default";

fn ep(host: &str, port: u16) -> Endpoint {
    Endpoint::new(host, port)
}

fn change(nodes: &[&str]) -> ConfigChange {
    ConfigChange {
        old: None,
        new: Some(document(nodes)),
    }
}

async fn setup(
    nodes: &[&str],
) -> (
    ShardedClient<MockConnector>,
    Arc<MemoryConfigSource>,
    Arc<MockConnector>,
    Arc<PoolRegistry<MockPool>>,
    Shutdown,
) {
    let source = Arc::new(MemoryConfigSource::with_value(document(nodes)));
    let connector = Arc::new(MockConnector::new());
    let registry = Arc::new(PoolRegistry::new());
    let shutdown = Shutdown::new();
    let client = ShardedClient::connect(
        IDENTITY,
        source.clone(),
        connector.clone(),
        registry.clone(),
        &shutdown,
    )
    .await
    .unwrap();
    (client, source, connector, registry, shutdown)
}

/// A key owned by `endpoint` in the client's current pool.
fn key_owned_by(client: &ShardedClient<MockConnector>, endpoint: &Endpoint) -> String {
    let pool = client.current().unwrap();
    (0..10_000)
        .map(|i| format!("key-{}", i))
        .find(|key| pool.endpoint_for(key.as_bytes()) == Some(endpoint))
        .expect("some key routes to the endpoint")
}

#[tokio::test]
async fn test_end_to_end_reload_scenario() {
    let (client, source, connector, _registry, _shutdown) =
        setup(&["A:7000", "B:7001", "C:7002"]).await;

    let pool = client.current().unwrap();
    assert_eq!(pool.policy(), &PoolPolicy::default());
    assert_eq!(pool.topology().len(), 3);
    assert_eq!(connector.log.connects(), 3);
    drop(pool);

    let stats = client.reload_stats().unwrap();

    // Reordered only: no rebuild.
    let skipped = stats.skipped();
    source.publish(document(&["C:7002", "a:7000", "B:7001"]));
    assert!(eventually(|| stats.skipped() > skipped).await);
    assert_eq!(stats.rebuilds(), 0);
    assert_eq!(connector.log.connects(), 3);

    // C replaced by D.
    source.publish(document(&["A:7000", "B:7001", "D:7003"]));
    assert!(eventually(|| stats.rebuilds() == 1).await);
    assert!(eventually(|| connector.log.closes().len() == 3).await);

    let closed: BTreeSet<Endpoint> = connector.log.closes().into_iter().collect();
    assert_eq!(
        closed,
        BTreeSet::from([ep("a", 7000), ep("b", 7001), ep("c", 7002)])
    );

    let d = ep("d", 7003);
    let key = key_owned_by(&client, &d);
    let reply = within(client.get(key.as_bytes())).await.unwrap();
    assert_eq!(reply, Some(b"d:7003".to_vec()));
}

#[tokio::test]
async fn test_reordered_nodes_do_not_rebuild() {
    let (_client, _source, connector, registry, _shutdown) = setup(&["A:7000", "B:7001"]).await;
    let coordinator = ReloadCoordinator::new(IDENTITY, registry.clone(), connector.clone());
    let before = registry.get(IDENTITY).unwrap();
    let skipped = coordinator.stats().skipped();

    let outcome = coordinator.handle(change(&["b:7001", "A:7000"])).await;

    assert!(matches!(outcome, ReloadOutcome::Unchanged));
    assert_eq!(connector.log.connects(), 2);
    assert!(connector.log.closes().is_empty());
    assert!(Arc::ptr_eq(&before, &registry.get(IDENTITY).unwrap()));
    assert_eq!(coordinator.stats().skipped(), skipped + 1);
}

#[tokio::test]
async fn test_blank_change_is_ignored() {
    let (_client, _source, connector, registry, _shutdown) = setup(&["A:7000"]).await;
    let coordinator = ReloadCoordinator::new(IDENTITY, registry.clone(), connector.clone());

    let blank = ConfigChange {
        old: None,
        new: Some("   ".into()),
    };
    assert!(matches!(coordinator.handle(blank).await, ReloadOutcome::Ignored));
    let missing = ConfigChange { old: None, new: None };
    assert!(matches!(coordinator.handle(missing).await, ReloadOutcome::Ignored));
    assert_eq!(connector.log.connects(), 1);
}

#[tokio::test]
async fn test_concurrent_readers_see_complete_pools() {
    let (_client, _source, connector, registry, _shutdown) =
        setup(&["A:7000", "B:7001", "C:7002"]).await;
    connector.log.set_connect_delay(Duration::from_millis(30));

    let old: BTreeSet<Endpoint> = [ep("a", 7000), ep("b", 7001), ep("c", 7002)].into();
    let new: BTreeSet<Endpoint> = [ep("a", 7000), ep("b", 7001), ep("d", 7003)].into();

    let stop = Arc::new(AtomicBool::new(false));
    let reads = Arc::new(AtomicUsize::new(0));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let registry = registry.clone();
        let stop = stop.clone();
        let reads = reads.clone();
        let (old, new) = (old.clone(), new.clone());
        readers.push(tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                let pool = registry.get(IDENTITY).unwrap();
                let seen: BTreeSet<Endpoint> = pool.endpoints().cloned().collect();
                assert!(seen == old || seen == new, "partial pool observed: {:?}", seen);
                reads.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
            }
        }));
    }

    let coordinator = ReloadCoordinator::new(IDENTITY, registry.clone(), connector.clone());
    let outcome = coordinator
        .handle(change(&["A:7000", "B:7001", "D:7003"]))
        .await;
    assert!(matches!(outcome, ReloadOutcome::Reloaded { .. }));

    // Once the swap is reported, only the new pool is visible.
    let after: BTreeSet<Endpoint> = registry.get(IDENTITY).unwrap().endpoints().cloned().collect();
    assert_eq!(after, new);

    stop.store(true, Ordering::SeqCst);
    for reader in readers {
        reader.await.unwrap();
    }
    assert!(reads.load(Ordering::SeqCst) > 0);
}

#[tokio::test]
async fn test_teardown_failure_still_closes_other_nodes() {
    let (_client, _source, connector, registry, _shutdown) =
        setup(&["A:7000", "B:7001", "C:7002"]).await;
    connector.log.fail_close(ep("c", 7002));
    let old = registry.get(IDENTITY).unwrap();

    let coordinator = ReloadCoordinator::new(IDENTITY, registry.clone(), connector.clone());
    let outcome = coordinator
        .handle(change(&["A:7000", "B:7001", "D:7003"]))
        .await;

    match outcome {
        ReloadOutcome::Reloaded { teardown, .. } => {
            assert_eq!(teardown.closed, 2);
            assert_eq!(teardown.failed.len(), 1);
            assert!(matches!(
                &teardown.failed[0],
                PoolError::Teardown { endpoint, .. } if *endpoint == ep("c", 7002)
            ));
        }
        other => panic!("expected reload, got {:?}", other),
    }

    assert_eq!(connector.log.closes().len(), 3);
    assert!(old.is_closing());
    assert!(old.endpoints().all(|e| old.node(e).is_some_and(|n| n.is_closed())));
    assert!(registry.get(IDENTITY).unwrap().topology().contains(&ep("d", 7003)));
}

#[tokio::test]
async fn test_failed_rebuild_keeps_current_pool() {
    let (client, _source, connector, registry, _shutdown) = setup(&["A:7000", "B:7001"]).await;
    connector.log.fail_connect(ep("d", 7003));
    let before = registry.get(IDENTITY).unwrap();

    let coordinator = ReloadCoordinator::new(IDENTITY, registry.clone(), connector.clone());
    let outcome = coordinator.handle(change(&["A:7000", "D:7003"])).await;

    assert!(matches!(outcome, ReloadOutcome::Failed(PoolError::Construction(_))));
    assert!(Arc::ptr_eq(&before, &registry.get(IDENTITY).unwrap()));
    assert!(!before.is_closing());
    // Only the abandoned replacement's A node was closed.
    assert_eq!(connector.log.closes(), vec![ep("a", 7000)]);
    assert_eq!(coordinator.stats().failed(), 1);

    // Old pool still serves.
    let key = key_owned_by(&client, &ep("b", 7001));
    assert_eq!(client.get(key.as_bytes()).await.unwrap(), Some(b"b:7001".to_vec()));
}

#[tokio::test]
async fn test_invalid_document_is_reported_and_ignored() {
    let (_client, _source, connector, registry, _shutdown) = setup(&["A:7000"]).await;
    let coordinator = ReloadCoordinator::new(IDENTITY, registry.clone(), connector.clone());

    let broken = ConfigChange {
        old: None,
        new: Some("[config]\nnodes = [\"a:notaport\"]\n".into()),
    };
    assert!(matches!(
        coordinator.handle(broken).await,
        ReloadOutcome::Failed(PoolError::Config(_))
    ));
    assert!(registry.get(IDENTITY).unwrap().topology().contains(&ep("a", 7000)));
}

#[tokio::test]
async fn test_concurrent_connect_builds_once() {
    let source = Arc::new(MemoryConfigSource::with_value(document(&["A:7000", "B:7001"])));
    let connector = Arc::new(MockConnector::new());
    connector.log.set_connect_delay(Duration::from_millis(20));
    let registry = Arc::new(PoolRegistry::new());
    let shutdown = Arc::new(Shutdown::new());

    let mut handles = Vec::new();
    for _ in 0..8 {
        let (source, connector, registry, shutdown) =
            (source.clone(), connector.clone(), registry.clone(), shutdown.clone());
        handles.push(tokio::spawn(async move {
            let client = ShardedClient::connect(IDENTITY, source, connector, registry, &shutdown)
                .await
                .unwrap();
            client.current().unwrap()
        }));
    }

    let mut pools = Vec::new();
    for handle in handles {
        pools.push(handle.await.unwrap());
    }
    assert_eq!(connector.log.connects(), 2);
    assert!(pools.iter().all(|p| Arc::ptr_eq(p, &pools[0])));
    // One monitor: a single reload coordinator is listening.
    assert_eq!(shutdown.receiver_count(), 1);
}

#[tokio::test]
async fn test_connect_without_value_fails() {
    let source = Arc::new(MemoryConfigSource::with_sync_timeout(Duration::from_millis(50)));
    let connector = Arc::new(MockConnector::new());
    let registry = Arc::new(PoolRegistry::new());
    let shutdown = Shutdown::new();

    let result =
        ShardedClient::connect(IDENTITY, source.clone(), connector, registry.clone(), &shutdown).await;
    assert!(result.is_err());
    assert!(registry.get(IDENTITY).is_none());
    assert!(source.value().is_none());
}

#[tokio::test]
async fn test_client_shutdown_removes_identity() {
    let (client, _source, connector, registry, shutdown) = setup(&["A:7000", "B:7001"]).await;

    let report = client.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.closed, 2);
    assert!(registry.get(IDENTITY).is_none());
    assert!(matches!(client.current(), Err(PoolError::NotRegistered(_))));
    assert_eq!(connector.log.closes().len(), 2);

    shutdown.trigger();
    assert!(eventually(|| shutdown.receiver_count() == 0).await);
}

#[tokio::test]
async fn test_mget_and_mset_span_nodes() {
    let (client, _source, _connector, _registry, _shutdown) =
        setup(&["A:7000", "B:7001", "C:7002"]).await;

    let a = key_owned_by(&client, &ep("a", 7000));
    let c = key_owned_by(&client, &ep("c", 7002));

    client
        .mset(&[(a.as_bytes(), &b"1"[..]), (c.as_bytes(), &b"2"[..])])
        .await
        .unwrap();

    // The mock answers each key with the node that owns it.
    let values = client.mget(&[c.as_bytes(), a.as_bytes()]).await.unwrap();
    assert_eq!(values, vec![Some(b"c:7002".to_vec()), Some(b"a:7000".to_vec())]);
}

#[tokio::test]
async fn test_command_in_flight_during_reload_uses_new_pool() {
    let (client, _source, connector, registry, _shutdown) =
        setup(&["A:7000", "B:7001", "C:7002"]).await;
    let key = key_owned_by(&client, &ep("a", 7000));
    connector.log.set_acquire_delay(Duration::from_millis(50));

    // The command resolves the old pool, then waits inside the borrow.
    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.get(key.as_bytes()).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let coordinator = ReloadCoordinator::new(IDENTITY, registry.clone(), connector.clone());
    let outcome = coordinator
        .handle(change(&["A:7000", "B:7001", "D:7003"]))
        .await;
    assert!(matches!(outcome, ReloadOutcome::Reloaded { .. }));
    assert_eq!(connector.log.closes().len(), 3);

    let reply = within(reader).await.unwrap().unwrap();
    assert_eq!(reply, Some(b"a:7000".to_vec()));
}

#[tokio::test]
async fn test_mget_in_flight_during_reload_uses_new_pool() {
    let (client, _source, connector, registry, _shutdown) =
        setup(&["A:7000", "B:7001", "C:7002"]).await;
    let a = key_owned_by(&client, &ep("a", 7000));
    let c = key_owned_by(&client, &ep("c", 7002));
    connector.log.set_acquire_delay(Duration::from_millis(50));

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.mget(&[a.as_bytes(), c.as_bytes()]).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    let coordinator = ReloadCoordinator::new(IDENTITY, registry.clone(), connector.clone());
    coordinator
        .handle(change(&["A:7000", "B:7001", "D:7003"]))
        .await;

    let values = within(reader).await.unwrap().unwrap();
    assert_eq!(values.len(), 2);
    // C is gone; its key is now served by the node that took over its slots.
    assert_eq!(values[1], Some(b"d:7003".to_vec()));
}
