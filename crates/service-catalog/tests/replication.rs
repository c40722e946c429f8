//! Cluster tests over the in-process replication transport

use service_catalog::prelude::*;
use service_catalog::replication::{LocalCluster, MemberId};
use std::sync::Arc;
use std::time::Duration;

mod common;
use common::{init_tracing, wait_until};

fn config() -> CatalogConfig {
    CatalogConfig::default()
        .with_capacity(-1)
        .with_sync_wait_time(Duration::from_millis(500))
}

async fn node(cluster: &Arc<LocalCluster>, id: &str) -> Arc<CatalogMap> {
    CatalogMap::builder(config())
        .replication(cluster.join(id).expect("Failed to join cluster"))
        .build()
        .await
        .expect("Failed to build catalog map")
}

async fn has_instance(map: &CatalogMap, namespace: &str, id: &str) -> bool {
    match map.get_catalog(&Namespace::new(namespace)).await {
        Ok(catalog) => catalog.instance(id).await.is_ok(),
        Err(_) => false,
    }
}

async fn lacks_instance(map: &CatalogMap, namespace: &str, id: &str) -> bool {
    !has_instance(map, namespace, id).await
}

async fn has_status(map: &CatalogMap, namespace: &str, id: &str, status: &str) -> bool {
    match map.get_catalog(&Namespace::new(namespace)).await {
        Ok(catalog) => catalog
            .instance(id)
            .await
            .is_ok_and(|instance| instance.status == status),
        Err(_) => false,
    }
}

#[smol_potat::test]
async fn test_mutations_reach_peers() {
    init_tracing();
    let cluster = LocalCluster::new();
    let n1 = node(&cluster, "n1").await;
    let n2 = node(&cluster, "n2").await;
    assert!(n1.is_replicated());

    let catalog = n1.get_catalog(&Namespace::new("tenant")).await.unwrap();
    let registered = catalog
        .register(ServiceInstance::new("reviews", Endpoint::new("http", "10.0.0.1:9080")))
        .await
        .unwrap();
    let id = registered.id.clone();

    assert!(wait_until(|| has_instance(&n2, "tenant", &id)).await);
    let replica = n2
        .get_catalog(&Namespace::new("tenant"))
        .await
        .unwrap()
        .instance(&id)
        .await
        .unwrap();
    assert_eq!(replica.service_name, "reviews");
    assert_eq!(replica.registration_time, registered.registration_time);

    catalog.set_status(&id, UP).await.unwrap();
    assert!(wait_until(|| has_status(&n2, "tenant", &id, UP)).await);

    catalog.deregister(&id).await.unwrap();
    assert!(wait_until(|| lacks_instance(&n2, "tenant", &id)).await);

    n1.stop();
    n2.stop();
}

#[smol_potat::test]
async fn test_replication_is_symmetric() {
    init_tracing();
    let cluster = LocalCluster::new();
    let n1 = node(&cluster, "n1").await;
    let n2 = node(&cluster, "n2").await;

    let registered = n2
        .get_catalog(&Namespace::new("tenant"))
        .await
        .unwrap()
        .register(ServiceInstance::new("ratings", Endpoint::new("http", "10.0.0.2:9080")))
        .await
        .unwrap();

    assert!(wait_until(|| has_instance(&n1, "tenant", &registered.id)).await);
}

#[smol_potat::test]
async fn test_joining_node_synchronizes_state() {
    init_tracing();
    let cluster = LocalCluster::new();
    let n1 = node(&cluster, "n1").await;

    let mut expected = Vec::new();
    for (namespace, address) in [("a", "10.0.0.1:80"), ("a", "10.0.0.2:80"), ("b", "10.0.0.3:80")] {
        let instance = n1
            .get_catalog(&Namespace::new(namespace))
            .await
            .unwrap()
            .register(ServiceInstance::new("web", Endpoint::new("http", address)))
            .await
            .unwrap();
        expected.push((namespace, instance.id));
    }

    let n2 = node(&cluster, "n2").await;
    for (namespace, id) in &expected {
        assert!(
            wait_until(|| has_instance(&n2, namespace, id)).await,
            "instance {id} of {namespace} was not synchronized"
        );
    }
    assert_eq!(
        n2.namespaces().await,
        vec![Namespace::new("a"), Namespace::new("b")]
    );
}

#[smol_potat::test]
async fn test_renew_after_partition_triggers_read_repair() {
    init_tracing();
    let cluster = LocalCluster::new();
    let n1 = node(&cluster, "n1").await;
    let n2 = node(&cluster, "n2").await;
    let n2_id = MemberId::new("n2");

    cluster.disconnect(&n2_id);
    let catalog = n1.get_catalog(&Namespace::new("tenant")).await.unwrap();
    let missed = catalog
        .register(ServiceInstance::new("details", Endpoint::new("http", "10.0.0.9:80")))
        .await
        .unwrap();

    smol::Timer::after(Duration::from_millis(100)).await;
    assert!(!has_instance(&n2, "tenant", &missed.id).await);

    cluster.reconnect(&n2_id);
    catalog.renew(&missed.id).await.unwrap();

    assert!(wait_until(|| has_instance(&n2, "tenant", &missed.id)).await);
    let repaired = n2
        .get_catalog(&Namespace::new("tenant"))
        .await
        .unwrap()
        .instance(&missed.id)
        .await
        .unwrap();
    assert_eq!(repaired.registration_time, missed.registration_time);
}

#[smol_potat::test]
async fn test_replicas_ignore_capacity() {
    init_tracing();
    let cluster = LocalCluster::new();
    let n1 = CatalogMap::builder(config().with_capacity(5))
        .replication(cluster.join("n1").unwrap())
        .build()
        .await
        .unwrap();
    let n2 = CatalogMap::builder(config().with_capacity(1))
        .replication(cluster.join("n2").unwrap())
        .build()
        .await
        .unwrap();

    let catalog = n1.get_catalog(&Namespace::new("tenant")).await.unwrap();
    let mut ids = Vec::new();
    for port in 0..3 {
        let instance = catalog
            .register(ServiceInstance::new(
                "web",
                Endpoint::new("http", format!("10.0.0.1:{}", 8000 + port)),
            ))
            .await
            .unwrap();
        ids.push(instance.id);
    }

    for id in &ids {
        assert!(wait_until(|| has_instance(&n2, "tenant", id)).await);
    }

    // Local registrations on the replica still honor its own quota
    let err = n2
        .get_catalog(&Namespace::new("tenant"))
        .await
        .unwrap()
        .register(ServiceInstance::new("web", Endpoint::new("http", "10.0.0.2:80")))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NamespaceQuotaExceeded { .. }));
}
