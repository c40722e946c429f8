//! Namespace to catalog map and the builder assembling the factory chain

use super::adapter::AdapterCatalogFactory;
use super::external::ExternalCatalogFactory;
use super::memory::MemoryCatalogFactory;
use super::multi::ExtensionLayer;
use super::{Catalog, CatalogFactory, FactoryLayer, compose};
use crate::config::{CatalogConfig, StoreConfig};
use crate::discovery::filesystem::FileSystemDiscoveryFactory;
use crate::error::Result;
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::model::Namespace;
use crate::replication::{Replication, ReplicationHandler, ReplicationLayer};
use crate::store::Database;
use crate::store::sled::SledDatabase;
use futures::lock::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Lazily created catalogs, one per namespace.
///
/// The first [`get_catalog`](CatalogMap::get_catalog) call for a namespace
/// builds its catalog through the factory chain; later calls return the same
/// catalog.
pub struct CatalogMap {
    factory: Arc<dyn CatalogFactory>,
    catalogs: Mutex<HashMap<Namespace, Arc<dyn Catalog>>>,
    handler: Option<Arc<ReplicationHandler>>,
}

impl CatalogMap {
    /// Create a map over `factory`
    pub fn new(factory: Arc<dyn CatalogFactory>) -> Self {
        Self {
            factory,
            catalogs: Mutex::new(HashMap::new()),
            handler: None,
        }
    }

    /// Start assembling a map from configuration
    pub fn builder(config: CatalogConfig) -> CatalogMapBuilder {
        CatalogMapBuilder::new(config)
    }

    /// Catalog of `namespace`, created on first use
    pub async fn get_catalog(&self, namespace: &Namespace) -> Result<Arc<dyn Catalog>> {
        let mut catalogs = self.catalogs.lock().await;
        if let Some(catalog) = catalogs.get(namespace) {
            return Ok(catalog.clone());
        }

        let catalog = self.factory.create_catalog(namespace).await?;
        catalogs.insert(namespace.clone(), catalog.clone());
        info!(namespace = %namespace, total = catalogs.len(), "Catalog created");
        Ok(catalog)
    }

    /// Namespaces with a catalog
    pub async fn namespaces(&self) -> Vec<Namespace> {
        let mut namespaces: Vec<_> = self.catalogs.lock().await.keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    /// Whether peer replication is active
    pub fn is_replicated(&self) -> bool {
        self.handler.is_some()
    }

    /// Leave the replication cluster, if any
    pub fn stop(&self) {
        if let Some(handler) = &self.handler {
            handler.stop();
        }
    }
}

/// Assembles a [`CatalogMap`] from configuration.
///
/// The base factory follows the configured store. Replication is layered
/// over it for the in-memory store only, and read-only extensions (including
/// the configured filesystem source) wrap the result.
pub struct CatalogMapBuilder {
    config: CatalogConfig,
    replication: Option<Arc<dyn Replication>>,
    extensions: Vec<Arc<dyn CatalogFactory>>,
    database: Option<Arc<dyn Database>>,
    metrics: Arc<dyn MetricsSink>,
}

impl CatalogMapBuilder {
    /// Start from `config`
    pub fn new(config: CatalogConfig) -> Self {
        Self {
            config,
            replication: None,
            extensions: Vec::new(),
            database: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Replicate catalogs through `replication`
    pub fn replication(mut self, replication: Arc<dyn Replication>) -> Self {
        self.replication = Some(replication);
        self
    }

    /// Add a read-only catalog source
    pub fn extension(mut self, factory: Arc<dyn CatalogFactory>) -> Self {
        self.extensions.push(factory);
        self
    }

    /// Use `database` as external store, overriding the configured one
    pub fn with_database(mut self, database: Arc<dyn Database>) -> Self {
        self.database = Some(database);
        self
    }

    /// Report store metrics to `sink`
    pub fn metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    /// Build the map; with replication, returns after the initial peer sync
    pub async fn build(self) -> Result<Arc<CatalogMap>> {
        let config = self.config;
        config.validate()?;

        let database = match (self.database, &config.store) {
            (Some(database), _) => Some(database),
            (None, StoreConfig::Memory) => None,
            (None, StoreConfig::Sled { path }) => {
                Some(Arc::new(SledDatabase::open(path).await?) as Arc<dyn Database>)
            }
            (None, StoreConfig::Redis { address, password }) => {
                Some(open_redis(address, password.clone())?)
            }
        };

        let (base, external): (Arc<dyn CatalogFactory>, bool) = match database {
            Some(database) => (
                Arc::new(ExternalCatalogFactory::new(
                    config.clone(),
                    database,
                    self.metrics.clone(),
                )),
                true,
            ),
            None => (
                Arc::new(MemoryCatalogFactory::new(
                    config.clone(),
                    self.metrics.clone(),
                )),
                false,
            ),
        };

        let mut layers: Vec<Box<dyn FactoryLayer>> = Vec::new();
        let mut handler = None;
        match self.replication {
            Some(_) if external => {
                warn!("Replication is not supported over an external store; running unreplicated");
            }
            Some(replication) => {
                let replication_handler =
                    ReplicationHandler::new(replication, config.sync_wait_time);
                layers.push(Box::new(ReplicationLayer::new(replication_handler.clone())));
                handler = Some(replication_handler);
            }
            None => {}
        }

        let mut extensions = self.extensions;
        if let Some(filesystem) = &config.filesystem {
            let discovery = FileSystemDiscoveryFactory::new(filesystem).await?;
            extensions.push(Arc::new(AdapterCatalogFactory::new(Arc::new(discovery))));
        }
        if !extensions.is_empty() {
            layers.push(Box::new(ExtensionLayer::new(extensions)));
        }

        let map = Arc::new(CatalogMap {
            factory: compose(base, layers),
            catalogs: Mutex::new(HashMap::new()),
            handler: handler.clone(),
        });
        info!(
            store = ?config.store,
            replicated = map.is_replicated(),
            "Catalog map built"
        );

        if let Some(handler) = handler {
            handler.activate(Arc::downgrade(&map)).await?;
        }
        Ok(map)
    }
}

#[cfg(feature = "redis")]
fn open_redis(address: &str, password: Option<String>) -> Result<Arc<dyn Database>> {
    Ok(Arc::new(crate::store::redis::RedisDatabase::new(
        address, password,
    )?))
}

#[cfg(not(feature = "redis"))]
fn open_redis(_address: &str, _password: Option<String>) -> Result<Arc<dyn Database>> {
    Err(crate::error::Error::Config(
        "redis store requires the `redis` feature".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::model::{Endpoint, ServiceInstance};
    use crate::store::memory::MemoryDatabase;

    #[smol_potat::test]
    async fn test_catalogs_are_memoized_per_namespace() {
        let map = CatalogMap::builder(CatalogConfig::default())
            .build()
            .await
            .unwrap();
        let a = Namespace::new("a");

        let first = map.get_catalog(&a).await.unwrap();
        first
            .register(ServiceInstance::new("S", Endpoint::new("tcp", "x:1")))
            .await
            .unwrap();

        let again = map.get_catalog(&a).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(again.list("S", None).await.unwrap().len(), 1);

        let other = map.get_catalog(&Namespace::new("b")).await.unwrap();
        assert!(other.list("S", None).await.is_err());
        assert_eq!(map.namespaces().await, vec![a, Namespace::new("b")]);
        assert!(!map.is_replicated());
    }

    #[smol_potat::test]
    async fn test_invalid_config_is_rejected() {
        let config = CatalogConfig::default().with_ttls(
            std::time::Duration::from_secs(1),
            std::time::Duration::from_secs(5),
            std::time::Duration::from_secs(10),
        );
        assert!(matches!(
            CatalogMap::builder(config).build().await,
            Err(Error::Config(_))
        ));
    }

    #[smol_potat::test]
    async fn test_external_store_disables_replication() {
        let cluster = crate::replication::LocalCluster::new();
        let map = CatalogMap::builder(CatalogConfig::default())
            .with_database(Arc::new(MemoryDatabase::new()))
            .replication(cluster.join("n1").unwrap())
            .build()
            .await
            .unwrap();
        assert!(!map.is_replicated());

        let catalog = map.get_catalog(&Namespace::new("a")).await.unwrap();
        catalog
            .register(ServiceInstance::new("S", Endpoint::new("tcp", "x:1")))
            .await
            .unwrap();
        assert_eq!(catalog.list_services(None).await.len(), 1);
    }

    #[cfg(not(feature = "redis"))]
    #[smol_potat::test]
    async fn test_redis_requires_feature() {
        let config = CatalogConfig::default().with_store(StoreConfig::Redis {
            address: "127.0.0.1:6379".into(),
            password: None,
        });
        assert!(matches!(
            CatalogMap::builder(config).build().await,
            Err(Error::Config(_))
        ));
    }
}
