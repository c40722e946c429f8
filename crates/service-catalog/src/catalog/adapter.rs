//! Read-only catalog over a discovery source

use super::{Catalog, CatalogFactory, Predicate, accepts};
use crate::discovery::{DiscoveryFactory, ServiceDiscovery};
use crate::error::{Error, Result};
use crate::model::{Namespace, Service, ServiceInstance};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

/// Projects a [`ServiceDiscovery`] onto the [`Catalog`] interface
pub struct DiscoveryCatalog {
    discovery: Arc<dyn ServiceDiscovery>,
}

impl DiscoveryCatalog {
    /// Wrap a discovery source
    pub fn new(discovery: Arc<dyn ServiceDiscovery>) -> Self {
        Self { discovery }
    }

    fn unsupported(operation: &str) -> Error {
        info!("Unsupported API ({}) called on read-only catalog", operation);
        Error::read_only(operation)
    }
}

#[async_trait]
impl Catalog for DiscoveryCatalog {
    async fn register(&self, _instance: ServiceInstance) -> Result<ServiceInstance> {
        Err(Self::unsupported("Register"))
    }

    async fn deregister(&self, _instance_id: &str) -> Result<ServiceInstance> {
        Err(Self::unsupported("Deregister"))
    }

    async fn renew(&self, _instance_id: &str) -> Result<ServiceInstance> {
        Err(Self::unsupported("Renew"))
    }

    async fn set_status(&self, _instance_id: &str, _status: &str) -> Result<ServiceInstance> {
        Err(Self::unsupported("SetStatus"))
    }

    async fn instance(&self, instance_id: &str) -> Result<ServiceInstance> {
        self.discovery
            .list_instances()
            .await?
            .into_iter()
            .find(|instance| instance.id == instance_id)
            .map(ServiceInstance::from)
            .ok_or_else(|| Error::NoSuchServiceInstance(instance_id.to_string()))
    }

    async fn list(
        &self,
        service_name: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<ServiceInstance>> {
        let discovered = self.discovery.list_service_instances(service_name).await?;
        if discovered.is_empty() {
            return Err(Error::NoSuchServiceName(service_name.to_string()));
        }
        Ok(discovered
            .into_iter()
            .map(ServiceInstance::from)
            .filter(|instance| accepts(predicate, instance))
            .collect())
    }

    async fn list_services(&self, predicate: Option<&Predicate>) -> Vec<Service> {
        let names: Result<BTreeSet<String>> = match predicate {
            None => self
                .discovery
                .list_services()
                .await
                .map(|names| names.into_iter().collect()),
            Some(_) => self.discovery.list_instances().await.map(|instances| {
                instances
                    .into_iter()
                    .map(ServiceInstance::from)
                    .filter(|instance| accepts(predicate, instance))
                    .map(|instance| instance.service_name)
                    .collect()
            }),
        };

        match names {
            Ok(names) => names.into_iter().map(Service::new).collect(),
            Err(e) => {
                warn!(error = %e, "Discovery source failed to list services");
                Vec::new()
            }
        }
    }
}

/// Turns a [`DiscoveryFactory`] into a [`CatalogFactory`]
pub struct AdapterCatalogFactory {
    discovery: Arc<dyn DiscoveryFactory>,
}

impl AdapterCatalogFactory {
    /// Wrap a discovery factory
    pub fn new(discovery: Arc<dyn DiscoveryFactory>) -> Self {
        Self { discovery }
    }
}

#[async_trait]
impl CatalogFactory for AdapterCatalogFactory {
    async fn create_catalog(&self, namespace: &Namespace) -> Result<Arc<dyn Catalog>> {
        let discovery = self.discovery.create_discovery(namespace).await?;
        Ok(Arc::new(DiscoveryCatalog::new(discovery)))
    }
}
