//! Catalog composed of one read-write and several read-only catalogs

use super::{Catalog, CatalogFactory, FactoryLayer, Predicate};
use crate::error::{Error, Result};
use crate::model::{Namespace, Service, ServiceInstance};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::trace;

/// Merges the views of several catalogs.
///
/// Mutations go to the primary catalog only; queries consult every catalog.
pub struct MultiCatalog {
    primary: Arc<dyn Catalog>,
    read_only: Vec<Arc<dyn Catalog>>,
}

impl MultiCatalog {
    /// Compose `primary` with additional read-only catalogs
    pub fn new(primary: Arc<dyn Catalog>, read_only: Vec<Arc<dyn Catalog>>) -> Self {
        Self { primary, read_only }
    }

    fn all(&self) -> impl Iterator<Item = &Arc<dyn Catalog>> {
        std::iter::once(&self.primary).chain(self.read_only.iter())
    }
}

#[async_trait]
impl Catalog for MultiCatalog {
    async fn register(&self, instance: ServiceInstance) -> Result<ServiceInstance> {
        self.primary.register(instance).await
    }

    async fn deregister(&self, instance_id: &str) -> Result<ServiceInstance> {
        self.primary.deregister(instance_id).await
    }

    async fn renew(&self, instance_id: &str) -> Result<ServiceInstance> {
        self.primary.renew(instance_id).await
    }

    async fn set_status(&self, instance_id: &str, status: &str) -> Result<ServiceInstance> {
        self.primary.set_status(instance_id, status).await
    }

    async fn instance(&self, instance_id: &str) -> Result<ServiceInstance> {
        for catalog in self.all() {
            if let Ok(instance) = catalog.instance(instance_id).await {
                return Ok(instance);
            }
        }
        Err(Error::NoSuchServiceInstance(instance_id.to_string()))
    }

    async fn list(
        &self,
        service_name: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<ServiceInstance>> {
        let mut found = false;
        let mut instances = Vec::new();

        // A catalog without the service is not an error as long as another one has it
        for catalog in self.all() {
            match catalog.list(service_name, predicate).await {
                Ok(list) => {
                    found = true;
                    instances.extend(list);
                }
                Err(e) => trace!(service_name, error = %e, "Sub-catalog list failed"),
            }
        }

        if !found {
            return Err(Error::NoSuchServiceName(service_name.to_string()));
        }
        Ok(instances)
    }

    async fn list_services(&self, predicate: Option<&Predicate>) -> Vec<Service> {
        let mut names = BTreeSet::new();
        for catalog in self.all() {
            names.extend(
                catalog
                    .list_services(predicate)
                    .await
                    .into_iter()
                    .map(|service| service.service_name),
            );
        }
        names.into_iter().map(Service::new).collect()
    }
}

/// Creates a [`MultiCatalog`] from a primary factory and extension factories
pub struct MultiCatalogFactory {
    primary: Arc<dyn CatalogFactory>,
    extensions: Vec<Arc<dyn CatalogFactory>>,
}

impl MultiCatalogFactory {
    /// Combine factories; `primary` produces the read-write catalog
    pub fn new(primary: Arc<dyn CatalogFactory>, extensions: Vec<Arc<dyn CatalogFactory>>) -> Self {
        Self {
            primary,
            extensions,
        }
    }
}

#[async_trait]
impl CatalogFactory for MultiCatalogFactory {
    async fn create_catalog(&self, namespace: &Namespace) -> Result<Arc<dyn Catalog>> {
        let primary = self.primary.create_catalog(namespace).await?;
        let mut read_only = Vec::with_capacity(self.extensions.len());
        for factory in &self.extensions {
            read_only.push(factory.create_catalog(namespace).await?);
        }
        Ok(Arc::new(MultiCatalog::new(primary, read_only)))
    }
}

/// Layer adding read-only extension catalogs around the wrapped factory
pub struct ExtensionLayer {
    extensions: Vec<Arc<dyn CatalogFactory>>,
}

impl ExtensionLayer {
    /// Create the layer
    pub fn new(extensions: Vec<Arc<dyn CatalogFactory>>) -> Self {
        Self { extensions }
    }
}

impl FactoryLayer for ExtensionLayer {
    fn wrap(self: Box<Self>, inner: Arc<dyn CatalogFactory>) -> Arc<dyn CatalogFactory> {
        Arc::new(MultiCatalogFactory::new(inner, self.extensions))
    }
}
