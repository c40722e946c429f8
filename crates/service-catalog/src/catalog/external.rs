//! Catalog persisted in an external store
//!
//! Every operation goes through the namespace's [`ExternalRegistry`] while
//! holding the catalog lock, so the store round trip is part of the critical
//! section and operations on one namespace are serialized.

use super::{Catalog, CatalogFactory, Predicate, StoreLimits, accepts, prepare_registration};
use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::expiry::{ExpiryCheck, ExpiryScheduler};
use crate::metrics::{MetricsSink, StoreMetrics};
use crate::model::{Namespace, Service, ServiceInstance};
use crate::store::{Database, DatabaseRegistry, ExternalRegistry};
use async_trait::async_trait;
use chrono::Utc;
use smol::lock::RwLock;
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

struct Shared {
    namespace: Namespace,
    limits: StoreLimits,
    registry: Arc<dyn ExternalRegistry>,
    lock: RwLock<()>,
    metrics: StoreMetrics,
    expiry: ExpiryScheduler,
}

impl Shared {
    async fn read(&self, instance_id: &str) -> Result<ServiceInstance> {
        self.registry
            .read_service_instance(&self.namespace, instance_id)
            .await?
            .ok_or_else(|| Error::NoSuchServiceInstance(instance_id.to_string()))
    }

    /// Stamp a renewal, write the instance back and reschedule its expiry
    async fn store_renewed(&self, mut instance: ServiceInstance) -> Result<ServiceInstance> {
        instance.last_renewal = Some(Utc::now());
        self.registry
            .insert_service_instance(&self.namespace, &instance)
            .await?;
        self.expiry.schedule(&instance.id, instance.ttl);
        Ok(instance)
    }

    async fn expired_instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        match self.read(instance_id).await {
            Ok(instance) if instance.is_expired_at(Utc::now()) => Some(instance),
            Ok(_) => None,
            Err(Error::NoSuchServiceInstance(_)) => None,
            Err(e) => {
                debug!(namespace = %self.namespace, instance_id, error = %e, "Expiry check skipped");
                None
            }
        }
    }

    /// Expire what is already stale and schedule the rest for its remaining TTL
    async fn scan_existing(&self) {
        let keys = match self.registry.read_keys(&self.namespace).await {
            Ok(keys) => keys,
            Err(e) => {
                error!(namespace = %self.namespace, error = %e, "Failed to scan stored instances");
                return;
            }
        };
        debug!(namespace = %self.namespace, count = keys.len(), "Checking stored instances for expiry");

        for key in keys {
            self.check_expired(&key.instance_id).await;

            let _guard = self.lock.read().await;
            if let Ok(instance) = self.read(&key.instance_id).await {
                if !instance.is_out_of_service() {
                    let remaining = instance
                        .ttl
                        .saturating_sub(instance.time_since_renewal(Utc::now()));
                    self.expiry.schedule(&instance.id, remaining);
                }
            }
        }
    }
}

#[async_trait]
impl ExpiryCheck for Shared {
    async fn check_expired(&self, instance_id: &str) {
        {
            let _guard = self.lock.read().await;
            if self.expired_instance(instance_id).await.is_none() {
                return;
            }
        }

        // Re-check under the write lock; a renewal may have raced the timer
        let _guard = self.lock.write().await;
        let Some(instance) = self.expired_instance(instance_id).await else {
            return;
        };

        match self
            .registry
            .delete_service_instance(&self.namespace, instance_id)
            .await
        {
            Ok(true) => {
                debug!(namespace = %self.namespace, instance_id, "Instance expired");
                self.metrics.expired(&instance);
            }
            Ok(false) => {}
            Err(e) => {
                warn!(namespace = %self.namespace, instance_id, error = %e, "Failed to delete expired instance");
            }
        }
    }
}

/// Catalog of one namespace kept in an [`ExternalRegistry`]
pub struct ExternalCatalog {
    shared: Arc<Shared>,
}

impl ExternalCatalog {
    /// Create the catalog and start checking previously stored instances
    pub fn new(
        namespace: Namespace,
        config: &CatalogConfig,
        registry: Arc<dyn ExternalRegistry>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        let limits = StoreLimits::from(config);
        let shared = Arc::new_cyclic(|weak| Shared {
            namespace,
            limits,
            registry,
            lock: RwLock::new(()),
            metrics: StoreMetrics::new(sink),
            expiry: ExpiryScheduler::start(weak.clone()),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        smol::spawn(async move {
            if let Some(shared) = weak.upgrade() {
                shared.scan_existing().await;
            }
        })
        .detach();

        Self { shared }
    }
}

#[async_trait]
impl Catalog for ExternalCatalog {
    async fn register(&self, instance: ServiceInstance) -> Result<ServiceInstance> {
        let shared = &self.shared;
        let registration = prepare_registration(instance, &shared.limits.ttl, Utc::now())?;
        let mut instance = registration.instance;

        let _guard = shared.lock.write().await;

        let previous = shared
            .registry
            .read_service_instance(&shared.namespace, &instance.id)
            .await?;
        if let Some(previous) = &previous {
            if !registration.is_replication {
                instance.registration_time = previous.registration_time;
            }
            debug!(
                namespace = %shared.namespace,
                instance_id = %instance.id,
                "Overwriting existing instance due to re-registration"
            );
        }

        if !registration.is_replication && previous.is_none() && shared.limits.namespace_capacity >= 0 {
            let count = shared
                .registry
                .list_all_service_instances(&shared.namespace)
                .await?
                .values()
                .map(Vec::len)
                .sum::<usize>();
            if shared.limits.is_full(count) {
                warn!(
                    namespace = %shared.namespace,
                    service_name = %instance.service_name,
                    count,
                    "Registration rejected, namespace quota exceeded"
                );
                return Err(Error::NamespaceQuotaExceeded {
                    namespace: shared.namespace.to_string(),
                    count,
                    capacity: shared.limits.namespace_capacity,
                });
            }
        }

        let stored = shared.store_renewed(instance).await?;
        shared.metrics.registered(previous.as_ref(), &stored);
        Ok(stored)
    }

    async fn deregister(&self, instance_id: &str) -> Result<ServiceInstance> {
        let shared = &self.shared;
        let _guard = shared.lock.write().await;

        let instance = shared.read(instance_id).await?;
        if !shared
            .registry
            .delete_service_instance(&shared.namespace, instance_id)
            .await?
        {
            return Err(Error::NoSuchServiceInstance(instance_id.to_string()));
        }

        shared.expiry.cancel(instance_id);
        shared.metrics.removed(&instance);
        Ok(instance)
    }

    async fn renew(&self, instance_id: &str) -> Result<ServiceInstance> {
        let shared = &self.shared;
        let _guard = shared.lock.write().await;

        let instance = shared.read(instance_id).await?;
        shared.store_renewed(instance).await
    }

    async fn set_status(&self, instance_id: &str, status: &str) -> Result<ServiceInstance> {
        let shared = &self.shared;
        let _guard = shared.lock.write().await;

        let mut instance = shared.read(instance_id).await?;
        instance.status = status.to_string();
        shared.store_renewed(instance).await
    }

    async fn instance(&self, instance_id: &str) -> Result<ServiceInstance> {
        let _guard = self.shared.lock.read().await;
        self.shared.read(instance_id).await
    }

    async fn list(
        &self,
        service_name: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<ServiceInstance>> {
        let shared = &self.shared;
        let _guard = shared.lock.read().await;

        let mut instances = shared
            .registry
            .list_service_instances(&shared.namespace, service_name)
            .await?;
        if instances.is_empty() {
            return Err(Error::NoSuchServiceName(service_name.to_string()));
        }
        instances.retain(|instance| accepts(predicate, instance));
        Ok(instances)
    }

    async fn list_services(&self, predicate: Option<&Predicate>) -> Vec<Service> {
        let shared = &self.shared;
        let _guard = shared.lock.read().await;

        match shared
            .registry
            .list_all_service_instances(&shared.namespace)
            .await
        {
            Ok(services) => services
                .into_iter()
                .filter(|(_, instances)| instances.iter().any(|i| accepts(predicate, i)))
                .map(|(name, _)| Service::new(name))
                .collect(),
            Err(e) => {
                error!(namespace = %shared.namespace, error = %e, "Failed to list services");
                Vec::new()
            }
        }
    }
}

/// Creates [`ExternalCatalog`]s over one shared store
pub struct ExternalCatalogFactory {
    config: CatalogConfig,
    registry: Arc<dyn ExternalRegistry>,
    sink: Arc<dyn MetricsSink>,
}

impl ExternalCatalogFactory {
    /// Create a factory over a raw store
    pub fn new(config: CatalogConfig, db: Arc<dyn Database>, sink: Arc<dyn MetricsSink>) -> Self {
        Self::with_registry(config, Arc::new(DatabaseRegistry::new(db)), sink)
    }

    /// Create a factory over a custom registry
    pub fn with_registry(
        config: CatalogConfig,
        registry: Arc<dyn ExternalRegistry>,
        sink: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            config,
            registry,
            sink,
        }
    }
}

#[async_trait]
impl CatalogFactory for ExternalCatalogFactory {
    async fn create_catalog(&self, namespace: &Namespace) -> Result<Arc<dyn Catalog>> {
        info!(namespace = %namespace, "Creating external catalog");
        Ok(Arc::new(ExternalCatalog::new(
            namespace.clone(),
            &self.config,
            self.registry.clone(),
            self.sink.clone(),
        )))
    }
}
