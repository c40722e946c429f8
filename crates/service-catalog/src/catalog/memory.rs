//! In-memory catalog

use super::{
    Catalog, CatalogFactory, Predicate, StoreLimits, accepts, prepare_registration,
};
use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::expiry::{ExpiryCheck, ExpiryScheduler};
use crate::metrics::{MetricsSink, StoreMetrics};
use crate::model::{Namespace, Service, ServiceInstance};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct State {
    /// Authoritative instance store
    instances: HashMap<String, ServiceInstance>,
    /// Service name index; every instance is in exactly one bucket
    by_service: BTreeMap<String, BTreeSet<String>>,
}

impl State {
    fn insert(&mut self, instance: ServiceInstance) -> Option<ServiceInstance> {
        let previous = self.instances.remove(&instance.id);
        if let Some(prev) = &previous {
            if prev.service_name != instance.service_name {
                self.unindex(&prev.service_name, &prev.id);
            }
        }
        self.by_service
            .entry(instance.service_name.clone())
            .or_default()
            .insert(instance.id.clone());
        self.instances.insert(instance.id.clone(), instance);
        previous
    }

    fn remove(&mut self, instance_id: &str) -> Option<ServiceInstance> {
        let instance = self.instances.remove(instance_id)?;
        self.unindex(&instance.service_name, instance_id);
        Some(instance)
    }

    fn unindex(&mut self, service_name: &str, instance_id: &str) {
        if let Some(bucket) = self.by_service.get_mut(service_name) {
            bucket.remove(instance_id);
            if bucket.is_empty() {
                self.by_service.remove(service_name);
            }
        }
    }
}

struct Shared {
    namespace: Namespace,
    limits: StoreLimits,
    state: RwLock<State>,
    metrics: StoreMetrics,
    expiry: ExpiryScheduler,
}

impl Shared {
    /// Refresh `last_renewal` and reschedule expiry; caller holds the write lock
    fn touch(&self, instance: &mut ServiceInstance) {
        instance.last_renewal = Some(Utc::now());
        self.expiry.schedule(&instance.id, instance.ttl);
    }
}

#[async_trait]
impl ExpiryCheck for Shared {
    async fn check_expired(&self, instance_id: &str) {
        let now = Utc::now();
        {
            let state = self.state.read();
            match state.instances.get(instance_id) {
                Some(instance) if instance.is_expired_at(now) => {}
                _ => return,
            }
        }

        // Re-check under the write lock; a renewal may have raced the timer
        let mut state = self.state.write();
        let still_expired = state
            .instances
            .get(instance_id)
            .is_some_and(|instance| instance.is_expired_at(Utc::now()));
        if !still_expired {
            return;
        }

        if let Some(instance) = state.remove(instance_id) {
            debug!(namespace = %self.namespace, instance_id, "Instance expired");
            self.metrics.expired(&instance);
        }
    }
}

/// Process-local catalog of one namespace
pub struct MemoryCatalog {
    shared: Arc<Shared>,
}

impl MemoryCatalog {
    /// Create an empty catalog
    pub fn new(namespace: Namespace, config: &CatalogConfig, sink: Arc<dyn MetricsSink>) -> Self {
        let limits = StoreLimits::from(config);
        let shared = Arc::new_cyclic(|weak| Shared {
            namespace,
            limits,
            state: RwLock::new(State::default()),
            metrics: StoreMetrics::new(sink),
            expiry: ExpiryScheduler::start(weak.clone()),
        });
        Self { shared }
    }

    /// Namespace served by this catalog
    pub fn namespace(&self) -> &Namespace {
        &self.shared.namespace
    }

    /// Number of stored instances
    pub fn len(&self) -> usize {
        self.shared.state.read().instances.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn register(&self, instance: ServiceInstance) -> Result<ServiceInstance> {
        let shared = &self.shared;
        let registration = prepare_registration(instance, &shared.limits.ttl, Utc::now())?;
        let mut instance = registration.instance;

        let mut state = shared.state.write();

        let previous_registration = state
            .instances
            .get(&instance.id)
            .map(|previous| previous.registration_time);
        let exists = previous_registration.is_some();
        if let Some(registration_time) = previous_registration {
            if !registration.is_replication {
                instance.registration_time = registration_time;
            }
            debug!(
                namespace = %shared.namespace,
                instance_id = %instance.id,
                "Overwriting existing instance due to re-registration"
            );
        }

        // Neither replicated copies nor overwrites are subject to the quota
        if !registration.is_replication && !exists && shared.limits.is_full(state.instances.len()) {
            warn!(
                namespace = %shared.namespace,
                service_name = %instance.service_name,
                count = state.instances.len(),
                "Registration rejected, namespace quota exceeded"
            );
            return Err(Error::NamespaceQuotaExceeded {
                namespace: shared.namespace.to_string(),
                count: state.instances.len(),
                capacity: shared.limits.namespace_capacity,
            });
        }

        shared.touch(&mut instance);
        let previous = state.insert(instance.clone());
        shared.metrics.registered(previous.as_ref(), &instance);

        Ok(instance)
    }

    async fn deregister(&self, instance_id: &str) -> Result<ServiceInstance> {
        let shared = &self.shared;
        let instance = shared
            .state
            .write()
            .remove(instance_id)
            .ok_or_else(|| Error::NoSuchServiceInstance(instance_id.to_string()))?;

        shared.expiry.cancel(instance_id);
        shared.metrics.removed(&instance);
        Ok(instance)
    }

    async fn renew(&self, instance_id: &str) -> Result<ServiceInstance> {
        let shared = &self.shared;
        let mut state = shared.state.write();
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::NoSuchServiceInstance(instance_id.to_string()))?;

        shared.touch(instance);
        Ok(instance.clone())
    }

    async fn set_status(&self, instance_id: &str, status: &str) -> Result<ServiceInstance> {
        let shared = &self.shared;
        let mut state = shared.state.write();
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| Error::NoSuchServiceInstance(instance_id.to_string()))?;

        instance.status = status.to_string();
        shared.touch(instance);
        Ok(instance.clone())
    }

    async fn instance(&self, instance_id: &str) -> Result<ServiceInstance> {
        self.shared
            .state
            .read()
            .instances
            .get(instance_id)
            .cloned()
            .ok_or_else(|| Error::NoSuchServiceInstance(instance_id.to_string()))
    }

    async fn list(
        &self,
        service_name: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<ServiceInstance>> {
        let state = self.shared.state.read();
        let bucket = state
            .by_service
            .get(service_name)
            .ok_or_else(|| Error::NoSuchServiceName(service_name.to_string()))?;

        Ok(bucket
            .iter()
            .filter_map(|id| state.instances.get(id))
            .filter(|instance| accepts(predicate, instance))
            .cloned()
            .collect())
    }

    async fn list_services(&self, predicate: Option<&Predicate>) -> Vec<Service> {
        let state = self.shared.state.read();
        state
            .by_service
            .iter()
            .filter(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| state.instances.get(id))
                    .any(|instance| accepts(predicate, instance))
            })
            .map(|(name, _)| Service::new(name.clone()))
            .collect()
    }
}

/// Creates [`MemoryCatalog`]s
pub struct MemoryCatalogFactory {
    config: CatalogConfig,
    sink: Arc<dyn MetricsSink>,
}

impl MemoryCatalogFactory {
    /// Create a factory
    pub fn new(config: CatalogConfig, sink: Arc<dyn MetricsSink>) -> Self {
        Self { config, sink }
    }
}

#[async_trait]
impl CatalogFactory for MemoryCatalogFactory {
    async fn create_catalog(&self, namespace: &Namespace) -> Result<Arc<dyn Catalog>> {
        info!(namespace = %namespace, "Creating in-memory catalog");
        Ok(Arc::new(MemoryCatalog::new(
            namespace.clone(),
            &self.config,
            self.sink.clone(),
        )))
    }
}
