//! Catalog abstraction and factory composition
//!
//! A [`Catalog`] holds the service instances of one namespace. Catalogs are
//! produced by a [`CatalogFactory`]; decorators (replication, read-only
//! extensions) are expressed as [`FactoryLayer`]s and stacked onto a base
//! factory with [`compose`].

pub mod adapter;
pub mod external;
pub mod map;
pub mod memory;
pub mod multi;

use crate::config::CatalogConfig;
use crate::error::Result;
use crate::model::{Namespace, Service, ServiceInstance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Instance filter applied to query results
pub type Predicate = dyn Fn(&ServiceInstance) -> bool + Send + Sync;

/// Per-namespace store of service instances.
///
/// Every successful call hands out owned copies; mutating a returned instance
/// never affects the catalog.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Register or overwrite an instance
    async fn register(&self, instance: ServiceInstance) -> Result<ServiceInstance>;

    /// Remove an instance
    async fn deregister(&self, instance_id: &str) -> Result<ServiceInstance>;

    /// Refresh an instance's TTL
    async fn renew(&self, instance_id: &str) -> Result<ServiceInstance>;

    /// Change an instance's status; also counts as a renewal
    async fn set_status(&self, instance_id: &str, status: &str) -> Result<ServiceInstance>;

    /// Look up one instance
    async fn instance(&self, instance_id: &str) -> Result<ServiceInstance>;

    /// Instances of `service_name` accepted by `predicate`
    async fn list(
        &self,
        service_name: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<ServiceInstance>>;

    /// Services with at least one instance accepted by `predicate`
    async fn list_services(&self, predicate: Option<&Predicate>) -> Vec<Service>;
}

/// Creates the catalog of a namespace
#[async_trait]
pub trait CatalogFactory: Send + Sync {
    /// Build a fresh catalog for `namespace`
    async fn create_catalog(&self, namespace: &Namespace) -> Result<Arc<dyn Catalog>>;
}

/// A decorator over a catalog factory
pub trait FactoryLayer: Send + Sync {
    /// Wrap `inner`
    fn wrap(self: Box<Self>, inner: Arc<dyn CatalogFactory>) -> Arc<dyn CatalogFactory>;
}

/// Stack `layers` over `base`, innermost first
pub fn compose(
    base: Arc<dyn CatalogFactory>,
    layers: Vec<Box<dyn FactoryLayer>>,
) -> Arc<dyn CatalogFactory> {
    layers
        .into_iter()
        .fold(base, |factory, layer| layer.wrap(factory))
}

/// Whether `instance` passes an optional predicate
pub(crate) fn accepts(predicate: Option<&Predicate>, instance: &ServiceInstance) -> bool {
    predicate.is_none_or(|p| p(instance))
}

/// TTL bounds applied on registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Used when no TTL is requested
    pub default: Duration,
    /// Lower bound
    pub minimum: Duration,
    /// Upper bound
    pub maximum: Duration,
}

impl TtlPolicy {
    /// Effective TTL for a requested one
    pub fn clamp(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.default
        } else if requested < self.minimum {
            self.minimum
        } else if requested > self.maximum {
            self.maximum
        } else {
            requested
        }
    }
}

impl From<&CatalogConfig> for TtlPolicy {
    fn from(config: &CatalogConfig) -> Self {
        Self {
            default: config.default_ttl,
            minimum: config.minimum_ttl,
            maximum: config.maximum_ttl,
        }
    }
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self::from(&CatalogConfig::default())
    }
}

/// Registration settings shared by the read-write catalogs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StoreLimits {
    pub(crate) ttl: TtlPolicy,
    pub(crate) namespace_capacity: i64,
}

impl StoreLimits {
    /// Whether a namespace holding `count` instances is full
    pub(crate) fn is_full(&self, count: usize) -> bool {
        self.namespace_capacity >= 0 && count as i64 >= self.namespace_capacity
    }
}

impl From<&CatalogConfig> for StoreLimits {
    fn from(config: &CatalogConfig) -> Self {
        Self {
            ttl: TtlPolicy::from(config),
            namespace_capacity: config.namespace_capacity,
        }
    }
}

/// A validated registration ready to be stored
pub(crate) struct Registration {
    pub(crate) instance: ServiceInstance,
    /// Carried a registration time already (replication or read-repair)
    pub(crate) is_replication: bool,
}

/// Validate, assign the ID, clamp the TTL and stamp the times of a new registration
pub(crate) fn prepare_registration(
    mut instance: ServiceInstance,
    ttl: &TtlPolicy,
    now: DateTime<Utc>,
) -> Result<Registration> {
    instance.validate()?;

    instance.id = instance.effective_id();
    instance.ttl = ttl.clamp(instance.ttl);

    let is_replication = instance.registration_time.is_some();
    if !is_replication {
        instance.registration_time = Some(now);
    }
    instance.last_renewal = Some(now);

    Ok(Registration {
        instance,
        is_replication,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Endpoint;

    #[test]
    fn test_ttl_clamping() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.clamp(Duration::ZERO), Duration::from_secs(30));
        assert_eq!(policy.clamp(Duration::from_secs(1)), Duration::from_secs(5));
        assert_eq!(policy.clamp(Duration::from_secs(3600)), Duration::from_secs(600));
        assert_eq!(policy.clamp(Duration::from_secs(45)), Duration::from_secs(45));
    }

    #[test]
    fn test_capacity_limits() {
        let limits = StoreLimits {
            ttl: TtlPolicy::default(),
            namespace_capacity: 2,
        };
        assert!(!limits.is_full(1));
        assert!(limits.is_full(2));

        let unlimited = StoreLimits {
            namespace_capacity: -1,
            ..limits
        };
        assert!(!unlimited.is_full(usize::MAX));

        let closed = StoreLimits {
            namespace_capacity: 0,
            ..limits
        };
        assert!(closed.is_full(0));
    }

    #[test]
    fn test_prepare_registration() {
        let now = Utc::now();
        let instance = ServiceInstance::new("Calc", Endpoint::new("tcp", "192.168.0.1:9080"));
        let reg = prepare_registration(instance, &TtlPolicy::default(), now).unwrap();
        assert!(!reg.is_replication);
        assert_eq!(reg.instance.id.len(), 16);
        assert_eq!(reg.instance.ttl, Duration::from_secs(30));
        assert_eq!(reg.instance.registration_time, Some(now));
        assert_eq!(reg.instance.last_renewal, Some(now));

        let earlier = now - chrono::Duration::minutes(5);
        let mut replicated = reg.instance.clone();
        replicated.registration_time = Some(earlier);
        let reg = prepare_registration(replicated, &TtlPolicy::default(), now).unwrap();
        assert!(reg.is_replication);
        assert_eq!(reg.instance.registration_time, Some(earlier));

        let empty = ServiceInstance::new("", Endpoint::default());
        assert!(prepare_registration(empty, &TtlPolicy::default(), now).is_err());
    }

    #[test]
    fn test_accepts() {
        let instance = ServiceInstance::new("Calc", Endpoint::default()).with_status("UP");
        let up: &Predicate = &|si: &ServiceInstance| si.status == "UP";
        let down: &Predicate = &|si: &ServiceInstance| si.status == "DOWN";
        assert!(accepts(None, &instance));
        assert!(accepts(Some(up), &instance));
        assert!(!accepts(Some(down), &instance));
    }
}
