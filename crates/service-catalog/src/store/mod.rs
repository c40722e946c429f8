//! Key-value stores backing the external catalog

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod sled;

use crate::error::Result;
use crate::model::{Namespace, ServiceInstance};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

const KEY_PREFIX: &str = "reg:ns:";
const INSTANCE_SEPARATOR: &str = ":inst:";

/// Escape `:` in a namespace so it cannot be mistaken for a key separator
fn escape_namespace(namespace: &str) -> String {
    namespace.replace('%', "%25").replace(':', "%3A")
}

fn unescape_namespace(escaped: &str) -> String {
    escaped.replace("%3A", ":").replace("%25", "%")
}

/// Raw key-value store shared by every namespace
#[async_trait]
pub trait Database: Send + Sync {
    /// Keys starting with `prefix`
    async fn read_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Value stored under `key`
    async fn read_entry(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Every entry whose key starts with `prefix`
    async fn read_all_entries(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    /// Store `value` under `key`, clearing any expiry set on it
    async fn insert_entry(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Remove `key`; returns the number of removed entries
    async fn delete_entry(&self, key: &str) -> Result<usize>;

    /// Evict `key` once `ttl` has elapsed
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}

/// Store key of one service instance
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbKey {
    /// Owning namespace
    pub namespace: String,
    /// Instance ID
    pub instance_id: String,
}

impl DbKey {
    /// Key of `instance_id` in `namespace`
    pub fn new(namespace: &Namespace, instance_id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.to_string(),
            instance_id: instance_id.into(),
        }
    }

    /// Common prefix of every instance key in `namespace`
    pub fn namespace_prefix(namespace: &Namespace) -> String {
        format!(
            "{KEY_PREFIX}{}{INSTANCE_SEPARATOR}",
            escape_namespace(namespace.as_str())
        )
    }

    /// Parse a raw store key; foreign keys yield `None`
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix(KEY_PREFIX)?;
        let (namespace, instance_id) = rest.split_once(INSTANCE_SEPARATOR)?;
        if instance_id.is_empty() || namespace.contains(':') {
            return None;
        }
        Some(Self {
            namespace: unescape_namespace(namespace),
            instance_id: instance_id.to_string(),
        })
    }
}

impl fmt::Display for DbKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{KEY_PREFIX}{}{INSTANCE_SEPARATOR}{}",
            escape_namespace(&self.namespace),
            self.instance_id
        )
    }
}

/// Namespace-scoped service instance access on top of a store
#[async_trait]
pub trait ExternalRegistry: Send + Sync {
    /// Instance keys present in `namespace`
    async fn read_keys(&self, namespace: &Namespace) -> Result<Vec<DbKey>>;

    /// One instance, if stored
    async fn read_service_instance(
        &self,
        namespace: &Namespace,
        instance_id: &str,
    ) -> Result<Option<ServiceInstance>>;

    /// Instances of one service
    async fn list_service_instances(
        &self,
        namespace: &Namespace,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>>;

    /// All instances, grouped by service name
    async fn list_all_service_instances(
        &self,
        namespace: &Namespace,
    ) -> Result<BTreeMap<String, Vec<ServiceInstance>>>;

    /// Store an instance under its ID
    async fn insert_service_instance(
        &self,
        namespace: &Namespace,
        instance: &ServiceInstance,
    ) -> Result<()>;

    /// Remove an instance; returns whether anything was removed
    async fn delete_service_instance(&self, namespace: &Namespace, instance_id: &str)
    -> Result<bool>;
}

/// [`ExternalRegistry`] storing instances as JSON in a [`Database`]
#[derive(Clone)]
pub struct DatabaseRegistry {
    db: Arc<dyn Database>,
}

impl DatabaseRegistry {
    /// Wrap a store
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    fn owned_by(key: &str, namespace: &Namespace) -> Option<DbKey> {
        DbKey::parse(key).filter(|parsed| parsed.namespace == namespace.as_str())
    }

    fn decode(key: &str, bytes: &[u8]) -> Option<ServiceInstance> {
        match serde_json::from_slice(bytes) {
            Ok(instance) => Some(instance),
            Err(e) => {
                error!(key, error = %e, "Unable to decode stored service instance");
                None
            }
        }
    }

    async fn scan(&self, namespace: &Namespace) -> Result<Vec<ServiceInstance>> {
        let entries = self
            .db
            .read_all_entries(&DbKey::namespace_prefix(namespace))
            .await?;
        Ok(entries
            .iter()
            .filter(|(key, _)| Self::owned_by(key, namespace).is_some())
            .filter_map(|(key, bytes)| Self::decode(key, bytes))
            .collect())
    }
}

#[async_trait]
impl ExternalRegistry for DatabaseRegistry {
    async fn read_keys(&self, namespace: &Namespace) -> Result<Vec<DbKey>> {
        let keys = self.db.read_keys(&DbKey::namespace_prefix(namespace)).await?;
        Ok(keys
            .iter()
            .filter_map(|key| Self::owned_by(key, namespace))
            .collect())
    }

    async fn read_service_instance(
        &self,
        namespace: &Namespace,
        instance_id: &str,
    ) -> Result<Option<ServiceInstance>> {
        let key = DbKey::new(namespace, instance_id).to_string();
        Ok(self
            .db
            .read_entry(&key)
            .await?
            .and_then(|bytes| Self::decode(&key, &bytes)))
    }

    async fn list_service_instances(
        &self,
        namespace: &Namespace,
        service_name: &str,
    ) -> Result<Vec<ServiceInstance>> {
        let mut instances = self.scan(namespace).await?;
        instances.retain(|instance| instance.service_name == service_name);
        Ok(instances)
    }

    async fn list_all_service_instances(
        &self,
        namespace: &Namespace,
    ) -> Result<BTreeMap<String, Vec<ServiceInstance>>> {
        let mut services: BTreeMap<String, Vec<ServiceInstance>> = BTreeMap::new();
        for instance in self.scan(namespace).await? {
            services
                .entry(instance.service_name.clone())
                .or_default()
                .push(instance);
        }
        Ok(services)
    }

    async fn insert_service_instance(
        &self,
        namespace: &Namespace,
        instance: &ServiceInstance,
    ) -> Result<()> {
        let key = DbKey::new(namespace, instance.id.clone()).to_string();
        self.db
            .insert_entry(&key, serde_json::to_vec(instance)?)
            .await?;

        // OUT_OF_SERVICE instances never expire
        if !instance.is_out_of_service() {
            if let Err(e) = self.db.expire(&key, instance.ttl).await {
                warn!(key = %key, error = %e, "Failed to set store expiry");
            }
        }
        Ok(())
    }

    async fn delete_service_instance(
        &self,
        namespace: &Namespace,
        instance_id: &str,
    ) -> Result<bool> {
        let key = DbKey::new(namespace, instance_id).to_string();
        Ok(self.db.delete_entry(&key).await? > 0)
    }
}
