//! Read-only discovery sources projected into catalogs

pub mod filesystem;

use crate::error::Result;
use crate::model::{Endpoint, Extensions, Namespace, ServiceInstance};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Instance as reported by a discovery source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveredInstance {
    /// Instance ID
    pub id: String,
    /// Service name
    pub service_name: String,
    /// Network endpoint
    pub endpoint: Endpoint,
    /// Status
    #[serde(default)]
    pub status: String,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form JSON metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// TTL in seconds; zero when the source does not expire instances
    #[serde(default)]
    pub ttl_secs: u64,
    /// Last time the source saw the instance alive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl From<DiscoveredInstance> for ServiceInstance {
    fn from(instance: DiscoveredInstance) -> Self {
        let metadata = instance
            .metadata
            .as_ref()
            .and_then(|value| serde_json::to_vec(value).ok())
            .unwrap_or_default();

        ServiceInstance {
            id: instance.id,
            service_name: instance.service_name,
            endpoint: Some(instance.endpoint),
            status: instance.status,
            metadata,
            registration_time: None,
            last_renewal: instance.last_heartbeat,
            ttl: Duration::from_secs(instance.ttl_secs),
            tags: instance.tags,
            extension: Extensions::new(),
        }
    }
}

/// Pull-based view of an external discovery system for one namespace
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Names of the known services
    async fn list_services(&self) -> Result<Vec<String>>;

    /// Every known instance
    async fn list_instances(&self) -> Result<Vec<DiscoveredInstance>>;

    /// Instances of one service
    async fn list_service_instances(&self, service_name: &str) -> Result<Vec<DiscoveredInstance>>;
}

/// Creates the discovery source of a namespace
#[async_trait]
pub trait DiscoveryFactory: Send + Sync {
    /// Build a discovery for `namespace`
    async fn create_discovery(&self, namespace: &Namespace) -> Result<Arc<dyn ServiceDiscovery>>;
}
