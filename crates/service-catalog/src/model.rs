//! Data models for the service catalog

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Instance is starting up
pub const STARTING: &str = "STARTING";
/// Instance is serving
pub const UP: &str = "UP";
/// Instance is administratively down; never expired by TTL
pub const OUT_OF_SERVICE: &str = "OUT_OF_SERVICE";
/// Query-only pseudo status matching every instance
pub const ALL: &str = "ALL";

/// Maximum service name length in bytes
pub const SERVICE_NAME_MAX_LENGTH: usize = 64;
/// Maximum endpoint value length in bytes
pub const VALUE_MAX_LENGTH: usize = 64;
/// Maximum status length in bytes
pub const STATUS_MAX_LENGTH: usize = 32;
/// Maximum metadata length in bytes
pub const METADATA_MAX_LENGTH: usize = 1024;

const INSTANCE_ID_LENGTH: usize = 16;

/// Tenant-scoping key; every namespace owns an isolated catalog
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Namespace(String);

impl Namespace {
    /// Create a namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Namespace as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Namespace {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Namespace {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Network endpoint of a service instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Endpoint type (e.g., "tcp", "http", "https")
    #[serde(rename = "type")]
    pub endpoint_type: String,

    /// Endpoint address (e.g., "192.168.0.1:9080")
    pub value: String,
}

impl Endpoint {
    /// Create a new endpoint
    pub fn new(endpoint_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            endpoint_type: endpoint_type.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.endpoint_type, self.value)
    }
}

/// A service name with at least one live instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Service {
    /// Service name
    pub service_name: String,
}

impl Service {
    /// Create a service view
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }
}

/// Protocol-specific side-channel data attached to an instance.
///
/// Values are stored as opaque JSON; each protocol layer reads and writes
/// its own typed structures through [`Extensions::insert`] and
/// [`Extensions::get`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Extensions(BTreeMap<String, serde_json::Value>);

impl Extensions {
    /// Create an empty extension bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether no extension is set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of extension entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Store a typed value under `key`, replacing any previous value
    pub fn insert<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        self.0.insert(key.into(), serde_json::to_value(value)?);
        Ok(())
    }

    /// Read back a typed value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.0
            .get(key)
            .map(|v| serde_json::from_value(v.clone()).map_err(Error::from))
            .transpose()
    }

    /// Remove a value
    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.0.remove(key)
    }

    /// Iterate over the stored keys
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// A registered service instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique ID within the namespace; derived from name and endpoint when empty
    #[serde(default)]
    pub id: String,

    /// Name of the service provided by this instance
    pub service_name: String,

    /// Network endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Endpoint>,

    /// Free-form status (conventionally `UP`, `STARTING`, `OUT_OF_SERVICE`)
    #[serde(default)]
    pub status: String,

    /// Opaque serialized metadata
    #[serde(default, with = "crate::serde_helpers::base64_bytes")]
    pub metadata: Vec<u8>,

    /// First registration time; set only once
    #[serde(default)]
    pub registration_time: Option<DateTime<Utc>>,

    /// Last register, renew or status change
    #[serde(default)]
    pub last_renewal: Option<DateTime<Utc>>,

    /// Time-to-live without renewal
    #[serde(default, rename = "ttl_ms", with = "crate::serde_helpers::millis")]
    pub ttl: Duration,

    /// Ordered tags
    #[serde(default)]
    pub tags: Vec<String>,

    /// Protocol-specific extensions
    #[serde(default, skip_serializing_if = "Extensions::is_empty")]
    pub extension: Extensions,
}

impl ServiceInstance {
    /// Create an instance registration for `service_name` at `endpoint`
    pub fn new(service_name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            id: String::new(),
            service_name: service_name.into(),
            endpoint: Some(endpoint),
            status: String::new(),
            metadata: Vec::new(),
            registration_time: None,
            last_renewal: None,
            ttl: Duration::ZERO,
            tags: Vec::new(),
            extension: Extensions::new(),
        }
    }

    /// Set an explicit instance ID
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the requested TTL
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the status
    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    /// Set the tags
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the metadata
    pub fn with_metadata(mut self, metadata: impl Into<Vec<u8>>) -> Self {
        self.metadata = metadata.into();
        self
    }

    /// Check the field-length constraints applied on registration
    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(Error::BadRequest("Empty service name".to_string()));
        }
        if self.service_name.len() > SERVICE_NAME_MAX_LENGTH {
            return Err(Error::BadRequest("Service name length too long".to_string()));
        }
        if let Some(endpoint) = &self.endpoint {
            if endpoint.value.len() > VALUE_MAX_LENGTH {
                return Err(Error::BadRequest("Endpoint value length too long".to_string()));
            }
        }
        if self.status.len() > STATUS_MAX_LENGTH {
            return Err(Error::BadRequest("Status length too long".to_string()));
        }
        if self.metadata.len() > METADATA_MAX_LENGTH {
            return Err(Error::BadRequest("Metadata length too long".to_string()));
        }
        Ok(())
    }

    /// The explicit ID, or the one derived from name and endpoint
    pub fn effective_id(&self) -> String {
        if self.id.is_empty() {
            compute_instance_id(&self.service_name, self.endpoint.as_ref())
        } else {
            self.id.clone()
        }
    }

    /// Whether TTL expiry is suspended for this instance
    pub fn is_out_of_service(&self) -> bool {
        self.status == OUT_OF_SERVICE
    }

    /// Time elapsed since the last renewal, measured at `now`
    pub fn time_since_renewal(&self, now: DateTime<Utc>) -> Duration {
        match self.last_renewal.or(self.registration_time) {
            Some(at) => (now - at).to_std().unwrap_or(Duration::ZERO),
            None => Duration::MAX,
        }
    }

    /// Whether the instance outlived its TTL at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_out_of_service() && self.time_since_renewal(now) > self.ttl
    }
}

impl fmt::Display for ServiceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id: {}, service_name: {}, endpoint: ", self.id, self.service_name)?;
        match &self.endpoint {
            Some(endpoint) => write!(f, "{endpoint}")?,
            None => f.write_str("<none>")?,
        }
        write!(
            f,
            ", status: {}, ttl: {:?}, tags: {:?}",
            self.status, self.ttl, self.tags
        )
    }
}

/// Derive the deterministic instance ID for a name and endpoint.
///
/// Identical registrations collapse onto the same ID so that client retries
/// and replicated copies overwrite instead of duplicating.
pub fn compute_instance_id(service_name: &str, endpoint: Option<&Endpoint>) -> String {
    let (endpoint_type, value) = endpoint
        .map(|e| (e.endpoint_type.as_str(), e.value.as_str()))
        .unwrap_or(("", ""));

    let mut hasher = Sha256::new();
    hasher.update([service_name, endpoint_type, value].join("/").as_bytes());
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(INSTANCE_ID_LENGTH);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calc() -> ServiceInstance {
        ServiceInstance::new("Calc", Endpoint::new("tcp", "192.168.0.1:9080"))
    }

    #[test]
    fn test_instance_id_is_deterministic() {
        let a = calc().effective_id();
        let b = calc().effective_id();
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));

        let other = ServiceInstance::new("Calc", Endpoint::new("tcp", "192.168.0.2:9080"));
        assert_ne!(a, other.effective_id());

        let renamed = ServiceInstance::new("Calc2", Endpoint::new("tcp", "192.168.0.1:9080"));
        assert_ne!(a, renamed.effective_id());
    }

    #[test]
    fn test_explicit_id_wins() {
        assert_eq!(calc().with_id("my-id").effective_id(), "my-id");
    }

    #[test]
    fn test_validation_limits() {
        assert!(calc().validate().is_ok());

        let empty = ServiceInstance::new("", Endpoint::default());
        assert!(matches!(empty.validate(), Err(Error::BadRequest(_))));

        let max_name = ServiceInstance::new("a".repeat(64), Endpoint::default());
        assert!(max_name.validate().is_ok());
        let long_name = ServiceInstance::new("a".repeat(65), Endpoint::default());
        assert!(long_name.validate().is_err());

        let long_value = ServiceInstance::new("Calc", Endpoint::new("tcp", "v".repeat(65)));
        assert!(long_value.validate().is_err());

        assert!(calc().with_status("s".repeat(33)).validate().is_err());
        assert!(calc().with_metadata(vec![0u8; 1024]).validate().is_ok());
        assert!(calc().with_metadata(vec![0u8; 1025]).validate().is_err());
    }

    #[test]
    fn test_extensions_roundtrip_typed_value() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct EurekaInfo {
            vip_address: String,
            secure_port: u16,
        }

        let mut ext = Extensions::new();
        let info = EurekaInfo {
            vip_address: "calc".into(),
            secure_port: 443,
        };
        ext.insert("eureka", &info).unwrap();
        assert_eq!(ext.get::<EurekaInfo>("eureka").unwrap(), Some(info));
        assert_eq!(ext.get::<EurekaInfo>("missing").unwrap(), None);
        assert!(ext.get::<u32>("eureka").is_err());
    }

    #[test]
    fn test_serialized_instance_keeps_fields() {
        let mut instance = calc()
            .with_id("abc")
            .with_ttl(Duration::from_millis(1500))
            .with_status(UP)
            .with_tags(["a", "b"])
            .with_metadata(b"{\"k\":1}".to_vec());
        instance.registration_time = Some(Utc::now());
        instance.last_renewal = instance.registration_time;
        instance.extension.insert("proto", &"x").unwrap();

        let json = serde_json::to_string(&instance).unwrap();
        let decoded: ServiceInstance = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, instance);
    }

    #[test]
    fn test_expiry_predicate() {
        let now = Utc::now();
        let mut instance = calc().with_ttl(Duration::from_secs(1));
        instance.last_renewal = Some(now - chrono::Duration::seconds(2));
        assert!(instance.is_expired_at(now));

        instance.status = OUT_OF_SERVICE.to_string();
        assert!(!instance.is_expired_at(now));

        instance.status = UP.to_string();
        instance.last_renewal = Some(now);
        assert!(!instance.is_expired_at(now));
    }
}
