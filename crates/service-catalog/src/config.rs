//! Configuration structures for the service catalog

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default instance TTL when a registration asks for none
pub const DEFAULT_TTL: Duration = Duration::from_secs(30);
/// Lower TTL bound
pub const MINIMUM_TTL: Duration = Duration::from_secs(5);
/// Upper TTL bound
pub const MAXIMUM_TTL: Duration = Duration::from_secs(600);
/// Default per-namespace instance capacity
pub const DEFAULT_NAMESPACE_CAPACITY: i64 = 50;
/// Unlimited namespace capacity
pub const UNLIMITED_CAPACITY: i64 = -1;
/// Default time to wait for a peer sync stream
pub const DEFAULT_SYNC_WAIT_TIME: Duration = Duration::from_secs(30);
/// Default filesystem discovery polling interval
pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
/// Minimum filesystem discovery polling interval
pub const MINIMUM_POLLING_INTERVAL: Duration = Duration::from_secs(10);

/// Catalog engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// TTL applied when a registration asks for none
    #[serde(rename = "default_ttl_ms", with = "crate::serde_helpers::millis")]
    pub default_ttl: Duration,

    /// Shortest accepted TTL
    #[serde(rename = "minimum_ttl_ms", with = "crate::serde_helpers::millis")]
    pub minimum_ttl: Duration,

    /// Longest accepted TTL
    #[serde(rename = "maximum_ttl_ms", with = "crate::serde_helpers::millis")]
    pub maximum_ttl: Duration,

    /// Maximum instances per namespace; `-1` disables the limit
    pub namespace_capacity: i64,

    /// How long a joining node waits for the initial peer sync
    #[serde(rename = "sync_wait_time_ms", with = "crate::serde_helpers::millis")]
    pub sync_wait_time: Duration,

    /// Primary read-write store
    pub store: StoreConfig,

    /// Read-only filesystem discovery source (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FileSystemConfig>,
}

/// Backing store of the read-write catalog
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local in-memory catalog
    #[default]
    Memory,

    /// Redis server
    Redis {
        /// Server address (e.g., "127.0.0.1:6379")
        address: String,
        /// AUTH password (optional)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },

    /// Embedded sled database
    Sled {
        /// Database directory
        path: PathBuf,
    },
}

impl StoreConfig {
    /// Whether the catalog keeps its state outside this process
    pub fn is_external(&self) -> bool {
        !matches!(self, StoreConfig::Memory)
    }
}

/// Filesystem discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemConfig {
    /// Directory holding one `<namespace>.conf` file per namespace
    pub dir: PathBuf,

    /// How often to look for changes
    #[serde(
        default,
        rename = "polling_interval_ms",
        with = "crate::serde_helpers::opt_millis",
        skip_serializing_if = "Option::is_none"
    )]
    pub polling_interval: Option<Duration>,
}

impl FileSystemConfig {
    /// Effective polling interval, raised to the minimum when too short
    pub fn polling_interval(&self) -> Duration {
        self.polling_interval
            .unwrap_or(DEFAULT_POLLING_INTERVAL)
            .max(MINIMUM_POLLING_INTERVAL)
    }
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            minimum_ttl: MINIMUM_TTL,
            maximum_ttl: MAXIMUM_TTL,
            namespace_capacity: DEFAULT_NAMESPACE_CAPACITY,
            sync_wait_time: DEFAULT_SYNC_WAIT_TIME,
            store: StoreConfig::Memory,
            filesystem: None,
        }
    }
}

impl CatalogConfig {
    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        use async_fs::File;
        use futures::io::AsyncReadExt;

        let mut file = File::open(path.as_ref()).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;

        let config: Self = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&contents)?,
            _ => serde_json::from_str(&contents)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check TTL bounds and capacity
    pub fn validate(&self) -> Result<()> {
        if self.minimum_ttl > self.maximum_ttl {
            return Err(Error::Config(format!(
                "minimum TTL {:?} exceeds maximum TTL {:?}",
                self.minimum_ttl, self.maximum_ttl
            )));
        }
        if self.default_ttl < self.minimum_ttl || self.default_ttl > self.maximum_ttl {
            return Err(Error::Config(format!(
                "default TTL {:?} outside [{:?}, {:?}]",
                self.default_ttl, self.minimum_ttl, self.maximum_ttl
            )));
        }
        if self.namespace_capacity < UNLIMITED_CAPACITY {
            return Err(Error::Config(format!(
                "namespace capacity {} must be -1 or non-negative",
                self.namespace_capacity
            )));
        }
        Ok(())
    }

    /// Set the TTL bounds
    pub fn with_ttls(mut self, default: Duration, minimum: Duration, maximum: Duration) -> Self {
        self.default_ttl = default;
        self.minimum_ttl = minimum;
        self.maximum_ttl = maximum;
        self
    }

    /// Set the namespace capacity
    pub fn with_capacity(mut self, capacity: i64) -> Self {
        self.namespace_capacity = capacity;
        self
    }

    /// Set the backing store
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Set the sync wait time
    pub fn with_sync_wait_time(mut self, wait: Duration) -> Self {
        self.sync_wait_time = wait;
        self
    }

    /// Add a filesystem discovery source
    pub fn with_filesystem(mut self, filesystem: FileSystemConfig) -> Self {
        self.filesystem = Some(filesystem);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CatalogConfig::default();
        assert_eq!(config.default_ttl, Duration::from_secs(30));
        assert_eq!(config.minimum_ttl, Duration::from_secs(5));
        assert_eq!(config.maximum_ttl, Duration::from_secs(600));
        assert_eq!(config.namespace_capacity, 50);
        assert_eq!(config.store, StoreConfig::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        let config = CatalogConfig::default().with_ttls(
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(10),
        );
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = CatalogConfig::default().with_ttls(
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        assert!(config.validate().is_err());

        assert!(CatalogConfig::default().with_capacity(-1).validate().is_ok());
        assert!(CatalogConfig::default().with_capacity(-2).validate().is_err());
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r#"
default_ttl_ms: 20000
namespace_capacity: -1
store:
  type: redis
  address: "127.0.0.1:6379"
filesystem:
  dir: /etc/catalog
  polling_interval_ms: 1000
"#;
        let config: CatalogConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.default_ttl, Duration::from_secs(20));
        assert_eq!(config.minimum_ttl, MINIMUM_TTL);
        assert_eq!(config.namespace_capacity, -1);
        assert!(config.store.is_external());
        assert_eq!(
            config.store,
            StoreConfig::Redis {
                address: "127.0.0.1:6379".into(),
                password: None
            }
        );

        let fs = config.filesystem.unwrap();
        // 1s is below the floor
        assert_eq!(fs.polling_interval(), MINIMUM_POLLING_INTERVAL);
    }

    #[smol_potat::test]
    async fn test_from_file_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("catalog.json");
        let config = CatalogConfig::default()
            .with_capacity(10)
            .with_store(StoreConfig::Sled {
                path: dir.path().join("db"),
            });
        async_fs::write(&json_path, serde_json::to_vec(&config).unwrap())
            .await
            .unwrap();
        assert_eq!(CatalogConfig::from_file(&json_path).await.unwrap(), config);

        let yaml_path = dir.path().join("catalog.yml");
        async_fs::write(&yaml_path, "namespace_capacity: 3\n")
            .await
            .unwrap();
        let loaded = CatalogConfig::from_file(&yaml_path).await.unwrap();
        assert_eq!(loaded.namespace_capacity, 3);
        assert_eq!(loaded.default_ttl, DEFAULT_TTL);

        let bad_path = dir.path().join("bad.yaml");
        async_fs::write(&bad_path, "minimum_ttl_ms: 900000\n")
            .await
            .unwrap();
        assert!(matches!(
            CatalogConfig::from_file(&bad_path).await,
            Err(Error::Config(_))
        ));
    }
}
