//! Discovery source backed by per-namespace JSON files
//!
//! Namespace `ns` is described by `<dir>/ns.conf`:
//!
//! ```json
//! {"instances": [{"service_name": "reviews",
//!                 "endpoint": {"type": "http", "value": "10.0.0.5:9080"},
//!                 "tags": ["v1"]}]}
//! ```

use super::{DiscoveredInstance, DiscoveryFactory, ServiceDiscovery};
use crate::config::FileSystemConfig;
use crate::error::{Error, Result};
use crate::model::{Endpoint, Namespace, UP, compute_instance_id};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use smol::lock::Mutex;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// Tag appended to every file-defined instance
pub const FILESYSTEM_TAG: &str = "filesystem";

#[derive(Debug, Deserialize)]
struct InstanceFile {
    #[serde(default)]
    instances: Vec<FileInstance>,
}

#[derive(Debug, Deserialize)]
struct FileInstance {
    service_name: String,
    endpoint: Endpoint,
    #[serde(default)]
    status: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

impl From<FileInstance> for DiscoveredInstance {
    fn from(entry: FileInstance) -> Self {
        let mut tags = entry.tags;
        tags.push(FILESYSTEM_TAG.to_string());

        DiscoveredInstance {
            id: compute_instance_id(&entry.service_name, Some(&entry.endpoint)),
            status: if entry.status.is_empty() {
                UP.to_string()
            } else {
                entry.status
            },
            service_name: entry.service_name,
            endpoint: entry.endpoint,
            tags,
            metadata: entry.metadata,
            ttl_secs: 0,
            last_heartbeat: Some(Utc::now()),
        }
    }
}

#[derive(Default)]
struct FileState {
    instances: Vec<DiscoveredInstance>,
    modified: Option<SystemTime>,
    last_poll: Option<Instant>,
}

/// Discovery over one namespace file, re-read when it changes
pub struct FileSystemDiscovery {
    namespace: Namespace,
    path: PathBuf,
    polling_interval: Duration,
    state: Mutex<FileState>,
}

impl FileSystemDiscovery {
    /// Watch `<dir>/<namespace>.conf`, checking for changes every `polling_interval`
    pub fn new(namespace: Namespace, dir: &Path, polling_interval: Duration) -> Self {
        let path = dir.join(format!("{namespace}.conf"));
        Self {
            namespace,
            path,
            polling_interval,
            state: Mutex::new(FileState::default()),
        }
    }

    /// Current instances, refreshing from disk when the polling interval elapsed
    async fn snapshot(&self) -> Vec<DiscoveredInstance> {
        let mut state = self.state.lock().await;
        let due = state
            .last_poll
            .is_none_or(|at| at.elapsed() >= self.polling_interval);
        if due {
            self.refresh(&mut state).await;
            state.last_poll = Some(Instant::now());
        }
        state.instances.clone()
    }

    async fn refresh(&self, state: &mut FileState) {
        let metadata = match async_fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = ?self.path, error = %e, "Failed to stat instance file");
                }
                state.instances.clear();
                state.modified = None;
                return;
            }
        };

        let modified = metadata.modified().ok();
        if modified.is_some() && modified <= state.modified {
            return;
        }

        match self.load().await {
            Ok(instances) => {
                debug!(
                    namespace = %self.namespace,
                    count = instances.len(),
                    "Instance file reloaded"
                );
                state.instances = instances;
                state.modified = modified;
            }
            Err(e) => {
                warn!(path = ?self.path, error = %e, "Failed to load instance file, keeping previous contents");
            }
        }
    }

    async fn load(&self) -> Result<Vec<DiscoveredInstance>> {
        let contents = async_fs::read(&self.path).await?;
        let file: InstanceFile = serde_json::from_slice(&contents)?;
        Ok(file.instances.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl ServiceDiscovery for FileSystemDiscovery {
    async fn list_services(&self) -> Result<Vec<String>> {
        let names: BTreeSet<String> = self
            .snapshot()
            .await
            .into_iter()
            .map(|instance| instance.service_name)
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn list_instances(&self) -> Result<Vec<DiscoveredInstance>> {
        Ok(self.snapshot().await)
    }

    async fn list_service_instances(&self, service_name: &str) -> Result<Vec<DiscoveredInstance>> {
        let mut instances = self.snapshot().await;
        instances.retain(|instance| instance.service_name == service_name);
        Ok(instances)
    }
}

/// Creates one [`FileSystemDiscovery`] per namespace
pub struct FileSystemDiscoveryFactory {
    dir: PathBuf,
    polling_interval: Duration,
}

impl FileSystemDiscoveryFactory {
    /// Create a factory; the configured directory must exist
    pub async fn new(config: &FileSystemConfig) -> Result<Self> {
        let metadata = async_fs::metadata(&config.dir).await.map_err(|e| {
            Error::Config(format!(
                "filesystem discovery directory {}: {e}",
                config.dir.display()
            ))
        })?;
        if !metadata.is_dir() {
            return Err(Error::Config(format!(
                "{} is not a directory",
                config.dir.display()
            )));
        }

        info!("Filesystem discovery reading {:?}", config.dir);
        Ok(Self {
            dir: config.dir.clone(),
            polling_interval: config.polling_interval(),
        })
    }
}

#[async_trait]
impl DiscoveryFactory for FileSystemDiscoveryFactory {
    async fn create_discovery(&self, namespace: &Namespace) -> Result<Arc<dyn ServiceDiscovery>> {
        Ok(Arc::new(FileSystemDiscovery::new(
            namespace.clone(),
            &self.dir,
            self.polling_interval,
        )))
    }
}
