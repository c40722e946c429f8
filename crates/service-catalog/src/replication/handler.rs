//! Routing of peer traffic to the replicated catalogs of this node

use super::catalog::ReplicatedCatalog;
use super::message::ReplicationEvent;
use super::{InMessage, MemberId, Replication, Replicator, SyncEntry};
use crate::catalog::Catalog;
use crate::catalog::map::CatalogMap;
use crate::error::{Error, Result};
use crate::model::Namespace;
use async_channel::Sender;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Owns the replication transport of a node.
///
/// Replicated catalogs register themselves here when created. Once
/// [activated](ReplicationHandler::activate), the handler pulls the state of a
/// peer, then forwards live notifications to the catalog of their namespace and
/// answers synchronization requests from joining peers.
pub struct ReplicationHandler {
    replication: Arc<dyn Replication>,
    sync_wait: Duration,
    catalogs: Mutex<HashMap<Namespace, Arc<ReplicatedCatalog>>>,
    map: OnceLock<Weak<CatalogMap>>,
}

impl ReplicationHandler {
    /// Create a handler over `replication`
    pub fn new(replication: Arc<dyn Replication>, sync_wait: Duration) -> Arc<Self> {
        Arc::new(Self {
            replication,
            sync_wait,
            catalogs: Mutex::new(HashMap::new()),
            map: OnceLock::new(),
        })
    }

    pub(crate) fn replicator(&self, namespace: &Namespace) -> Result<Arc<dyn Replicator>> {
        self.replication.replicator(namespace)
    }

    pub(crate) fn add_catalog(&self, namespace: Namespace, catalog: Arc<ReplicatedCatalog>) {
        debug!(namespace = %namespace, "Replicated catalog registered with handler");
        self.catalogs.lock().insert(namespace, catalog);
    }

    fn lookup(&self, namespace: &Namespace) -> Option<Arc<ReplicatedCatalog>> {
        self.catalogs.lock().get(namespace).cloned()
    }

    /// Namespaces with a replicated catalog
    pub fn namespaces(&self) -> Vec<Namespace> {
        let mut namespaces: Vec<_> = self.catalogs.lock().keys().cloned().collect();
        namespaces.sort();
        namespaces
    }

    /// Synchronize with a peer, then start serving replication traffic.
    ///
    /// Returns once the initial synchronization has completed or timed out.
    pub async fn activate(self: &Arc<Self>, map: Weak<CatalogMap>) -> Result<()> {
        if self.map.set(map).is_err() {
            return Err(Error::Replication(
                "replication handler already activated".into(),
            ));
        }

        self.synchronize().await;

        smol::spawn(self.clone().replicate()).detach();
        smol::spawn(self.clone().serve_sync_requests()).detach();
        info!("Replication handler activated");
        Ok(())
    }

    /// Stop the transport; the background loops end once its channels close
    pub fn stop(&self) {
        self.replication.stop();
    }

    /// Replicated catalog of `namespace`, created through the catalog map if
    /// a peer mentions a namespace this node has not served yet
    async fn catalog_for(&self, namespace: &Namespace) -> Result<Arc<ReplicatedCatalog>> {
        if let Some(catalog) = self.lookup(namespace) {
            return Ok(catalog);
        }

        let map = self
            .map
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::Replication("catalog map is gone".into()))?;
        map.get_catalog(namespace).await?;

        self.lookup(namespace).ok_or_else(|| {
            Error::Replication(format!(
                "no replicated catalog exists for namespace {namespace}"
            ))
        })
    }

    async fn forward(&self, message: InMessage) -> Result<()> {
        let catalog = self.catalog_for(&message.namespace).await?;
        catalog.deliver(message).await
    }

    async fn synchronize(&self) {
        info!(wait = ?self.sync_wait, "Synchronizing with cluster");
        let stream = self.replication.sync(self.sync_wait);

        let mut applied = 0usize;
        while let Ok(message) = stream.recv().await {
            let namespace = message.namespace.clone();
            match self.forward(message).await {
                Ok(()) => applied += 1,
                Err(e) => error!(namespace = %namespace, error = %e, "Failed to apply synchronized entry"),
            }
        }
        info!(entries = applied, "Synchronization completed");
    }

    async fn replicate(self: Arc<Self>) {
        let notifications = self.replication.notifications();
        while let Ok(message) = notifications.recv().await {
            let namespace = message.namespace.clone();
            let member = message.member_id.clone();
            if let Err(e) = self.forward(message).await {
                error!(namespace = %namespace, member = %member, error = %e, "Failed to forward replication message");
            }
        }
        debug!("Replication notification loop stopped");
    }

    async fn serve_sync_requests(self: Arc<Self>) {
        let requests = self.replication.sync_requests();
        while let Ok(out) = requests.recv().await {
            smol::spawn(self.clone().serve_sync(out)).detach();
        }
        debug!("Synchronization request loop stopped");
    }

    /// Stream every namespace in parallel, then close `out`
    async fn serve_sync(self: Arc<Self>, out: Sender<Vec<u8>>) {
        let catalogs: Vec<_> = self
            .catalogs
            .lock()
            .iter()
            .map(|(namespace, catalog)| (namespace.clone(), catalog.clone()))
            .collect();
        debug!(namespaces = catalogs.len(), "Serving synchronization request");

        let tasks: Vec<_> = catalogs
            .into_iter()
            .map(|(namespace, catalog)| smol::spawn(stream_catalog(namespace, catalog, out.clone())))
            .collect();
        futures::future::join_all(tasks).await;

        out.close();
    }
}

async fn stream_catalog(namespace: Namespace, catalog: Arc<ReplicatedCatalog>, out: Sender<Vec<u8>>) {
    let mut sent = 0usize;
    for service in catalog.list_services(None).await {
        let instances = match catalog.list(&service.service_name, None).await {
            Ok(instances) => instances,
            // Expired between the two calls
            Err(_) => continue,
        };

        for instance in instances {
            let entry = ReplicationEvent::Register(instance)
                .encode()
                .and_then(|data| {
                    Ok(serde_json::to_vec(&SyncEntry {
                        namespace: namespace.clone(),
                        data,
                    })?)
                });
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    error!(namespace = %namespace, error = %e, "Failed to encode synchronization entry");
                    continue;
                }
            };
            if out.send(entry).await.is_err() {
                warn!(namespace = %namespace, "Synchronization peer went away");
                return;
            }
            sent += 1;
        }
    }
    debug!(namespace = %namespace, instances = sent, "Namespace synchronized");
}

/// Decode a synchronization record received from `member`
pub(crate) fn decode_sync_entry(member: &MemberId, data: &[u8]) -> Result<InMessage> {
    let entry: SyncEntry = serde_json::from_slice(data)?;
    Ok(InMessage {
        member_id: member.clone(),
        namespace: entry.namespace,
        data: entry.data,
    })
}
