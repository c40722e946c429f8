//! Catalog decorator that replicates mutations to peers

use super::channel::{TimeoutSender, timeout_channel};
use super::handler::ReplicationHandler;
use super::message::ReplicationEvent;
use super::{InMessage, MemberId, NOTIFY_CHANNEL_CAPACITY, REPLICATION_TIMEOUT, Replicator};
use crate::catalog::{Catalog, CatalogFactory, FactoryLayer, Predicate};
use crate::error::Result;
use crate::model::{Namespace, Service, ServiceInstance};
use async_channel::Receiver;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

/// Applies mutations locally, then broadcasts them to the cluster.
///
/// Broadcast failures are logged and never fail the caller. Inbound peer
/// messages are queued with [`ReplicatedCatalog::deliver`] and applied by a
/// background task to the local catalog only.
pub struct ReplicatedCatalog {
    namespace: Namespace,
    local: Arc<dyn Catalog>,
    replicator: Arc<dyn Replicator>,
    inbound: TimeoutSender<InMessage>,
}

impl ReplicatedCatalog {
    /// Wrap `local` and start consuming peer messages
    pub fn new(
        namespace: Namespace,
        local: Arc<dyn Catalog>,
        replicator: Arc<dyn Replicator>,
    ) -> Self {
        let (inbound, rx) = timeout_channel(NOTIFY_CHANNEL_CAPACITY);
        smol::spawn(consume(
            namespace.clone(),
            local.clone(),
            replicator.clone(),
            rx,
        ))
        .detach();
        info!(namespace = %namespace, "Created replicated catalog");

        Self {
            namespace,
            local,
            replicator,
            inbound,
        }
    }

    /// Namespace served by this catalog
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Queue a peer message for the consumer task
    pub async fn deliver(&self, message: InMessage) -> Result<()> {
        self.inbound.send(message, REPLICATION_TIMEOUT).await
    }

    async fn publish(&self, event: ReplicationEvent) {
        let rep_type = event.rep_type();
        let result = match event.encode() {
            Ok(data) => self.replicator.broadcast(data).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            error!(
                namespace = %self.namespace,
                rep_type,
                error = %e,
                "Failed to broadcast replication event"
            );
        }
    }
}

impl Drop for ReplicatedCatalog {
    fn drop(&mut self) {
        self.inbound.close();
    }
}

#[async_trait]
impl Catalog for ReplicatedCatalog {
    async fn register(&self, instance: ServiceInstance) -> Result<ServiceInstance> {
        let registered = self.local.register(instance).await?;
        self.publish(ReplicationEvent::Register(registered.clone()))
            .await;
        Ok(registered)
    }

    async fn deregister(&self, instance_id: &str) -> Result<ServiceInstance> {
        let removed = self.local.deregister(instance_id).await?;
        self.publish(ReplicationEvent::Deregister(instance_id.to_string()))
            .await;
        Ok(removed)
    }

    async fn renew(&self, instance_id: &str) -> Result<ServiceInstance> {
        let renewed = self.local.renew(instance_id).await?;
        self.publish(ReplicationEvent::Renew(instance_id.to_string()))
            .await;
        Ok(renewed)
    }

    async fn set_status(&self, instance_id: &str, status: &str) -> Result<ServiceInstance> {
        let updated = self.local.set_status(instance_id, status).await?;
        self.publish(ReplicationEvent::SetStatus {
            instance_id: instance_id.to_string(),
            status: status.to_string(),
        })
        .await;
        Ok(updated)
    }

    async fn instance(&self, instance_id: &str) -> Result<ServiceInstance> {
        self.local.instance(instance_id).await
    }

    async fn list(
        &self,
        service_name: &str,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<ServiceInstance>> {
        self.local.list(service_name, predicate).await
    }

    async fn list_services(&self, predicate: Option<&Predicate>) -> Vec<Service> {
        self.local.list_services(predicate).await
    }
}

async fn consume(
    namespace: Namespace,
    local: Arc<dyn Catalog>,
    replicator: Arc<dyn Replicator>,
    inbound: Receiver<InMessage>,
) {
    while let Ok(message) = inbound.recv().await {
        apply(&namespace, local.as_ref(), replicator.as_ref(), message).await;
    }
    debug!(namespace = %namespace, "Replication consumer stopped");
}

/// Apply one peer message to the local catalog
pub(crate) async fn apply(
    namespace: &Namespace,
    local: &dyn Catalog,
    replicator: &dyn Replicator,
    message: InMessage,
) {
    let event = match ReplicationEvent::decode(&message.data) {
        Ok(event) => event,
        Err(e) => {
            error!(
                namespace = %namespace,
                member = %message.member_id,
                error = %e,
                "Dropping undecodable replication message"
            );
            return;
        }
    };
    trace!(namespace = %namespace, member = %message.member_id, rep_type = event.rep_type(), "Applying replication event");

    let member = &message.member_id;
    match event {
        ReplicationEvent::Register(instance) => {
            if let Err(e) = local.register(instance).await {
                error!(namespace = %namespace, member = %member, error = %e, "Replicated register failed");
            }
        }
        ReplicationEvent::Deregister(id) => {
            if let Err(e) = local.deregister(&id).await {
                debug!(namespace = %namespace, member = %member, instance_id = %id, error = %e, "Replicated deregister failed");
            }
        }
        ReplicationEvent::Renew(id) => {
            if let Err(e) = local.renew(&id).await {
                debug!(namespace = %namespace, member = %member, instance_id = %id, error = %e, "Renew for unknown instance, requesting read-repair");
                reply(namespace, replicator, member, ReplicationEvent::ReadRepair(id)).await;
            }
        }
        ReplicationEvent::SetStatus {
            instance_id,
            status,
        } => {
            if let Err(e) = local.set_status(&instance_id, &status).await {
                debug!(namespace = %namespace, member = %member, instance_id = %instance_id, error = %e, "Replicated status change failed");
            }
        }
        ReplicationEvent::ReadRepair(id) => match local.instance(&id).await {
            Ok(instance) => {
                reply(namespace, replicator, member, ReplicationEvent::Register(instance)).await;
            }
            Err(e) => {
                debug!(namespace = %namespace, member = %member, instance_id = %id, error = %e, "Cannot answer read-repair");
            }
        },
    }
}

async fn reply(
    namespace: &Namespace,
    replicator: &dyn Replicator,
    member: &MemberId,
    event: ReplicationEvent,
) {
    let rep_type = event.rep_type();
    let result = match event.encode() {
        Ok(data) => replicator.send(member, data).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!(namespace = %namespace, member = %member, rep_type, error = %e, "Failed to send replication reply");
    }
}

/// Wraps the catalogs of an inner factory in [`ReplicatedCatalog`]s and
/// registers them with the [`ReplicationHandler`]
pub struct ReplicatedCatalogFactory {
    local: Arc<dyn CatalogFactory>,
    handler: Arc<ReplicationHandler>,
}

impl ReplicatedCatalogFactory {
    /// Create the factory
    pub fn new(local: Arc<dyn CatalogFactory>, handler: Arc<ReplicationHandler>) -> Self {
        Self { local, handler }
    }
}

#[async_trait]
impl CatalogFactory for ReplicatedCatalogFactory {
    async fn create_catalog(&self, namespace: &Namespace) -> Result<Arc<dyn Catalog>> {
        let local = self.local.create_catalog(namespace).await?;
        let replicator = self.handler.replicator(namespace)?;
        let catalog = Arc::new(ReplicatedCatalog::new(
            namespace.clone(),
            local,
            replicator,
        ));
        self.handler.add_catalog(namespace.clone(), catalog.clone());
        Ok(catalog)
    }
}

/// Layer adding replication around the wrapped factory
pub struct ReplicationLayer {
    handler: Arc<ReplicationHandler>,
}

impl ReplicationLayer {
    /// Create the layer
    pub fn new(handler: Arc<ReplicationHandler>) -> Self {
        Self { handler }
    }
}

impl FactoryLayer for ReplicationLayer {
    fn wrap(self: Box<Self>, inner: Arc<dyn CatalogFactory>) -> Arc<dyn CatalogFactory> {
        Arc::new(ReplicatedCatalogFactory::new(inner, self.handler))
    }
}
