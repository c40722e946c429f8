//! In-process replication transport
//!
//! A [`LocalCluster`] connects the nodes of a single process through channels.
//! It backs the cluster tests and embedded deployments; members can be
//! disconnected and reconnected to simulate partitions, during which traffic to
//! and from them is dropped.

use super::handler::decode_sync_entry;
use super::{InMessage, MemberId, NOTIFY_CHANNEL_CAPACITY, Replication, Replicator};
use crate::error::{Error, Result};
use crate::model::Namespace;
use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Delay between attempts to find a peer to synchronize with
const SYNC_RETRY_INTERVAL: Duration = Duration::from_millis(50);

struct Member {
    notify: Sender<InMessage>,
    sync_requests: Sender<Sender<Vec<u8>>>,
    connected: bool,
}

/// Set of in-process nodes replicating to each other
#[derive(Default)]
pub struct LocalCluster {
    members: Mutex<BTreeMap<MemberId, Member>>,
}

impl LocalCluster {
    /// Create an empty cluster
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a member and return its transport
    pub fn join(self: &Arc<Self>, id: impl Into<MemberId>) -> Result<Arc<LocalReplication>> {
        let id = id.into();
        let (notify, notifications) = async_channel::unbounded();
        let (sync_tx, sync_requests) = async_channel::unbounded();

        let mut members = self.members.lock();
        if members.contains_key(&id) {
            return Err(Error::Replication(format!("member {id} already joined")));
        }
        members.insert(
            id.clone(),
            Member {
                notify,
                sync_requests: sync_tx,
                connected: true,
            },
        );
        info!(member = %id, size = members.len(), "Member joined local cluster");

        Ok(Arc::new(LocalReplication {
            id,
            cluster: self.clone(),
            notifications,
            sync_requests,
            replicators: Mutex::new(HashSet::new()),
        }))
    }

    /// Current members
    pub fn members(&self) -> Vec<MemberId> {
        self.members.lock().keys().cloned().collect()
    }

    /// Cut a member off; returns false for unknown members
    pub fn disconnect(&self, id: &MemberId) -> bool {
        self.set_connected(id, false)
    }

    /// Restore a disconnected member; returns false for unknown members
    pub fn reconnect(&self, id: &MemberId) -> bool {
        self.set_connected(id, true)
    }

    fn set_connected(&self, id: &MemberId, connected: bool) -> bool {
        match self.members.lock().get_mut(id) {
            Some(member) => {
                member.connected = connected;
                info!(member = %id, connected, "Member connectivity changed");
                true
            }
            None => false,
        }
    }

    fn leave(&self, id: &MemberId) {
        if let Some(member) = self.members.lock().remove(id) {
            member.notify.close();
            member.sync_requests.close();
            info!(member = %id, "Member left local cluster");
        }
    }

    fn broadcast(&self, from: &MemberId, namespace: &Namespace, data: Vec<u8>) {
        let members = self.members.lock();
        if !members.get(from).is_some_and(|m| m.connected) {
            trace!(member = %from, "Dropping broadcast from disconnected member");
            return;
        }
        for (id, member) in members.iter() {
            if id == from || !member.connected {
                continue;
            }
            if let Err(e) = member.notify.try_send(InMessage {
                member_id: from.clone(),
                namespace: namespace.clone(),
                data: data.clone(),
            }) {
                trace!(from = %from, to = %id, error = %e, "Dropping broadcast to unavailable member");
            }
        }
    }

    fn send(&self, from: &MemberId, to: &MemberId, namespace: &Namespace, data: Vec<u8>) -> Result<()> {
        let members = self.members.lock();
        let target = members
            .get(to)
            .ok_or_else(|| Error::Replication(format!("unknown member {to}")))?;
        if !target.connected || !members.get(from).is_some_and(|m| m.connected) {
            trace!(from = %from, to = %to, "Dropping message across partition");
            return Ok(());
        }
        if let Err(e) = target.notify.try_send(InMessage {
            member_id: from.clone(),
            namespace: namespace.clone(),
            data,
        }) {
            trace!(from = %from, to = %to, error = %e, "Dropping message to unavailable member");
        }
        Ok(())
    }

    /// Connected peers of `id`, and whether it has any peer at all
    fn sync_peers(&self, id: &MemberId) -> (Vec<(MemberId, Sender<Sender<Vec<u8>>>)>, bool) {
        let members = self.members.lock();
        let has_peers = members.keys().any(|other| other != id);
        if !members.get(id).is_some_and(|m| m.connected) {
            return (Vec::new(), has_peers);
        }
        let peers = members
            .iter()
            .filter(|(other, member)| *other != id && member.connected)
            .map(|(other, member)| (other.clone(), member.sync_requests.clone()))
            .collect();
        (peers, has_peers)
    }
}

/// Transport of one [`LocalCluster`] member
pub struct LocalReplication {
    id: MemberId,
    cluster: Arc<LocalCluster>,
    notifications: Receiver<InMessage>,
    sync_requests: Receiver<Sender<Vec<u8>>>,
    replicators: Mutex<HashSet<Namespace>>,
}

impl LocalReplication {
    /// ID of this member
    pub fn id(&self) -> &MemberId {
        &self.id
    }
}

impl Replication for LocalReplication {
    fn replicator(&self, namespace: &Namespace) -> Result<Arc<dyn Replicator>> {
        if !self.replicators.lock().insert(namespace.clone()) {
            return Err(Error::Replication(format!(
                "replicator for namespace {namespace} already exists"
            )));
        }
        Ok(Arc::new(LocalReplicator {
            cluster: self.cluster.clone(),
            member: self.id.clone(),
            namespace: namespace.clone(),
        }))
    }

    fn notifications(&self) -> Receiver<InMessage> {
        self.notifications.clone()
    }

    fn sync(&self, wait: Duration) -> Receiver<InMessage> {
        let (tx, rx) = async_channel::unbounded();
        smol::spawn(pull_state(self.cluster.clone(), self.id.clone(), wait, tx)).detach();
        rx
    }

    fn sync_requests(&self) -> Receiver<Sender<Vec<u8>>> {
        self.sync_requests.clone()
    }

    fn stop(&self) {
        self.cluster.leave(&self.id);
    }
}

struct LocalReplicator {
    cluster: Arc<LocalCluster>,
    member: MemberId,
    namespace: Namespace,
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn broadcast(&self, data: Vec<u8>) -> Result<()> {
        self.cluster.broadcast(&self.member, &self.namespace, data);
        Ok(())
    }

    async fn send(&self, member: &MemberId, data: Vec<u8>) -> Result<()> {
        self.cluster.send(&self.member, member, &self.namespace, data)
    }
}

/// Pull the full state of the first reachable peer into `out`
async fn pull_state(cluster: Arc<LocalCluster>, id: MemberId, wait: Duration, out: Sender<InMessage>) {
    let deadline = Instant::now() + wait;
    loop {
        let (peers, has_peers) = cluster.sync_peers(&id);
        if !has_peers {
            debug!(member = %id, "No peers to synchronize with");
            break;
        }

        for (peer, requests) in peers {
            let (tx, rx) = async_channel::bounded(NOTIFY_CHANNEL_CAPACITY);
            if requests.send(tx).await.is_err() {
                continue;
            }
            info!(member = %id, peer = %peer, "Synchronizing from peer");
            receive_state(&peer, rx, wait, &out).await;
            out.close();
            return;
        }

        if Instant::now() >= deadline {
            warn!(member = %id, "No reachable peer to synchronize with");
            break;
        }
        smol::Timer::after(SYNC_RETRY_INTERVAL).await;
    }
    out.close();
}

async fn receive_state(peer: &MemberId, rx: Receiver<Vec<u8>>, wait: Duration, out: &Sender<InMessage>) {
    loop {
        let next = smol::future::or(async { rx.recv().await.ok() }, async {
            smol::Timer::after(wait).await;
            None
        })
        .await;
        let Some(data) = next else {
            break;
        };

        match decode_sync_entry(peer, &data) {
            Ok(message) => {
                if out.send(message).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(peer = %peer, error = %e, "Dropping malformed synchronization entry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::SyncEntry;

    fn message(replication: &LocalReplication) -> InMessage {
        replication.notifications().try_recv().unwrap()
    }

    #[smol_potat::test]
    async fn test_broadcast_and_send() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a").unwrap();
        let b = cluster.join("b").unwrap();
        let c = cluster.join("c").unwrap();
        let ns = Namespace::new("tenant");

        let replicator = a.replicator(&ns).unwrap();
        replicator.broadcast(b"hello".to_vec()).await.unwrap();
        assert_eq!(message(&b).data, b"hello");
        let received = message(&c);
        assert_eq!(received.member_id, MemberId::new("a"));
        assert_eq!(received.namespace, ns);
        assert!(a.notifications().try_recv().is_err());

        replicator.send(&MemberId::new("b"), b"direct".to_vec()).await.unwrap();
        assert_eq!(message(&b).data, b"direct");
        assert!(c.notifications().try_recv().is_err());

        assert!(replicator.send(&MemberId::new("z"), vec![]).await.is_err());
    }

    #[smol_potat::test]
    async fn test_one_replicator_per_namespace() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a").unwrap();
        let ns = Namespace::new("tenant");
        assert!(a.replicator(&ns).is_ok());
        assert!(a.replicator(&ns).is_err());
        assert!(a.replicator(&Namespace::new("other")).is_ok());
        assert!(cluster.join("a").is_err());
    }

    #[smol_potat::test]
    async fn test_partition_drops_traffic() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a").unwrap();
        let b = cluster.join("b").unwrap();
        let replicator = a.replicator(&Namespace::new("tenant")).unwrap();

        assert!(cluster.disconnect(b.id()));
        replicator.broadcast(b"lost".to_vec()).await.unwrap();
        assert!(b.notifications().try_recv().is_err());

        assert!(cluster.reconnect(b.id()));
        replicator.broadcast(b"seen".to_vec()).await.unwrap();
        assert_eq!(message(&b).data, b"seen");
        assert!(!cluster.disconnect(&MemberId::new("z")));
    }

    #[smol_potat::test]
    async fn test_closed_member_does_not_block_others() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a").unwrap();
        let b = cluster.join("b").unwrap();
        let c = cluster.join("c").unwrap();
        let replicator = a.replicator(&Namespace::new("tenant")).unwrap();

        // Still a member, but no longer accepting messages
        b.notifications().close();

        replicator.broadcast(b"after".to_vec()).await.unwrap();
        replicator.send(b.id(), b"direct".to_vec()).await.unwrap();
        assert_eq!(message(&c).data, b"after");
        assert!(b.notifications().try_recv().is_err());
    }

    #[smol_potat::test]
    async fn test_sync_without_peers_closes_immediately() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a").unwrap();
        let stream = a.sync(Duration::from_secs(30));
        let started = Instant::now();
        assert!(stream.recv().await.is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[smol_potat::test]
    async fn test_sync_pulls_from_peer() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a").unwrap();
        let b = cluster.join("b").unwrap();

        let serve = smol::spawn({
            let requests = a.sync_requests();
            async move {
                let out = requests.recv().await.unwrap();
                let entry = SyncEntry {
                    namespace: Namespace::new("tenant"),
                    data: b"payload".to_vec(),
                };
                out.send(serde_json::to_vec(&entry).unwrap()).await.unwrap();
                out.send(b"junk".to_vec()).await.unwrap();
                out.close();
            }
        });

        let stream = b.sync(Duration::from_secs(5));
        let first = stream.recv().await.unwrap();
        assert_eq!(first.member_id, MemberId::new("a"));
        assert_eq!(first.namespace, Namespace::new("tenant"));
        assert_eq!(first.data, b"payload");
        assert!(stream.recv().await.is_err());
        serve.await;
    }

    #[smol_potat::test]
    async fn test_stop_closes_channels() {
        let cluster = LocalCluster::new();
        let a = cluster.join("a").unwrap();
        a.stop();
        assert!(a.notifications().recv().await.is_err());
        assert!(a.sync_requests().recv().await.is_err());
        assert!(cluster.members().is_empty());
    }
}
