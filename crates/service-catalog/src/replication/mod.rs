//! Peer replication of catalog state
//!
//! A [`Replication`] transport connects this node to its cluster peers. The
//! catalog side is made of a [`ReplicatedCatalog`](catalog::ReplicatedCatalog)
//! per namespace, which broadcasts local mutations and applies incoming ones,
//! and a [`ReplicationHandler`](handler::ReplicationHandler) routing inbound
//! traffic and serving bulk synchronization to joining peers.

pub mod catalog;
pub mod channel;
pub mod handler;
pub mod local;
pub mod message;

use crate::error::Result;
use crate::model::Namespace;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use catalog::{ReplicatedCatalog, ReplicatedCatalogFactory, ReplicationLayer};
pub use channel::{TimeoutSender, timeout_channel};
pub use handler::ReplicationHandler;
pub use local::{LocalCluster, LocalReplication};
pub use message::ReplicationEvent;

/// Send timeout of the replication queues
pub const REPLICATION_TIMEOUT: Duration = Duration::from_secs(7);

/// Capacity of a replicated catalog's inbound queue
pub const NOTIFY_CHANNEL_CAPACITY: usize = 256;

/// Identity of a cluster peer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Message received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InMessage {
    /// Sending peer
    pub member_id: MemberId,
    /// Namespace the message belongs to
    pub namespace: Namespace,
    /// Encoded [`ReplicationEvent`]
    pub data: Vec<u8>,
}

/// One record of a bulk synchronization stream (JSON encoded on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEntry {
    /// Namespace of the record
    pub namespace: Namespace,
    /// Encoded [`ReplicationEvent`]
    #[serde(with = "crate::serde_helpers::base64_bytes")]
    pub data: Vec<u8>,
}

/// Outbound side of the transport for one namespace
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Send to every peer
    async fn broadcast(&self, data: Vec<u8>) -> Result<()>;

    /// Send to one peer
    async fn send(&self, member: &MemberId, data: Vec<u8>) -> Result<()>;
}

/// Cluster replication transport
pub trait Replication: Send + Sync {
    /// Create the replicator of `namespace`; at most one per namespace
    fn replicator(&self, namespace: &Namespace) -> Result<Arc<dyn Replicator>>;

    /// Messages replicated by peers
    fn notifications(&self) -> async_channel::Receiver<InMessage>;

    /// Pull the full state of one peer; the stream closes when it is complete,
    /// or once `wait` passes without progress
    fn sync(&self, wait: Duration) -> async_channel::Receiver<InMessage>;

    /// Requests from peers for our full state; each carries the sink of
    /// encoded [`SyncEntry`] records, to be closed when done
    fn sync_requests(&self) -> async_channel::Receiver<async_channel::Sender<Vec<u8>>>;

    /// Leave the cluster and close every channel
    fn stop(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_entry_wire_format() {
        let entry = SyncEntry {
            namespace: Namespace::new("tenant"),
            data: b"{}".to_vec(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["namespace"], "tenant");
        assert_eq!(json["data"], "e30=");
        assert_eq!(serde_json::from_value::<SyncEntry>(json).unwrap(), entry);
    }
}
