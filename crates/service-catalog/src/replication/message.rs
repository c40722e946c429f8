//! Replication event envelope

use crate::error::Result;
use crate::model::ServiceInstance;
use serde::{Deserialize, Serialize};

/// Catalog mutation exchanged between peers.
///
/// Encoded as `{"rep_type": "...", "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rep_type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplicationEvent {
    /// Full instance, registered or overwritten
    Register(ServiceInstance),
    /// Instance ID removed
    Deregister(String),
    /// Instance ID renewed
    Renew(String),
    /// Status change
    SetStatus {
        /// Instance ID
        instance_id: String,
        /// New status
        status: String,
    },
    /// Request for the full instance, answered with [`ReplicationEvent::Register`]
    ReadRepair(String),
}

impl ReplicationEvent {
    /// Wire name of the event type
    pub fn rep_type(&self) -> &'static str {
        match self {
            ReplicationEvent::Register(_) => "REGISTER",
            ReplicationEvent::Deregister(_) => "DEREGISTER",
            ReplicationEvent::Renew(_) => "RENEW",
            ReplicationEvent::SetStatus { .. } => "SET_STATUS",
            ReplicationEvent::ReadRepair(_) => "READ_REPAIR",
        }
    }

    /// Encode for the transport
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a transport payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Endpoint;

    #[test]
    fn test_wire_shape() {
        let renew = serde_json::to_value(ReplicationEvent::Renew("abc".into())).unwrap();
        assert_eq!(renew, serde_json::json!({"rep_type": "RENEW", "payload": "abc"}));

        let status = serde_json::to_value(ReplicationEvent::SetStatus {
            instance_id: "abc".into(),
            status: "UP".into(),
        })
        .unwrap();
        assert_eq!(status["rep_type"], "SET_STATUS");
        assert_eq!(status["payload"]["instance_id"], "abc");

        let repair = ReplicationEvent::ReadRepair("abc".into());
        let json = serde_json::to_value(&repair).unwrap();
        assert_eq!(json["rep_type"], repair.rep_type());
    }

    #[test]
    fn test_register_keeps_instance() {
        let instance = ServiceInstance::new("Calc", Endpoint::new("tcp", "1.2.3.4:80"))
            .with_id("abc")
            .with_metadata(vec![0, 159, 255]);
        let event = ReplicationEvent::Register(instance);
        let decoded = ReplicationEvent::decode(&event.encode().unwrap()).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(ReplicationEvent::decode(b"{\"rep_type\":\"BOGUS\"}").is_err());
        assert!(ReplicationEvent::decode(b"not json").is_err());
    }
}
