//! Error types for the service catalog

use thiserror::Error;

/// Service catalog error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or oversized input, or a mutation sent to a read-only catalog
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Query for a service name that has no live instances
    #[error("No such service: {0}")]
    NoSuchServiceName(String),

    /// Operation on an unknown instance ID
    #[error("No such service instance: {0}")]
    NoSuchServiceInstance(String),

    /// Namespace capacity reached on a genuinely new registration
    #[error("Namespace quota exceeded: {namespace} holds {count} instances (capacity {capacity})")]
    NamespaceQuotaExceeded {
        /// Namespace that rejected the registration
        namespace: String,
        /// Instances currently held
        count: usize,
        /// Configured capacity
        capacity: i64,
    },

    /// Unexpected backing-store failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Replication transport failure
    #[error("Replication error: {0}")]
    Replication(String),

    /// A bounded channel stayed full past its send timeout
    #[error("Channel send timed out after {0:?}")]
    ChannelTimeout(std::time::Duration),

    /// The receiving side of a channel is gone
    #[error("Channel closed")]
    ChannelClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Sled database error
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Coarse error classification that protocol layers map onto their own
/// status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed input or read-only catalog misuse
    BadRequest,
    /// Unknown service name
    NoSuchServiceName,
    /// Unknown instance ID
    NoSuchServiceInstance,
    /// Capacity limit hit
    NamespaceQuotaExceeded,
    /// Anything else
    InternalServerError,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_) => ErrorKind::BadRequest,
            Error::NoSuchServiceName(_) => ErrorKind::NoSuchServiceName,
            Error::NoSuchServiceInstance(_) => ErrorKind::NoSuchServiceInstance,
            Error::NamespaceQuotaExceeded { .. } => ErrorKind::NamespaceQuotaExceeded,
            _ => ErrorKind::InternalServerError,
        }
    }

    pub(crate) fn read_only(operation: &str) -> Self {
        Error::BadRequest(format!("Read-only Catalog: API Not Supported ({operation})"))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(Error::BadRequest("x".into()).kind(), ErrorKind::BadRequest);
        assert_eq!(
            Error::NoSuchServiceInstance("id".into()).kind(),
            ErrorKind::NoSuchServiceInstance
        );
        assert_eq!(
            Error::NamespaceQuotaExceeded {
                namespace: "ns".into(),
                count: 1,
                capacity: 1
            }
            .kind(),
            ErrorKind::NamespaceQuotaExceeded
        );
        let io = std::io::Error::other("disk on fire");
        assert_eq!(Error::from(io).kind(), ErrorKind::InternalServerError);
        assert_eq!(Error::ChannelClosed.kind(), ErrorKind::InternalServerError);
    }

    #[test]
    fn test_read_only_message() {
        let err = Error::read_only("Register");
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert!(err.to_string().contains("Read-only Catalog: API Not Supported"));
    }
}
