//! Multi-tenant service instance catalog
//!
//! This crate keeps track of the live instances of services, partitioned by
//! namespace (tenant). Instances are registered with a time-to-live and
//! expire unless renewed.
//!
//! # Architecture
//!
//! - [`catalog::Catalog`] is the per-namespace API: register, deregister,
//!   renew, status changes and queries
//! - catalogs are backed by process memory, by an external key-value store
//!   (sled, or Redis with the `redis` feature), or project a read-only
//!   discovery source such as a directory of JSON files
//! - [`catalog::map::CatalogMap`] creates one catalog per namespace on first
//!   use, through a chain of factory layers
//! - with an in-memory store, catalogs can be replicated to cluster peers
//!   through a [`replication::Replication`] transport
//!
//! Background work (expiry timers, replication loops) runs on `smol` tasks.
//!
//! # Example
//!
//! ```no_run
//! use service_catalog::prelude::*;
//!
//! # async fn example() -> service_catalog::Result<()> {
//! let map = CatalogMap::builder(CatalogConfig::default()).build().await?;
//! let catalog = map.get_catalog(&Namespace::new("tenant-a")).await?;
//!
//! let instance = catalog
//!     .register(ServiceInstance::new("reviews", Endpoint::new("http", "10.0.0.7:9080")))
//!     .await?;
//! catalog.renew(&instance.id).await?;
//!
//! let is_up: &Predicate = &|si: &ServiceInstance| si.status == UP;
//! let up = catalog.list("reviews", Some(is_up)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod catalog;
pub mod config;
pub mod discovery;
pub mod error;
pub mod metrics;
pub mod model;
pub mod replication;
pub mod store;

mod expiry;
mod serde_helpers;

pub use catalog::map::{CatalogMap, CatalogMapBuilder};
pub use catalog::{Catalog, CatalogFactory, Predicate};
pub use config::{CatalogConfig, FileSystemConfig, StoreConfig};
pub use error::{Error, ErrorKind, Result};
pub use model::{Endpoint, Extensions, Namespace, Service, ServiceInstance};

/// Re-export key types for convenience
pub mod prelude {
    pub use crate::{
        Catalog, CatalogConfig, CatalogMap, Endpoint, Error, Namespace, Predicate, Result,
        Service, ServiceInstance, StoreConfig,
        model::{OUT_OF_SERVICE, STARTING, UP},
    };
}
