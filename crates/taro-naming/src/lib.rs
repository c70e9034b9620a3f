//! Taro Naming - Service registry core
//!
//! This crate provides:
//! - The namespaced service registry table
//! - The Service/Cluster/Instance aggregate
//! - Anti-entropy checksum reporting and pull-and-merge
//! - Empty-service reaping

pub mod anti_entropy;
pub mod cluster;
pub mod health;
pub mod key;
pub mod merger;
pub mod model;
pub mod push;
pub mod reaper;
pub mod registry;
pub mod service;
pub mod switch;
pub mod sync;

// Re-export commonly used types
pub use anti_entropy::{ServiceKey, ServiceStatusSynchronizer};
pub use cluster::Cluster;
pub use model::{Instance, Instances, ServiceRecord};
pub use reaper::EmptyServiceCleaner;
pub use registry::ServiceRegistry;
pub use service::Service;
pub use switch::{NamingConfig, SwitchDomain};
pub use sync::{ServiceChecksum, ServiceStatus, Synchronizer};
