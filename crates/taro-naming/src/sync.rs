//! Peer status transport contract and its wire messages.
//!
//! The HTTP/RPC layer that actually moves these between peers lives
//! outside this crate; anti-entropy only depends on the trait.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use taro_common::Result;

use crate::service::Service;

/// Checksum report broadcast by the owner of a set of services.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceChecksum {
    pub namespace_id: String,
    /// Service name to checksum, for every owned non-empty service.
    pub service_name_map: HashMap<String, String>,
}

impl ServiceChecksum {
    pub fn new(namespace_id: &str) -> Self {
        Self {
            namespace_id: namespace_id.to_string(),
            service_name_map: HashMap::new(),
        }
    }
}

/// Snapshot of a service's instance health as served by its owner.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceStatus {
    pub dom: String,
    /// Entries encoded as `ip:port_healthy`.
    pub ips: Vec<String>,
    pub checksum: String,
    pub last_ref_time: i64,
}

impl ServiceStatus {
    /// Render the serving-side snapshot for a local service.
    pub fn of(service: &Service) -> Self {
        let ips = service
            .all_ips()
            .iter()
            .map(|i| format!("{}_{}", i.ip_addr(), i.healthy))
            .collect();
        Self {
            dom: service.name.clone(),
            ips,
            checksum: service.checksum(),
            last_ref_time: service.last_modified_millis(),
        }
    }
}

/// Parse one `ip:port_healthy` status entry.
pub fn parse_status_entry(entry: &str) -> Option<(String, bool)> {
    let (ip_addr, healthy) = entry.rsplit_once('_')?;
    if ip_addr.is_empty() {
        return None;
    }
    Some((ip_addr.to_string(), healthy.parse().ok()?))
}

/// Transport used by anti-entropy.
#[async_trait::async_trait]
pub trait Synchronizer: Send + Sync {
    /// Fire-and-forget checksum broadcast to one peer.
    async fn send(&self, server_addr: &str, checksums: &ServiceChecksum) -> Result<()>;

    /// Fetch the authoritative status of one service from its owner.
    async fn get(
        &self,
        server_addr: &str,
        namespace_id: &str,
        service_name: &str,
    ) -> Result<ServiceStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Instance;

    #[test]
    fn test_parse_status_entry() {
        assert_eq!(
            parse_status_entry("10.0.0.1:8080_true").unwrap(),
            ("10.0.0.1:8080".to_string(), true)
        );
        assert_eq!(
            parse_status_entry("10.0.0.1:8080_false").unwrap(),
            ("10.0.0.1:8080".to_string(), false)
        );
        assert!(parse_status_entry("garbage").is_none());
        assert!(parse_status_entry("10.0.0.1:8080_maybe").is_none());
        assert!(parse_status_entry("_true").is_none());
    }

    #[test]
    fn test_status_of_service() {
        let service = Service::new("public", "DEFAULT_GROUP::svc");
        let mut unhealthy = Instance::new("10.0.0.1", 8080);
        unhealthy.healthy = false;
        service.update_ips(vec![unhealthy], true);
        service.recalculate_checksum();

        let status = ServiceStatus::of(&service);
        assert_eq!(status.dom, "DEFAULT_GROUP::svc");
        assert_eq!(status.ips, vec!["10.0.0.1:8080_false"]);
        assert_eq!(status.checksum, service.checksum());
    }

    #[test]
    fn test_checksum_message_shape() {
        let mut report = ServiceChecksum::new("public");
        report
            .service_name_map
            .insert("DEFAULT_GROUP::svc".to_string(), "abc123".to_string());
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("namespaceId"));
        assert!(json.contains("serviceNameMap"));
        let back: ServiceChecksum = serde_json::from_str(&json).unwrap();
        assert_eq!(back.service_name_map.len(), 1);
    }
}
