//! Naming data model
//!
//! Value types shared by the registry aggregate and the consistency
//! layer: service instances, the instance-list record, and the service
//! meta record. All records serialize as camelCase JSON.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Deserializer, Serialize};

/// Group used when a request does not name one.
pub const DEFAULT_GROUP: &str = "DEFAULT_GROUP";

/// Cluster used when an instance does not name one.
pub const DEFAULT_CLUSTER: &str = "DEFAULT";

/// Separator between group and service name in the canonical form.
pub const SERVICE_NAME_SPLITTER: &str = "::";

/// Site marker for instances held in the local table.
pub const LOCALHOST_SITE: &str = "localhost";

pub const MAX_WEIGHT: f64 = 10_000.0;
pub const MIN_POSITIVE_WEIGHT: f64 = 0.01;

/// Milliseconds without a beat before an ephemeral instance is dropped.
pub const DEFAULT_IP_DELETE_TIMEOUT_MS: i64 = 30_000;

/// Current wall clock in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Clamp a weight into `[0, 10000]` with a 0.01 shelf for positives.
pub fn clamp_weight(weight: f64) -> f64 {
    if weight <= 0.0 {
        return if weight < 0.0 { 0.0 } else { weight };
    }
    weight.clamp(MIN_POSITIVE_WEIGHT, MAX_WEIGHT)
}

fn deserialize_clamped_weight<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let weight = f64::deserialize(deserializer)?;
    Ok(clamp_weight(weight))
}

/// Canonical `group::name` form, defaulting the group.
pub fn full_service_name(group_name: &str, service_name: &str) -> String {
    let group = if group_name.is_empty() {
        DEFAULT_GROUP
    } else {
        group_name
    };
    format!("{}{}{}", group, SERVICE_NAME_SPLITTER, service_name)
}

/// Split a canonical name into `(group, name)`.
pub fn split_service_name(full_name: &str) -> (String, String) {
    match full_name.split_once(SERVICE_NAME_SPLITTER) {
        Some((group, name)) => (group.to_string(), name.to_string()),
        None => (DEFAULT_GROUP.to_string(), full_name.to_string()),
    }
}

/// One endpoint registration under a cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
    pub instance_id: String,
    pub ip: String,
    pub port: i32,
    #[serde(deserialize_with = "deserialize_clamped_weight")]
    pub weight: f64,
    pub healthy: bool,
    pub enabled: bool,
    pub ephemeral: bool,
    /// Persistent instances only: administratively forced unhealthy.
    pub marked: bool,
    pub cluster_name: String,
    pub service_name: String,
    pub metadata: HashMap<String, String>,
    pub last_beat: i64,
}

impl Default for Instance {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            ip: String::new(),
            port: 0,
            weight: 1.0,
            healthy: true,
            enabled: true,
            ephemeral: true,
            marked: false,
            cluster_name: DEFAULT_CLUSTER.to_string(),
            service_name: String::new(),
            metadata: HashMap::new(),
            last_beat: now_millis(),
        }
    }
}

impl Instance {
    pub fn new(ip: &str, port: i32) -> Self {
        Self {
            ip: ip.to_string(),
            port,
            ..Default::default()
        }
    }

    /// `ip:port`, the identity used for in-cluster uniqueness.
    pub fn ip_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// `ip:port:site:cluster`, the identity used in instance-list records.
    pub fn datum_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.ip, self.port, LOCALHOST_SITE, self.cluster_name
        )
    }

    /// Composite instance id, used outside snowflake mode.
    pub fn composite_id(&self) -> String {
        format!(
            "{}#{}#{}#{}",
            self.ip, self.port, self.cluster_name, self.service_name
        )
    }

    /// Identity comparison: same ip and plane, with port 0 acting as a
    /// wildcard on either side.
    pub fn same_endpoint(&self, other: &Instance) -> bool {
        self.ip == other.ip
            && (self.port == other.port || self.port == 0 || other.port == 0)
            && self.ephemeral == other.ephemeral
    }

    /// Rendering used inside the service checksum.
    pub fn checksum_string(&self) -> String {
        format!(
            "{}_{}_{}_{}",
            self.ip_addr(),
            self.weight,
            self.healthy,
            self.cluster_name
        )
    }

    /// Peer-transport encoding: `ip:port_weight_healthy_marked_cluster`.
    pub fn to_wire_string(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}",
            self.ip_addr(),
            self.weight,
            self.healthy,
            self.marked,
            self.cluster_name
        )
    }

    /// Parse any of the documented wire encodings:
    /// `ip:port`, then optionally `_weight`, `_healthy`, `_marked`, and a
    /// trailing `_cluster` after any of those.
    pub fn from_wire_string(encoded: &str) -> Option<Self> {
        let mut parts = encoded.split('_');
        let addr = parts.next()?;
        let (ip, port) = addr.rsplit_once(':')?;
        let port: i32 = port.parse().ok()?;

        let mut instance = Instance::new(ip, port);

        let Some(second) = parts.next() else {
            return Some(instance);
        };
        instance.weight = clamp_weight(second.parse().ok()?);

        let mut saw_healthy = false;
        let mut saw_marked = false;
        for part in parts {
            if !saw_healthy && let Ok(healthy) = part.parse::<bool>() {
                instance.healthy = healthy;
                saw_healthy = true;
            } else if saw_healthy && !saw_marked && let Ok(marked) = part.parse::<bool>() {
                instance.marked = marked;
                saw_marked = true;
            } else {
                instance.cluster_name = part.to_string();
            }
        }
        Some(instance)
    }
}

/// Instance-list record stored under an instance-list key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instances {
    pub instance_list: Vec<Instance>,
}

/// Opaque client-side instance filter carried on the service meta.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Selector {
    #[serde(rename = "type")]
    pub selector_type: String,
    pub expression: String,
}

/// Cluster definition carried on the service meta record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterRecord {
    pub name: String,
    pub check_type: String,
    pub check_port: i32,
    pub use_instance_port_for_check: bool,
    pub metadata: BTreeMap<String, String>,
}

impl Default for ClusterRecord {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLUSTER.to_string(),
            check_type: "TCP".to_string(),
            check_port: 80,
            use_instance_port_for_check: true,
            metadata: BTreeMap::new(),
        }
    }
}

/// Service meta record stored under a service-meta key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceRecord {
    pub namespace_id: String,
    /// Canonical `group::name`.
    pub name: String,
    pub group_name: String,
    pub protect_threshold: f64,
    pub metadata: BTreeMap<String, String>,
    pub owners: Vec<String>,
    pub token: String,
    pub selector: Selector,
    pub enabled: bool,
    pub reset_weight: bool,
    pub ip_delete_timeout: i64,
    pub last_modified_millis: i64,
    pub checksum: String,
    pub cluster_map: BTreeMap<String, ClusterRecord>,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            namespace_id: taro_common::DEFAULT_NAMESPACE.to_string(),
            name: String::new(),
            group_name: DEFAULT_GROUP.to_string(),
            protect_threshold: 0.0,
            metadata: BTreeMap::new(),
            owners: Vec::new(),
            token: String::new(),
            selector: Selector::default(),
            enabled: true,
            reset_weight: false,
            ip_delete_timeout: DEFAULT_IP_DELETE_TIMEOUT_MS,
            last_modified_millis: 0,
            checksum: String::new(),
            cluster_map: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_weight_bounds() {
        assert_eq!(clamp_weight(20_000.0), 10_000.0);
        assert_eq!(clamp_weight(0.005), 0.01);
        assert_eq!(clamp_weight(-1.0), 0.0);
        assert_eq!(clamp_weight(0.0), 0.0);
        assert_eq!(clamp_weight(2.5), 2.5);
    }

    #[test]
    fn test_weight_clamped_on_deserialize() {
        let inst: Instance =
            serde_json::from_str(r#"{"ip":"1.1.1.1","port":80,"weight":20000}"#).unwrap();
        assert_eq!(inst.weight, 10_000.0);

        let inst: Instance =
            serde_json::from_str(r#"{"ip":"1.1.1.1","port":80,"weight":0.005}"#).unwrap();
        assert_eq!(inst.weight, 0.01);

        let inst: Instance =
            serde_json::from_str(r#"{"ip":"1.1.1.1","port":80,"weight":-1}"#).unwrap();
        assert_eq!(inst.weight, 0.0);
    }

    #[test]
    fn test_full_service_name() {
        assert_eq!(full_service_name("", "svc"), "DEFAULT_GROUP::svc");
        assert_eq!(full_service_name("G1", "svc"), "G1::svc");
    }

    #[test]
    fn test_split_service_name() {
        assert_eq!(
            split_service_name("G1::svc"),
            ("G1".to_string(), "svc".to_string())
        );
        assert_eq!(
            split_service_name("bare"),
            ("DEFAULT_GROUP".to_string(), "bare".to_string())
        );
    }

    #[test]
    fn test_instance_keys() {
        let mut inst = Instance::new("10.0.0.1", 8080);
        inst.cluster_name = "c1".to_string();
        inst.service_name = "DEFAULT_GROUP::svc".to_string();
        assert_eq!(inst.ip_addr(), "10.0.0.1:8080");
        assert_eq!(inst.datum_key(), "10.0.0.1:8080:localhost:c1");
        assert_eq!(inst.composite_id(), "10.0.0.1#8080#c1#DEFAULT_GROUP::svc");
    }

    #[test]
    fn test_same_endpoint() {
        let a = Instance::new("10.0.0.1", 8080);
        let b = Instance::new("10.0.0.1", 8080);
        assert!(a.same_endpoint(&b));

        let wildcard = Instance::new("10.0.0.1", 0);
        assert!(a.same_endpoint(&wildcard));

        let mut persistent = Instance::new("10.0.0.1", 8080);
        persistent.ephemeral = false;
        assert!(!a.same_endpoint(&persistent));

        let other_port = Instance::new("10.0.0.1", 9090);
        assert!(!a.same_endpoint(&other_port));
    }

    #[test]
    fn test_wire_string_shapes() {
        let bare = Instance::from_wire_string("10.0.0.1:8080").unwrap();
        assert_eq!(bare.weight, 1.0);
        assert!(bare.healthy);

        let weighted = Instance::from_wire_string("10.0.0.1:8080_2.5").unwrap();
        assert_eq!(weighted.weight, 2.5);
        assert_eq!(weighted.cluster_name, "DEFAULT");

        let with_cluster = Instance::from_wire_string("10.0.0.1:8080_2.5_serverlist").unwrap();
        assert_eq!(with_cluster.cluster_name, "serverlist");

        let with_health = Instance::from_wire_string("10.0.0.1:8080_2.5_false").unwrap();
        assert!(!with_health.healthy);

        let health_cluster =
            Instance::from_wire_string("10.0.0.1:8080_2.5_false_serverlist").unwrap();
        assert!(!health_cluster.healthy);
        assert_eq!(health_cluster.cluster_name, "serverlist");

        let marked = Instance::from_wire_string("10.0.0.1:8080_2.5_false_true").unwrap();
        assert!(marked.marked);

        let full = Instance::from_wire_string("10.0.0.1:8080_2.5_false_true_serverlist").unwrap();
        assert!(!full.healthy);
        assert!(full.marked);
        assert_eq!(full.cluster_name, "serverlist");
    }

    #[test]
    fn test_wire_string_round_trip() {
        let mut inst = Instance::new("192.168.7.9", 7001);
        inst.weight = 3.5;
        inst.healthy = false;
        inst.marked = true;
        inst.cluster_name = "edge".to_string();

        let back = Instance::from_wire_string(&inst.to_wire_string()).unwrap();
        assert_eq!(back.ip, inst.ip);
        assert_eq!(back.port, inst.port);
        assert_eq!(back.weight, inst.weight);
        assert_eq!(back.healthy, inst.healthy);
        assert_eq!(back.marked, inst.marked);
        assert_eq!(back.cluster_name, inst.cluster_name);
    }

    #[test]
    fn test_wire_string_clamps_weight() {
        let inst = Instance::from_wire_string("10.0.0.1:8080_99999").unwrap();
        assert_eq!(inst.weight, 10_000.0);
    }

    #[test]
    fn test_wire_string_rejects_garbage() {
        assert!(Instance::from_wire_string("").is_none());
        assert!(Instance::from_wire_string("no-port").is_none());
        assert!(Instance::from_wire_string("ip:nan").is_none());
        assert!(Instance::from_wire_string("10.0.0.1:8080_notaweight").is_none());
    }

    #[test]
    fn test_service_record_defaults() {
        let record = ServiceRecord::default();
        assert_eq!(record.namespace_id, "public");
        assert!(record.enabled);
        assert_eq!(record.ip_delete_timeout, 30_000);
        assert!(record.cluster_map.is_empty());
    }

    #[test]
    fn test_instances_serialization() {
        let instances = Instances {
            instance_list: vec![Instance::new("10.0.0.1", 8080)],
        };
        let json = serde_json::to_string(&instances).unwrap();
        assert!(json.contains("instanceList"));
        let back: Instances = serde_json::from_str(&json).unwrap();
        assert_eq!(back.instance_list.len(), 1);
    }
}
