//! Cluster: a named bucket of instances inside a service.
//!
//! Each cluster holds two disjoint instance sets, one per plane. An
//! instance is ephemeral or persistent at birth and never migrates.
//! Within a cluster an `ip:port` appears on at most one plane.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::model::{ClusterRecord, Instance};

pub struct Cluster {
    pub name: String,
    /// Full name of the owning service; back-reference by value, not
    /// ownership, so destroying the service cannot leak through here.
    pub service_name: String,
    config: RwLock<ClusterRecord>,
    ephemeral_instances: RwLock<HashMap<String, Instance>>,
    persistent_instances: RwLock<HashMap<String, Instance>>,
}

impl Cluster {
    pub fn new(name: &str, service_name: &str) -> Self {
        let config = ClusterRecord {
            name: name.to_string(),
            ..Default::default()
        };
        Self {
            name: name.to_string(),
            service_name: service_name.to_string(),
            config: RwLock::new(config),
            ephemeral_instances: RwLock::new(HashMap::new()),
            persistent_instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn from_record(record: &ClusterRecord, service_name: &str) -> Self {
        let cluster = Self::new(&record.name, service_name);
        *cluster.config.write() = record.clone();
        cluster
    }

    pub fn to_record(&self) -> ClusterRecord {
        self.config.read().clone()
    }

    /// Replace the health-check configuration, keeping the instance sets.
    pub fn update_config(&self, record: &ClusterRecord) {
        *self.config.write() = record.clone();
    }

    pub fn all_ips(&self, ephemeral: bool) -> Vec<Instance> {
        let plane = if ephemeral {
            &self.ephemeral_instances
        } else {
            &self.persistent_instances
        };
        plane.read().values().cloned().collect()
    }

    pub fn all_ips_both_planes(&self) -> Vec<Instance> {
        let mut ips = self.all_ips(true);
        ips.extend(self.all_ips(false));
        ips
    }

    pub fn contains(&self, ip_addr: &str, ephemeral: bool) -> bool {
        let plane = if ephemeral {
            &self.ephemeral_instances
        } else {
            &self.persistent_instances
        };
        plane.read().contains_key(ip_addr)
    }

    pub fn is_empty(&self) -> bool {
        self.ephemeral_instances.read().is_empty() && self.persistent_instances.read().is_empty()
    }

    /// Install the new instance set for one plane.
    ///
    /// The whole set is replaced; instances whose `ip:port` already lives
    /// on the other plane are rejected to keep the planes disjoint.
    pub fn update_ips(&self, instances: Vec<Instance>, ephemeral: bool) {
        let (target, other) = if ephemeral {
            (&self.ephemeral_instances, &self.persistent_instances)
        } else {
            (&self.persistent_instances, &self.ephemeral_instances)
        };

        let mut fresh: HashMap<String, Instance> = HashMap::with_capacity(instances.len());
        {
            let other = other.read();
            for instance in instances {
                let ip_addr = instance.ip_addr();
                if other.contains_key(&ip_addr) {
                    warn!(
                        "{} already registered on the other plane of cluster {}/{}, dropped",
                        ip_addr, self.service_name, self.name
                    );
                    continue;
                }
                fresh.insert(ip_addr, instance);
            }
        }

        let mut target = target.write();
        let added: Vec<&String> = fresh.keys().filter(|k| !target.contains_key(*k)).collect();
        let removed: Vec<&String> = target.keys().filter(|k| !fresh.contains_key(*k)).collect();
        if !added.is_empty() || !removed.is_empty() {
            info!(
                "cluster {}/{} {} plane updated, added {:?}, removed {:?}",
                self.service_name,
                self.name,
                if ephemeral { "ephemeral" } else { "persistent" },
                added,
                removed
            );
        }
        *target = fresh;
    }

    /// Overwrite the health flag of the instance at `ip_addr`, whichever
    /// plane it lives on. Returns whether anything changed.
    pub fn update_instance_health(&self, ip_addr: &str, healthy: bool) -> bool {
        for plane in [&self.ephemeral_instances, &self.persistent_instances] {
            let mut plane = plane.write();
            if let Some(instance) = plane.get_mut(ip_addr) {
                if instance.healthy != healthy {
                    instance.healthy = healthy;
                    return true;
                }
                return false;
            }
        }
        false
    }

    /// Refresh the beat timestamp of an ephemeral instance, reviving it
    /// if a missed beat had marked it unhealthy. Returns whether the
    /// health flag flipped.
    pub fn record_beat(&self, ip_addr: &str, at_millis: i64) -> bool {
        let mut plane = self.ephemeral_instances.write();
        if let Some(instance) = plane.get_mut(ip_addr) {
            instance.last_beat = at_millis;
            if !instance.healthy {
                instance.healthy = true;
                info!(
                    "instance {} of {} revived by client beat",
                    ip_addr, self.service_name
                );
                return true;
            }
        }
        false
    }
}
