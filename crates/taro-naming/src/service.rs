//! Service aggregate root.
//!
//! A service owns its clusters, reacts to instance-list change events
//! delivered by the consistency layer, and maintains the checksum that
//! anti-entropy uses as its divergence oracle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use md5::{Digest, Md5};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::info;

use crate::cluster::Cluster;
use crate::health::{ClientBeat, ClientBeatCheckTask, ClientBeatProcessor, HealthScheduler};
use crate::model::{
    DEFAULT_CLUSTER, DEFAULT_IP_DELETE_TIMEOUT_MS, Instance, Selector, ServiceRecord,
    clamp_weight, now_millis, split_service_name,
};
use crate::push::PushService;

/// Header fields that `update` copies wholesale from a peer record.
struct ServiceMeta {
    protect_threshold: f64,
    metadata: BTreeMap<String, String>,
    owners: Vec<String>,
    token: String,
    selector: Selector,
    enabled: bool,
    reset_weight: bool,
}

pub struct Service {
    pub namespace_id: String,
    /// Canonical `group::name`.
    pub name: String,
    pub group_name: String,
    meta: RwLock<ServiceMeta>,
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
    checksum: RwLock<String>,
    last_modified_millis: AtomicI64,
    /// Consecutive empty reaper sweeps observed for this service.
    finalize_count: AtomicU32,
    ip_delete_timeout: AtomicI64,
    /// Mutation boundary for merge-then-put sequences.
    op_lock: tokio::sync::Mutex<()>,
}

impl Service {
    pub fn new(namespace_id: &str, full_name: &str) -> Self {
        let (group_name, _) = split_service_name(full_name);
        Self {
            namespace_id: namespace_id.to_string(),
            name: full_name.to_string(),
            group_name,
            meta: RwLock::new(ServiceMeta {
                protect_threshold: 0.0,
                metadata: BTreeMap::new(),
                owners: Vec::new(),
                token: String::new(),
                selector: Selector::default(),
                enabled: true,
                reset_weight: false,
            }),
            clusters: RwLock::new(HashMap::new()),
            checksum: RwLock::new(String::new()),
            last_modified_millis: AtomicI64::new(now_millis()),
            finalize_count: AtomicU32::new(0),
            ip_delete_timeout: AtomicI64::new(DEFAULT_IP_DELETE_TIMEOUT_MS),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_record(record: &ServiceRecord) -> Self {
        let service = Self::new(&record.namespace_id, &record.name);
        service.apply_meta(record);
        {
            let mut clusters = service.clusters.write();
            for (name, cluster_record) in &record.cluster_map {
                clusters.insert(
                    name.clone(),
                    Arc::new(Cluster::from_record(cluster_record, &record.name)),
                );
            }
        }
        if record.last_modified_millis > 0 {
            service
                .last_modified_millis
                .store(record.last_modified_millis, Ordering::SeqCst);
        }
        service.recalculate_checksum();
        service
    }

    pub fn to_record(&self) -> ServiceRecord {
        let meta = self.meta.read();
        let cluster_map: BTreeMap<String, _> = self
            .clusters
            .read()
            .iter()
            .map(|(name, cluster)| (name.clone(), cluster.to_record()))
            .collect();
        ServiceRecord {
            namespace_id: self.namespace_id.clone(),
            name: self.name.clone(),
            group_name: self.group_name.clone(),
            protect_threshold: meta.protect_threshold,
            metadata: meta.metadata.clone(),
            owners: meta.owners.clone(),
            token: meta.token.clone(),
            selector: meta.selector.clone(),
            enabled: meta.enabled,
            reset_weight: meta.reset_weight,
            ip_delete_timeout: self.ip_delete_timeout(),
            last_modified_millis: self.last_modified_millis(),
            checksum: self.checksum(),
            cluster_map,
        }
    }

    fn apply_meta(&self, record: &ServiceRecord) {
        let mut meta = self.meta.write();
        meta.protect_threshold = record.protect_threshold.clamp(0.0, 1.0);
        meta.metadata = record.metadata.clone();
        meta.owners = record.owners.clone();
        meta.token = record.token.clone();
        meta.selector = record.selector.clone();
        meta.enabled = record.enabled;
        meta.reset_weight = record.reset_weight;
        self.ip_delete_timeout
            .store(record.ip_delete_timeout, Ordering::SeqCst);
    }

    // ---- aggregate state ----

    pub fn cluster(&self, name: &str) -> Option<Arc<Cluster>> {
        self.clusters.read().get(name).cloned()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.read().keys().cloned().collect()
    }

    pub fn get_or_create_cluster(&self, name: &str) -> Arc<Cluster> {
        if let Some(cluster) = self.cluster(name) {
            return cluster;
        }
        let mut clusters = self.clusters.write();
        clusters
            .entry(name.to_string())
            .or_insert_with(|| {
                info!("cluster {} auto-created for {}", name, self.name);
                Arc::new(Cluster::new(name, &self.name))
            })
            .clone()
    }

    pub fn all_ips(&self) -> Vec<Instance> {
        self.clusters
            .read()
            .values()
            .flat_map(|c| c.all_ips_both_planes())
            .collect()
    }

    pub fn all_ips_of_plane(&self, ephemeral: bool) -> Vec<Instance> {
        self.clusters
            .read()
            .values()
            .flat_map(|c| c.all_ips(ephemeral))
            .collect()
    }

    /// Look up an instance by `ip:port` on either plane.
    pub fn get_instance(&self, ip_addr: &str) -> Option<Instance> {
        self.all_ips().into_iter().find(|i| i.ip_addr() == ip_addr)
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.read().values().all(|c| c.is_empty())
    }

    pub fn ip_count(&self) -> usize {
        self.all_ips().len()
    }

    pub fn healthy_instance_count(&self) -> usize {
        self.all_ips().iter().filter(|i| i.healthy).count()
    }

    /// Protection flag: true when the healthy ratio has fallen to or
    /// below the protect threshold. An empty service is not protected.
    pub fn trigger_flag(&self) -> bool {
        let ips = self.all_ips();
        if ips.is_empty() {
            return false;
        }
        let healthy = ips.iter().filter(|i| i.healthy).count();
        healthy as f64 / ips.len() as f64 <= self.protect_threshold()
    }

    pub fn protect_threshold(&self) -> f64 {
        self.meta.read().protect_threshold
    }

    pub fn enabled(&self) -> bool {
        self.meta.read().enabled
    }

    pub fn checksum(&self) -> String {
        self.checksum.read().clone()
    }

    pub fn last_modified_millis(&self) -> i64 {
        self.last_modified_millis.load(Ordering::SeqCst)
    }

    pub fn ip_delete_timeout(&self) -> i64 {
        self.ip_delete_timeout.load(Ordering::SeqCst)
    }

    pub(crate) fn op_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.op_lock
    }

    // ---- reaper bookkeeping ----

    pub fn finalize_count(&self) -> u32 {
        self.finalize_count.load(Ordering::SeqCst)
    }

    pub(crate) fn bump_finalize_count(&self) -> u32 {
        self.finalize_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn reset_finalize_count(&self) {
        self.finalize_count.store(0, Ordering::SeqCst);
    }

    // ---- change handling ----

    /// Apply an instance-list change event for one plane.
    pub fn on_instance_change(
        &self,
        mut instances: Vec<Instance>,
        ephemeral: bool,
        push: &dyn PushService,
    ) {
        for instance in &mut instances {
            instance.weight = clamp_weight(instance.weight);
        }
        self.update_ips(instances, ephemeral);
        self.recalculate_checksum();
        push.service_changed(self);
    }

    /// Install the new instance list, partitioned by cluster.
    ///
    /// Clusters are auto-created on first reference; clusters that got
    /// no instances this round are cleared on the given plane.
    pub fn update_ips(&self, instances: Vec<Instance>, ephemeral: bool) {
        let mut by_cluster: HashMap<String, Vec<Instance>> = self
            .cluster_names()
            .into_iter()
            .map(|name| (name, Vec::new()))
            .collect();

        for mut instance in instances {
            if instance.cluster_name.is_empty() {
                instance.cluster_name = DEFAULT_CLUSTER.to_string();
            }
            self.get_or_create_cluster(&instance.cluster_name);
            by_cluster
                .entry(instance.cluster_name.clone())
                .or_default()
                .push(instance);
        }

        for (cluster_name, list) in by_cluster {
            if let Some(cluster) = self.cluster(&cluster_name) {
                cluster.update_ips(list, ephemeral);
            }
        }

        self.last_modified_millis
            .store(now_millis(), Ordering::SeqCst);
    }

    /// Absorb a peer's meta record: copy the header fields and reconcile
    /// the cluster map in place.
    pub fn update(&self, record: &ServiceRecord) {
        self.apply_meta(record);

        let mut clusters = self.clusters.write();
        for (name, cluster_record) in &record.cluster_map {
            match clusters.get(name) {
                Some(cluster) => cluster.update_config(cluster_record),
                None => {
                    clusters.insert(
                        name.clone(),
                        Arc::new(Cluster::from_record(cluster_record, &self.name)),
                    );
                }
            }
        }
        clusters.retain(|name, _| {
            let keep = record.cluster_map.contains_key(name);
            if !keep {
                info!("cluster {} removed from {}", name, self.name);
            }
            keep
        });
        drop(clusters);

        self.last_modified_millis
            .store(now_millis(), Ordering::SeqCst);
        self.recalculate_checksum();
    }

    /// Recompute the MD5 checksum over the canonical serialization of
    /// the header fields and the sorted instance list.
    pub fn recalculate_checksum(&self) {
        let serialized = self.service_string();
        let digest = Md5::digest(serialized.as_bytes());
        *self.checksum.write() = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
    }

    /// Canonical serialization: header fields plus each instance rendered
    /// as `ip:port_weight_healthy_cluster`, sorted.
    fn service_string(&self) -> String {
        let mut ips: Vec<String> = self
            .all_ips()
            .iter()
            .map(Instance::checksum_string)
            .collect();
        ips.sort();

        let meta = self.meta.read();
        let view = ServiceStringView {
            name: &self.name,
            group_name: &self.group_name,
            protect_threshold: meta.protect_threshold,
            enabled: meta.enabled,
            reset_weight: meta.reset_weight,
            token: &meta.token,
            owners: &meta.owners,
            metadata: &meta.metadata,
            selector: &meta.selector,
            ips: &ips,
        };
        serde_json::to_string(&view).unwrap_or_default()
    }

    // ---- lifecycle ----

    /// Register the heartbeat sweep for this service.
    pub fn init(self: &Arc<Self>, health: &dyn HealthScheduler) {
        health.schedule_check(ClientBeatCheckTask::new(self));
    }

    /// Cancel scheduled checks. Idempotent.
    pub fn destroy(&self, health: &dyn HealthScheduler) {
        health.cancel_check(&ClientBeatCheckTask::key_of(&self.namespace_id, &self.name));
        info!("service destroyed: {}@{}", self.name, self.namespace_id);
    }

    /// Submit an inbound client heartbeat.
    pub fn process_client_beat(
        self: &Arc<Self>,
        beat: ClientBeat,
        health: &dyn HealthScheduler,
        push: Arc<dyn PushService>,
    ) {
        health.schedule_now(ClientBeatProcessor::new(self, beat, push));
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceStringView<'a> {
    name: &'a str,
    group_name: &'a str,
    protect_threshold: f64,
    enabled: bool,
    reset_weight: bool,
    token: &'a str,
    owners: &'a [String],
    metadata: &'a BTreeMap<String, String>,
    selector: &'a Selector,
    ips: &'a [String],
}
