//! Anti-entropy between peers.
//!
//! Two cooperating workers around one bounded queue. The reporter
//! periodically broadcasts checksums for the services this peer owns.
//! The receive path compares inbound checksums for services this peer
//! does not own and queues divergent keys. The pull worker drains the
//! queue and rewrites local instance health from the owner's snapshot.
//!
//! Only `healthy` converges here. Ephemeral membership converges by
//! routing writes to the owning peer and by heartbeat expiry; persistent
//! membership converges through the consistency layer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use taro_core::{DistroMapper, MemberManager};

use crate::registry::ServiceRegistry;
use crate::switch::SwitchDomain;
use crate::sync::{ServiceChecksum, Synchronizer, parse_status_entry};

/// Queue capacity; beyond it the oldest pending key is dropped.
pub const MAX_PENDING_SERVICE_KEYS: usize = 1 << 20;

/// One divergent service waiting to be pulled from its owner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceKey {
    pub namespace_id: String,
    pub service_name: String,
    pub server_addr: String,
    pub checksum: String,
}

pub struct ServiceStatusSynchronizer {
    registry: Arc<ServiceRegistry>,
    distro: Arc<DistroMapper>,
    members: Arc<MemberManager>,
    synchronizer: Arc<dyn Synchronizer>,
    switch: Arc<SwitchDomain>,
    to_be_updated: Mutex<VecDeque<ServiceKey>>,
    queued: Notify,
    running: AtomicBool,
}

impl ServiceStatusSynchronizer {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        distro: Arc<DistroMapper>,
        members: Arc<MemberManager>,
        synchronizer: Arc<dyn Synchronizer>,
        switch: Arc<SwitchDomain>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            distro,
            members,
            synchronizer,
            switch,
            to_be_updated: Mutex::new(VecDeque::new()),
            queued: Notify::new(),
            running: AtomicBool::new(false),
        })
    }

    /// Spawn the reporter and the pull worker.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("service status synchronizer starting");
        let reporter = self.clone();
        tokio::spawn(async move { reporter.reporter_loop().await });
        let updater = self.clone();
        tokio::spawn(async move { updater.updater_loop().await });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.queued.notify_one();
        info!("service status synchronizer stopped");
    }

    pub fn pending_update_count(&self) -> usize {
        self.to_be_updated.lock().len()
    }

    async fn reporter_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            // Period is re-read every cycle so it can be tuned live.
            let period = self
                .switch
                .service_status_synchronization_period_millis()
                .max(100) as u64;
            tokio::time::sleep(Duration::from_millis(period)).await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.report_once().await;
        }
    }

    /// One reporter sweep: broadcast checksums of every owned non-empty
    /// service to every other peer. Per-peer failures are logged and do
    /// not abort the sweep.
    pub async fn report_once(&self) {
        for namespace_id in self.registry.get_all_namespaces() {
            let mut report = ServiceChecksum::new(&namespace_id);
            for service_name in self.registry.get_all_service_names(&namespace_id) {
                if !self.distro.responsible(&service_name) {
                    continue;
                }
                let Some(service) = self.registry.get_service(&namespace_id, &service_name)
                else {
                    continue;
                };
                if service.is_empty() {
                    continue;
                }
                service.recalculate_checksum();
                report
                    .service_name_map
                    .insert(service_name, service.checksum());
            }
            if report.service_name_map.is_empty() {
                continue;
            }

            for member in self.members.all_members() {
                if self.members.is_self(&member.address) {
                    continue;
                }
                if let Err(e) = self.synchronizer.send(&member.address, &report).await {
                    warn!(
                        "failed to report service status of {} to {}: {}",
                        namespace_id, member.address, e
                    );
                }
            }
        }
    }

    /// Inbound checksum report from a peer: queue every service this
    /// peer does not own whose checksum diverges or which is absent.
    pub fn receive_checksums(&self, report: &ServiceChecksum, from: &str) {
        for (service_name, remote_checksum) in &report.service_name_map {
            if self.distro.responsible(service_name) {
                continue;
            }
            let diverged = match self
                .registry
                .get_service(&report.namespace_id, service_name)
            {
                Some(service) => service.checksum() != *remote_checksum,
                None => true,
            };
            if diverged {
                self.enqueue(ServiceKey {
                    namespace_id: report.namespace_id.clone(),
                    service_name: service_name.clone(),
                    server_addr: from.to_string(),
                    checksum: remote_checksum.clone(),
                });
            }
        }
    }

    fn enqueue(&self, key: ServiceKey) {
        self.enqueue_bounded(key, MAX_PENDING_SERVICE_KEYS);
    }

    /// Bounded enqueue: when full, drop the oldest entry so the queue
    /// stays live at the cost of staleness. The drop-then-push pair is
    /// atomic under the queue lock.
    fn enqueue_bounded(&self, key: ServiceKey, capacity: usize) {
        {
            let mut queue = self.to_be_updated.lock();
            if queue.len() >= capacity {
                let dropped = queue.pop_front();
                warn!(
                    "service update queue full, dropped {:?}",
                    dropped.map(|k| k.service_name)
                );
            }
            queue.push_back(key);
        }
        self.queued.notify_one();
    }

    async fn updater_loop(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let next = self.to_be_updated.lock().pop_front();
            match next {
                Some(key) => {
                    let this = self.clone();
                    tokio::spawn(async move { this.update_service(key).await });
                }
                None => self.queued.notified().await,
            }
        }
    }

    /// Pull the owner's snapshot for one service and overwrite local
    /// instance health where it differs. Fires one push when anything
    /// changed.
    pub async fn update_service(&self, key: ServiceKey) {
        let Some(service) = self
            .registry
            .get_service(&key.namespace_id, &key.service_name)
        else {
            // Membership is not this worker's job; the service appears
            // here once its meta record replicates.
            debug!(
                "skipping status pull for unknown service {}@{}",
                key.service_name, key.namespace_id
            );
            return;
        };

        let status = match self
            .synchronizer
            .get(&key.server_addr, &key.namespace_id, &key.service_name)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                warn!(
                    "failed to pull status of {} from {}: {}",
                    key.service_name, key.server_addr, e
                );
                return;
            }
        };

        let remote_health: HashMap<String, bool> = status
            .ips
            .iter()
            .filter_map(|entry| parse_status_entry(entry))
            .collect();

        let mut changed = false;
        for instance in service.all_ips() {
            let ip_addr = instance.ip_addr();
            if let Some(&healthy) = remote_health.get(&ip_addr)
                && healthy != instance.healthy
                && let Some(cluster) = service.cluster(&instance.cluster_name)
                && cluster.update_instance_health(&ip_addr, healthy)
            {
                changed = true;
                info!(
                    "health of {} in {} overwritten to {} from {}",
                    ip_addr, key.service_name, healthy, key.server_addr
                );
            }
        }

        if changed {
            service.recalculate_checksum();
            self.registry.push().service_changed(&service);
        }
    }
}
