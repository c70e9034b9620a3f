//! The namespaced service registry table.
//!
//! Two-level concurrent map `namespace → name → Service` plus the
//! listeners that keep it in sync with the consistency layer. Writes
//! never mutate the table directly: they merge the new instance list and
//! put it through `Consistency`; the table changes when the change event
//! notifies back, on this peer or any other.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use regex::Regex;
use tracing::{error, info};

use taro_common::{DEFAULT_NAMESPACE, Result, TaroError, is_valid_name};
use taro_consistency::{ConsistencyService, RecordListener};

use crate::health::HealthScheduler;
use crate::key;
use crate::merger::{self, Action};
use crate::model::{ClusterRecord, DEFAULT_CLUSTER, Instance, Instances, ServiceRecord};
use crate::push::PushService;
use crate::service::Service;
use crate::switch::SwitchDomain;

pub struct ServiceRegistry {
    service_map: DashMap<String, DashMap<String, Arc<Service>>>,
    consistency: Arc<dyn ConsistencyService>,
    push: Arc<dyn PushService>,
    health: Arc<dyn HealthScheduler>,
    switch: Arc<SwitchDomain>,
    /// Instance-list listener handle per service, kept for deregistration.
    listeners: DashMap<String, Arc<dyn RecordListener>>,
    /// Serializes service insertion and first-time namespace creation.
    put_service_lock: tokio::sync::Mutex<()>,
}

fn normalize_namespace(namespace_id: &str) -> String {
    if namespace_id.is_empty() {
        DEFAULT_NAMESPACE.to_string()
    } else {
        namespace_id.to_string()
    }
}

fn listener_key(namespace_id: &str, service_name: &str) -> String {
    format!("{}##{}", namespace_id, service_name)
}

impl ServiceRegistry {
    pub fn new(
        consistency: Arc<dyn ConsistencyService>,
        push: Arc<dyn PushService>,
        health: Arc<dyn HealthScheduler>,
        switch: Arc<SwitchDomain>,
    ) -> Arc<Self> {
        Arc::new(Self {
            service_map: DashMap::new(),
            consistency,
            push,
            health,
            switch,
            listeners: DashMap::new(),
            put_service_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Subscribe to the service-meta key family. Call once at startup,
    /// before the transport starts handing out requests.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.consistency
            .listen(
                key::SERVICE_META_KEY_PREFIX,
                self.clone() as Arc<dyn RecordListener>,
            )
            .await
    }

    pub fn push(&self) -> Arc<dyn PushService> {
        self.push.clone()
    }

    pub fn health(&self) -> Arc<dyn HealthScheduler> {
        self.health.clone()
    }

    // ---- reads ----

    pub fn get_service(&self, namespace_id: &str, service_name: &str) -> Option<Arc<Service>> {
        self.service_map
            .get(namespace_id)?
            .get(service_name)
            .map(|s| s.clone())
    }

    pub fn contains_service(&self, namespace_id: &str, service_name: &str) -> bool {
        self.get_service(namespace_id, service_name).is_some()
    }

    pub fn get_all_namespaces(&self) -> Vec<String> {
        self.service_map.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_all_service_names(&self, namespace_id: &str) -> Vec<String> {
        self.service_map
            .get(namespace_id)
            .map(|inner| inner.iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    pub fn service_count(&self, namespace_id: &str) -> usize {
        self.service_map
            .get(namespace_id)
            .map(|inner| inner.len())
            .unwrap_or(0)
    }

    /// All services of a namespace whose full name matches `pattern`.
    /// The pattern must match the whole name.
    pub fn search_services(
        &self,
        namespace_id: &str,
        pattern: &str,
    ) -> Result<Vec<Arc<Service>>> {
        let regex = Regex::new(&format!("^(?:{})$", pattern))
            .map_err(|e| TaroError::InvalidArgument(format!("bad search pattern: {}", e)))?;
        let Some(inner) = self.service_map.get(namespace_id) else {
            return Ok(Vec::new());
        };
        Ok(inner
            .iter()
            .filter(|e| regex.is_match(e.key()))
            .map(|e| e.value().clone())
            .collect())
    }

    /// Offset-based page over the current table snapshot.
    ///
    /// `param` is a `group::name` fragment pair, each part wrapped in
    /// `.*`; `contained_instance` filters by `ip:port` when it contains a
    /// colon, by ip substring otherwise; `has_ip_count` drops services
    /// without instances. Returns `(total, page)`.
    pub fn get_paged_service(
        &self,
        namespace_id: &str,
        start_page: usize,
        page_size: usize,
        param: &str,
        contained_instance: &str,
        has_ip_count: bool,
    ) -> Result<(usize, Vec<Arc<Service>>)> {
        let mut services = if param.is_empty() {
            let Some(inner) = self.service_map.get(namespace_id) else {
                return Ok((0, Vec::new()));
            };
            inner.iter().map(|e| e.value().clone()).collect()
        } else {
            let pattern = param
                .split(crate::model::SERVICE_NAME_SPLITTER)
                .map(|part| {
                    if part.is_empty() {
                        ".*".to_string()
                    } else {
                        format!(".*{}.*", part)
                    }
                })
                .collect::<Vec<_>>()
                .join(crate::model::SERVICE_NAME_SPLITTER);
            self.search_services(namespace_id, &pattern)?
        };

        if !contained_instance.is_empty() {
            services.retain(|service| {
                service.all_ips().iter().any(|instance| {
                    if contained_instance.contains(':') {
                        instance.ip_addr() == contained_instance
                    } else {
                        instance.ip.contains(contained_instance)
                    }
                })
            });
        }
        if has_ip_count {
            services.retain(|service| service.ip_count() > 0);
        }

        // Map iteration order is arbitrary; keep pages stable.
        services.sort_by(|a, b| a.name.cmp(&b.name));

        let total = services.len();
        if page_size == 0 {
            return Ok((total, Vec::new()));
        }
        let page = services
            .into_iter()
            .skip(start_page * page_size)
            .take(page_size)
            .collect();
        Ok((total, page))
    }

    // ---- writes ----

    /// Create the service if it does not exist yet, with an optional
    /// initial cluster. Persistent services also publish their meta
    /// record so peers observe the creation.
    pub async fn create_empty_service_if_absent(
        &self,
        namespace_id: &str,
        service_name: &str,
        ephemeral: bool,
        cluster: Option<ClusterRecord>,
    ) -> Result<()> {
        let namespace_id = normalize_namespace(namespace_id);
        if self.contains_service(&namespace_id, service_name) {
            return Ok(());
        }
        if !is_valid_name(service_name) {
            return Err(TaroError::InvalidArgument(format!(
                "illegal service name: {}",
                service_name
            )));
        }

        info!("creating empty service {}@{}", service_name, namespace_id);
        let service = Arc::new(Service::new(&namespace_id, service_name));
        if let Some(cluster_record) = cluster {
            service
                .get_or_create_cluster(&cluster_record.name)
                .update_config(&cluster_record);
        }
        service.recalculate_checksum();
        self.put_service_and_init(service.clone()).await?;

        if !ephemeral {
            self.consistency
                .put(
                    &key::build_service_meta_key(&namespace_id, service_name),
                    record_value(&service.to_record())?,
                )
                .await?;
        }
        Ok(())
    }

    /// Register one instance, creating the service on first use.
    pub async fn register_instance(
        &self,
        namespace_id: &str,
        service_name: &str,
        instance: Instance,
    ) -> Result<()> {
        let namespace_id = normalize_namespace(namespace_id);
        let cluster = ClusterRecord {
            name: if instance.cluster_name.is_empty() {
                DEFAULT_CLUSTER.to_string()
            } else {
                instance.cluster_name.clone()
            },
            ..Default::default()
        };
        self.create_empty_service_if_absent(
            &namespace_id,
            service_name,
            instance.ephemeral,
            Some(cluster),
        )
        .await?;

        if !self.contains_service(&namespace_id, service_name) {
            return Err(TaroError::NotFound(format!(
                "service not found after creation: {}@{}",
                service_name, namespace_id
            )));
        }
        self.add_instances(&namespace_id, service_name, instance.ephemeral, vec![instance])
            .await
    }

    /// Re-register an existing instance with new attributes.
    pub async fn update_instance(
        &self,
        namespace_id: &str,
        service_name: &str,
        instance: Instance,
    ) -> Result<()> {
        let namespace_id = normalize_namespace(namespace_id);
        let service = self.get_service(&namespace_id, service_name).ok_or_else(|| {
            TaroError::NotFound(format!("service not found: {}@{}", service_name, namespace_id))
        })?;
        if !service.all_ips().iter().any(|i| i.same_endpoint(&instance)) {
            return Err(TaroError::InvalidArgument(format!(
                "instance not found: {}",
                instance.ip_addr()
            )));
        }
        self.add_instances(&namespace_id, service_name, instance.ephemeral, vec![instance])
            .await
    }

    /// Remove one instance. Removing an instance that is already absent
    /// is not an error: the unchanged list is still written, which
    /// refreshes the service on every peer.
    pub async fn deregister_instance(
        &self,
        namespace_id: &str,
        service_name: &str,
        instance: Instance,
    ) -> Result<()> {
        let namespace_id = normalize_namespace(namespace_id);
        if !self.contains_service(&namespace_id, service_name) {
            return Err(TaroError::NotFound(format!(
                "service not found: {}@{}",
                service_name, namespace_id
            )));
        }
        self.remove_instances(&namespace_id, service_name, instance.ephemeral, vec![instance])
            .await
    }

    /// Merge-and-put under the per-service lock.
    pub async fn add_instances(
        &self,
        namespace_id: &str,
        service_name: &str,
        ephemeral: bool,
        instances: Vec<Instance>,
    ) -> Result<()> {
        self.apply_instance_op(namespace_id, service_name, ephemeral, Action::Add, instances)
            .await
    }

    pub async fn remove_instances(
        &self,
        namespace_id: &str,
        service_name: &str,
        ephemeral: bool,
        instances: Vec<Instance>,
    ) -> Result<()> {
        self.apply_instance_op(
            namespace_id,
            service_name,
            ephemeral,
            Action::Remove,
            instances,
        )
        .await
    }

    async fn apply_instance_op(
        &self,
        namespace_id: &str,
        service_name: &str,
        ephemeral: bool,
        action: Action,
        instances: Vec<Instance>,
    ) -> Result<()> {
        let service = self.get_service(namespace_id, service_name).ok_or_else(|| {
            TaroError::NotFound(format!("service not found: {}@{}", service_name, namespace_id))
        })?;

        let _guard = service.op_lock().lock().await;
        let merged = merger::merge(
            &service,
            &*self.consistency,
            action,
            ephemeral,
            instances,
            self.switch.snowflake_instance_ids(),
        )
        .await?;

        self.consistency
            .put(
                &key::build_instance_list_key(namespace_id, service_name, ephemeral),
                record_value(&Instances {
                    instance_list: merged,
                })?,
            )
            .await
    }

    /// Store the service, initialize it, and wire its instance-list
    /// listeners. Idempotent: re-invocation overwrites.
    pub async fn put_service_and_init(&self, service: Arc<Service>) -> Result<()> {
        {
            let _guard = self.put_service_lock.lock().await;
            self.service_map
                .entry(service.namespace_id.clone())
                .or_default()
                .insert(service.name.clone(), service.clone());
        }
        service.init(&*self.health);
        self.register_instance_listeners(&service).await
    }

    async fn register_instance_listeners(&self, service: &Arc<Service>) -> Result<()> {
        let lkey = listener_key(&service.namespace_id, &service.name);
        let ephemeral_key = key::build_instance_list_key(&service.namespace_id, &service.name, true);
        let persistent_key =
            key::build_instance_list_key(&service.namespace_id, &service.name, false);

        if let Some((_, stale)) = self.listeners.remove(&lkey) {
            self.consistency.unlisten(&ephemeral_key, &stale).await?;
            self.consistency.unlisten(&persistent_key, &stale).await?;
        }

        let listener: Arc<dyn RecordListener> = Arc::new(InstanceListListener {
            namespace_id: service.namespace_id.clone(),
            service_name: service.name.clone(),
            service: Arc::downgrade(service),
            push: self.push.clone(),
        });
        self.listeners.insert(lkey, listener.clone());
        self.consistency.listen(&ephemeral_key, listener.clone()).await?;
        self.consistency.listen(&persistent_key, listener).await
    }

    /// Request removal of a service; teardown happens when the meta-key
    /// delete notifies back.
    pub async fn easy_remove_service(&self, namespace_id: &str, service_name: &str) -> Result<()> {
        let namespace_id = normalize_namespace(namespace_id);
        if !self.contains_service(&namespace_id, service_name) {
            return Err(TaroError::NotFound(format!(
                "service not found: {}@{}",
                service_name, namespace_id
            )));
        }
        self.consistency
            .remove(&key::build_service_meta_key(&namespace_id, service_name))
            .await
    }

    async fn handle_meta_change(&self, record: ServiceRecord) -> Result<()> {
        let namespace_id = normalize_namespace(&record.namespace_id);
        match self.get_service(&namespace_id, &record.name) {
            Some(service) => {
                service.update(&record);
                // Recover from an accidental unlisten; harmless when the
                // listeners are still in place.
                self.register_instance_listeners(&service).await
            }
            None => {
                let mut record = record;
                record.namespace_id = namespace_id;
                self.put_service_and_init(Arc::new(Service::from_record(&record)))
                    .await
            }
        }
    }

    async fn handle_meta_delete(&self, key: &str) -> Result<()> {
        let Some((namespace_id, service_name)) = key::parse_service_meta_key(key) else {
            return Err(TaroError::InvalidArgument(format!(
                "unparsable service meta key: {}",
                key
            )));
        };

        let removed = self
            .service_map
            .get(&namespace_id)
            .and_then(|inner| inner.remove(&service_name))
            .map(|(_, service)| service);
        let Some(service) = removed else {
            return Ok(());
        };

        info!("removing service {}@{}", service_name, namespace_id);
        service.destroy(&*self.health);

        let ephemeral_key = key::build_instance_list_key(&namespace_id, &service_name, true);
        let persistent_key = key::build_instance_list_key(&namespace_id, &service_name, false);
        if let Some((_, listener)) = self.listeners.remove(&listener_key(&namespace_id, &service_name))
        {
            self.consistency.unlisten(&ephemeral_key, &listener).await?;
            self.consistency.unlisten(&persistent_key, &listener).await?;
        }
        self.consistency.remove(&ephemeral_key).await?;
        self.consistency.remove(&persistent_key).await
    }
}

/// The registry listens on the whole service-meta key family.
#[async_trait::async_trait]
impl RecordListener for ServiceRegistry {
    fn interests(&self, key: &str) -> bool {
        key::match_service_meta_key(key) && !key::match_switch_key(key)
    }

    fn match_unlisten_key(&self, key: &str) -> bool {
        self.interests(key)
    }

    async fn on_change(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        let record: ServiceRecord = serde_json::from_value(value.clone())
            .map_err(|e| anyhow::anyhow!("malformed service record under {}: {}", key, e))?;
        self.handle_meta_change(record)
            .await
            .map_err(|e| anyhow::anyhow!("meta change for {} failed: {}", key, e))
    }

    async fn on_delete(&self, key: &str) -> anyhow::Result<()> {
        self.handle_meta_delete(key)
            .await
            .map_err(|e| anyhow::anyhow!("meta delete for {} failed: {}", key, e))
    }
}

/// Per-service listener for both instance-list keys. Holds the service
/// weakly: destroying the service breaks the listener-as-entity cycle.
struct InstanceListListener {
    namespace_id: String,
    service_name: String,
    service: Weak<Service>,
    push: Arc<dyn PushService>,
}

#[async_trait::async_trait]
impl RecordListener for InstanceListListener {
    fn interests(&self, key: &str) -> bool {
        match key::parse_instance_list_key(key) {
            Some((namespace_id, service_name, _)) => {
                namespace_id == self.namespace_id && service_name == self.service_name
            }
            None => false,
        }
    }

    fn match_unlisten_key(&self, key: &str) -> bool {
        self.interests(key)
    }

    async fn on_change(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()> {
        let Some(service) = self.service.upgrade() else {
            return Ok(());
        };
        // A malformed list (e.g. a null entry) aborts the callback and
        // leaves the previous instance set in place.
        let instances: Instances = serde_json::from_value(value.clone()).map_err(|e| {
            anyhow::Error::new(TaroError::Fatal(format!(
                "malformed instance list under {}: {}",
                key, e
            )))
        })?;
        let ephemeral = key::match_ephemeral_instance_list_key(key);
        service.on_instance_change(instances.instance_list, ephemeral, &*self.push);
        Ok(())
    }

    async fn on_delete(&self, key: &str) -> anyhow::Result<()> {
        if let Some(service) = self.service.upgrade() {
            let ephemeral = key::match_ephemeral_instance_list_key(key);
            service.update_ips(Vec::new(), ephemeral);
            service.recalculate_checksum();
        }
        Ok(())
    }
}

fn record_value<T: serde::Serialize>(record: &T) -> Result<serde_json::Value> {
    serde_json::to_value(record).map_err(|e| {
        error!("record serialization failed: {}", e);
        TaroError::ConsistencyFailure(format!("record serialization failed: {}", e))
    })
}
