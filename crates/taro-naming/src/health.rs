//! Health-check scheduling contract.
//!
//! The scheduler that sweeps ephemeral heartbeats and probes persistent
//! instances lives outside this crate. The registry hands it a beat
//! sweep task per service on `init`, cancels it on `destroy`, and
//! submits a beat processor for every inbound client heartbeat.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{DEFAULT_CLUSTER, now_millis};
use crate::push::PushService;
use crate::service::Service;

/// One inbound client heartbeat.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientBeat {
    pub ip: String,
    pub port: i32,
    pub cluster: String,
}

impl Default for ClientBeat {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: 0,
            cluster: DEFAULT_CLUSTER.to_string(),
        }
    }
}

impl ClientBeat {
    pub fn ip_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Periodic sweep of a service's ephemeral beat timestamps. The service
/// is held weakly so a destroyed service cannot be kept alive by a
/// still-scheduled task.
pub struct ClientBeatCheckTask {
    service: Weak<Service>,
    task_key: String,
}

impl ClientBeatCheckTask {
    pub fn new(service: &Arc<Service>) -> Self {
        Self {
            service: Arc::downgrade(service),
            task_key: Self::key_of(&service.namespace_id, &service.name),
        }
    }

    pub fn key_of(namespace_id: &str, service_name: &str) -> String {
        format!("beat-check##{}##{}", namespace_id, service_name)
    }

    pub fn task_key(&self) -> &str {
        &self.task_key
    }

    pub fn service(&self) -> Option<Arc<Service>> {
        self.service.upgrade()
    }
}

/// Applies one client beat to its service.
pub struct ClientBeatProcessor {
    service: Weak<Service>,
    beat: ClientBeat,
    push: Arc<dyn PushService>,
}

impl ClientBeatProcessor {
    pub fn new(service: &Arc<Service>, beat: ClientBeat, push: Arc<dyn PushService>) -> Self {
        Self {
            service: Arc::downgrade(service),
            beat,
            push,
        }
    }

    /// Refresh the instance's beat; a revived instance triggers a push.
    pub fn run(&self) {
        let Some(service) = self.service.upgrade() else {
            return;
        };
        let Some(cluster) = service.cluster(&self.beat.cluster) else {
            return;
        };
        if cluster.record_beat(&self.beat.ip_addr(), now_millis()) {
            service.recalculate_checksum();
            self.push.service_changed(&service);
        }
    }
}

/// External health-check scheduler contract.
pub trait HealthScheduler: Send + Sync {
    /// Register the periodic beat sweep for a service.
    fn schedule_check(&self, task: ClientBeatCheckTask);

    /// Cancel a previously scheduled sweep.
    fn cancel_check(&self, task_key: &str);

    /// Run a beat processor as soon as possible.
    fn schedule_now(&self, processor: ClientBeatProcessor);
}

/// Default scheduler: beats apply inline, sweeps are not scheduled.
pub struct DirectHealthScheduler;

impl HealthScheduler for DirectHealthScheduler {
    fn schedule_check(&self, task: ClientBeatCheckTask) {
        debug!("beat sweep requested for {}", task.task_key());
    }

    fn cancel_check(&self, task_key: &str) {
        debug!("beat sweep cancelled for {}", task_key);
    }

    fn schedule_now(&self, processor: ClientBeatProcessor) {
        processor.run();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_beat_defaults() {
        let beat = ClientBeat::default();
        assert_eq!(beat.cluster, "DEFAULT");
        assert_eq!(beat.port, 0);
    }

    #[test]
    fn test_client_beat_deserialize() {
        let beat: ClientBeat =
            serde_json::from_str(r#"{"ip":"10.0.0.1","port":8080,"cluster":"edge"}"#).unwrap();
        assert_eq!(beat.ip_addr(), "10.0.0.1:8080");
        assert_eq!(beat.cluster, "edge");
    }

    #[test]
    fn test_task_key_shape() {
        assert_eq!(
            ClientBeatCheckTask::key_of("public", "DEFAULT_GROUP::svc"),
            "beat-check##public##DEFAULT_GROUP::svc"
        );
    }

    #[test]
    fn test_beat_revives_instance_through_scheduler() {
        use crate::push::LogPushService;

        let service = Arc::new(Service::new("public", "DEFAULT_GROUP::svc"));
        let mut instance = crate::model::Instance::new("10.0.0.1", 8080);
        instance.healthy = false;
        service.update_ips(vec![instance], true);

        let beat = ClientBeat {
            ip: "10.0.0.1".to_string(),
            port: 8080,
            cluster: DEFAULT_CLUSTER.to_string(),
        };
        service.process_client_beat(beat, &DirectHealthScheduler, Arc::new(LogPushService));

        assert!(service.get_instance("10.0.0.1:8080").unwrap().healthy);
    }

    #[test]
    fn test_check_task_drops_with_service() {
        let service = Arc::new(Service::new("public", "DEFAULT_GROUP::svc"));
        let task = ClientBeatCheckTask::new(&service);
        assert!(task.service().is_some());
        drop(service);
        assert!(task.service().is_none());
    }
}
