//! Empty-service reaper.
//!
//! Services that stay empty across consecutive sweeps are removed, but
//! only by the peer that owns them. The grace window exists because an
//! instance can briefly vanish between a heartbeat timeout and its
//! re-registration; deleting immediately would make clients pay the
//! cold-create path over and over.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{info, warn};

use taro_core::DistroMapper;

use crate::registry::ServiceRegistry;
use crate::switch::SwitchDomain;

/// Consecutive empty sweeps a service survives before removal.
pub const MAX_FINALIZE_COUNT: u32 = 3;

pub struct EmptyServiceCleaner {
    registry: Arc<ServiceRegistry>,
    distro: Arc<DistroMapper>,
    switch: Arc<SwitchDomain>,
    running: AtomicBool,
}

impl EmptyServiceCleaner {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        distro: Arc<DistroMapper>,
        switch: Arc<SwitchDomain>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            distro,
            switch,
            running: AtomicBool::new(false),
        })
    }

    /// Spawn the periodic sweep, if enabled by configuration.
    pub fn start(self: &Arc<Self>) {
        if !self.switch.empty_service_auto_clean() {
            info!("empty-service auto clean is disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleaner = self.clone();
        tokio::spawn(async move {
            let initial = cleaner.switch.empty_service_clean_initial_delay_ms().max(0) as u64;
            tokio::time::sleep(Duration::from_millis(initial)).await;
            while cleaner.running.load(Ordering::SeqCst) {
                cleaner.clean_once().await;
                let period = cleaner.switch.empty_service_clean_period_ms().max(100) as u64;
                tokio::time::sleep(Duration::from_millis(period)).await;
            }
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// One sweep over every owned service: empty services age, the ones
    /// past the grace window are removed, non-empty ones reset.
    pub async fn clean_once(&self) {
        for namespace_id in self.registry.get_all_namespaces() {
            for service_name in self.registry.get_all_service_names(&namespace_id) {
                if !self.distro.responsible(&service_name) {
                    continue;
                }
                let Some(service) = self.registry.get_service(&namespace_id, &service_name)
                else {
                    continue;
                };

                if !service.is_empty() {
                    service.reset_finalize_count();
                    continue;
                }

                let count = service.bump_finalize_count();
                if count > MAX_FINALIZE_COUNT {
                    info!(
                        "removing service {}@{}, empty for {} sweeps",
                        service_name, namespace_id, count
                    );
                    if let Err(e) = self
                        .registry
                        .easy_remove_service(&namespace_id, &service_name)
                        .await
                    {
                        warn!(
                            "failed to remove empty service {}@{}: {}",
                            service_name, namespace_id, e
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use taro_consistency::InMemoryConsistencyService;
    use taro_core::{Member, MemberManager};

    use crate::health::DirectHealthScheduler;
    use crate::model::Instance;
    use crate::push::LogPushService;
    use crate::switch::NamingConfig;

    async fn harness() -> (
        Arc<EmptyServiceCleaner>,
        Arc<ServiceRegistry>,
        Arc<InMemoryConsistencyService>,
    ) {
        let consistency = Arc::new(InMemoryConsistencyService::new());
        let switch = Arc::new(SwitchDomain::new(&NamingConfig {
            empty_service_auto_clean: true,
            ..Default::default()
        }));
        let registry = ServiceRegistry::new(
            consistency.clone(),
            Arc::new(LogPushService),
            Arc::new(DirectHealthScheduler),
            switch.clone(),
        );
        registry.init().await.unwrap();

        let members =
            MemberManager::with_local_member(Member::new("10.0.0.1".to_string(), 8848), &[]);
        let distro = DistroMapper::new(members, true);
        let cleaner = EmptyServiceCleaner::new(registry.clone(), distro, switch);
        (cleaner, registry, consistency)
    }

    fn instance(ip: &str) -> Instance {
        let mut inst = Instance::new(ip, 8080);
        inst.service_name = "DEFAULT_GROUP::svc".to_string();
        inst
    }

    #[tokio::test]
    async fn test_empty_service_removed_on_fourth_sweep() {
        let (cleaner, registry, consistency) = harness().await;
        registry
            .create_empty_service_if_absent("public", "DEFAULT_GROUP::svc", false, None)
            .await
            .unwrap();
        consistency.flush().await;
        let service = registry.get_service("public", "DEFAULT_GROUP::svc").unwrap();

        for expected in 1..=MAX_FINALIZE_COUNT {
            cleaner.clean_once().await;
            consistency.flush().await;
            assert_eq!(service.finalize_count(), expected);
            assert!(registry.contains_service("public", "DEFAULT_GROUP::svc"));
        }

        cleaner.clean_once().await;
        consistency.flush().await;
        assert_eq!(service.finalize_count(), MAX_FINALIZE_COUNT + 1);
        assert!(!registry.contains_service("public", "DEFAULT_GROUP::svc"));
    }

    #[tokio::test]
    async fn test_registration_resets_the_clock() {
        let (cleaner, registry, consistency) = harness().await;
        registry
            .create_empty_service_if_absent("public", "DEFAULT_GROUP::svc", true, None)
            .await
            .unwrap();
        consistency.flush().await;
        let service = registry.get_service("public", "DEFAULT_GROUP::svc").unwrap();

        cleaner.clean_once().await;
        cleaner.clean_once().await;
        assert_eq!(service.finalize_count(), 2);

        registry
            .register_instance("public", "DEFAULT_GROUP::svc", instance("10.0.0.9"))
            .await
            .unwrap();
        consistency.flush().await;

        cleaner.clean_once().await;
        consistency.flush().await;
        assert_eq!(service.finalize_count(), 0);
        assert!(registry.contains_service("public", "DEFAULT_GROUP::svc"));
    }

    #[tokio::test]
    async fn test_foreign_services_left_alone() {
        let consistency = Arc::new(InMemoryConsistencyService::new());
        let switch = Arc::new(SwitchDomain::new(&NamingConfig {
            empty_service_auto_clean: true,
            ..Default::default()
        }));
        let registry = ServiceRegistry::new(
            consistency.clone(),
            Arc::new(LogPushService),
            Arc::new(DirectHealthScheduler),
            switch.clone(),
        );
        registry.init().await.unwrap();

        // Two-node cluster: half the names belong to the other peer.
        let members = MemberManager::with_local_member(
            Member::new("10.0.0.1".to_string(), 8848),
            &["10.0.0.2:8848".to_string()],
        );
        let distro = DistroMapper::new(members, true);
        let foreign = (0..1000)
            .map(|i| format!("DEFAULT_GROUP::svc-{}", i))
            .find(|n| !distro.responsible(n))
            .unwrap();
        let cleaner = EmptyServiceCleaner::new(registry.clone(), distro, switch);

        registry
            .create_empty_service_if_absent("public", &foreign, true, None)
            .await
            .unwrap();
        consistency.flush().await;
        let service = registry.get_service("public", &foreign).unwrap();

        for _ in 0..10 {
            cleaner.clean_once().await;
        }
        consistency.flush().await;
        assert_eq!(service.finalize_count(), 0);
        assert!(registry.contains_service("public", &foreign));
    }
}
