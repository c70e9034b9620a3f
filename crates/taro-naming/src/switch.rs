//! Runtime switches for the naming core.
//!
//! `NamingConfig` is the startup configuration surface; `SwitchDomain`
//! is its live counterpart, readable by running workers so cadences can
//! be adjusted without a restart.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Instance-id generator producing `ip#port#cluster#service`.
pub const SIMPLE_INSTANCE_ID_GENERATOR: &str = "simple";
/// Instance-id generator producing the smallest unused integer.
pub const SNOWFLAKE_INSTANCE_ID_GENERATOR: &str = "snowflake";

/// Startup configuration, deserializable from the server's property set.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingConfig {
    #[serde(rename = "nacos.naming.empty-service.auto-clean")]
    pub empty_service_auto_clean: bool,
    #[serde(rename = "nacos.naming.empty-service.clean.initial-delay-ms")]
    pub empty_service_clean_initial_delay_ms: i64,
    #[serde(rename = "nacos.naming.empty-service.clean.period-time-ms")]
    pub empty_service_clean_period_ms: i64,
    #[serde(rename = "serviceStatusSynchronizationPeriodMillis")]
    pub service_status_synchronization_period_millis: i64,
    #[serde(rename = "instanceIdGenerator")]
    pub instance_id_generator: String,
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            empty_service_auto_clean: false,
            empty_service_clean_initial_delay_ms: 60_000,
            empty_service_clean_period_ms: 20_000,
            service_status_synchronization_period_millis: 60_000,
            instance_id_generator: SIMPLE_INSTANCE_ID_GENERATOR.to_string(),
        }
    }
}

/// Live switch state shared by the registry and its workers.
pub struct SwitchDomain {
    service_status_synchronization_period_millis: AtomicI64,
    empty_service_auto_clean: AtomicBool,
    empty_service_clean_initial_delay_ms: AtomicI64,
    empty_service_clean_period_ms: AtomicI64,
    instance_id_generator: RwLock<String>,
}

impl SwitchDomain {
    pub fn new(config: &NamingConfig) -> Self {
        Self {
            service_status_synchronization_period_millis: AtomicI64::new(
                config.service_status_synchronization_period_millis,
            ),
            empty_service_auto_clean: AtomicBool::new(config.empty_service_auto_clean),
            empty_service_clean_initial_delay_ms: AtomicI64::new(
                config.empty_service_clean_initial_delay_ms,
            ),
            empty_service_clean_period_ms: AtomicI64::new(config.empty_service_clean_period_ms),
            instance_id_generator: RwLock::new(config.instance_id_generator.clone()),
        }
    }

    pub fn service_status_synchronization_period_millis(&self) -> i64 {
        self.service_status_synchronization_period_millis
            .load(Ordering::SeqCst)
    }

    pub fn set_service_status_synchronization_period_millis(&self, millis: i64) {
        self.service_status_synchronization_period_millis
            .store(millis, Ordering::SeqCst);
    }

    pub fn empty_service_auto_clean(&self) -> bool {
        self.empty_service_auto_clean.load(Ordering::SeqCst)
    }

    pub fn set_empty_service_auto_clean(&self, enabled: bool) {
        self.empty_service_auto_clean.store(enabled, Ordering::SeqCst);
    }

    pub fn empty_service_clean_initial_delay_ms(&self) -> i64 {
        self.empty_service_clean_initial_delay_ms.load(Ordering::SeqCst)
    }

    pub fn empty_service_clean_period_ms(&self) -> i64 {
        self.empty_service_clean_period_ms.load(Ordering::SeqCst)
    }

    pub fn set_empty_service_clean_period_ms(&self, millis: i64) {
        self.empty_service_clean_period_ms.store(millis, Ordering::SeqCst);
    }

    pub fn snowflake_instance_ids(&self) -> bool {
        *self.instance_id_generator.read() == SNOWFLAKE_INSTANCE_ID_GENERATOR
    }

    pub fn set_instance_id_generator(&self, generator: &str) {
        *self.instance_id_generator.write() = generator.to_string();
    }
}

impl Default for SwitchDomain {
    fn default() -> Self {
        Self::new(&NamingConfig::default())
    }
}
