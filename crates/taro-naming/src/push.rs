//! Change-broadcast contract.
//!
//! The registry fires `service_changed` after a service has absorbed a
//! change; the push server fans the update out to subscribed discovery
//! clients. Delivery is fire-and-forget from the registry's point of
//! view.

use tracing::debug;

use crate::service::Service;

pub trait PushService: Send + Sync {
    fn service_changed(&self, service: &Service);
}

/// Default sink used when no push server is wired in.
pub struct LogPushService;

impl PushService for LogPushService {
    fn service_changed(&self, service: &Service) {
        debug!(
            "service changed: {}@{}, checksum {}",
            service.name,
            service.namespace_id,
            service.checksum()
        );
    }
}
