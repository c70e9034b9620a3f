//! Consistency service and listener contracts.

use std::sync::Arc;

use taro_common::Result;

use crate::model::Datum;

/// Listener for asynchronous record change notifications.
///
/// Callbacks run on the notifier task; an error aborts the callback for
/// that key only and must leave prior state in place.
#[async_trait::async_trait]
pub trait RecordListener: Send + Sync {
    /// Whether this listener wants notifications for `key`.
    fn interests(&self, key: &str) -> bool;

    /// Whether an unlisten on `key` should detach this listener.
    fn match_unlisten_key(&self, key: &str) -> bool;

    async fn on_change(&self, key: &str, value: &serde_json::Value) -> anyhow::Result<()>;

    async fn on_delete(&self, key: &str) -> anyhow::Result<()>;
}

/// Replication delegate for the registry.
#[async_trait::async_trait]
pub trait ConsistencyService: Send + Sync {
    /// Store `value` under `key` and notify interested listeners.
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()>;

    /// Fetch the current record for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Datum>>;

    /// Remove the record for `key` and notify interested listeners.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Register `listener` under `key`. Idempotent for the same pair.
    async fn listen(&self, key: &str, listener: Arc<dyn RecordListener>) -> Result<()>;

    /// Deregister `listener` from `key`.
    async fn unlisten(&self, key: &str, listener: &Arc<dyn RecordListener>) -> Result<()>;
}
