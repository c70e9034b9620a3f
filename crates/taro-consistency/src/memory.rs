//! In-memory AP consistency store.
//!
//! Keeps records in a concurrent map and delivers listener callbacks from
//! a dedicated notifier task fed by a channel, so a `put` never reenters
//! its caller. One misbehaving listener cannot silence later
//! notifications: callback errors are logged per listener and dropped.

use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use taro_common::{Result, TaroError};

use crate::model::Datum;
use crate::service::{ConsistencyService, RecordListener};

enum NotifyEvent {
    Change(String),
    Delete(String),
    /// Test barrier: resolves once every prior event has been dispatched.
    Flush(oneshot::Sender<()>),
}

/// In-memory implementation of [`ConsistencyService`].
///
/// Must be created inside a tokio runtime; the notifier task lives until
/// the store is dropped.
pub struct InMemoryConsistencyService {
    data: Arc<DashMap<String, Datum>>,
    listeners: Arc<DashMap<String, Vec<Arc<dyn RecordListener>>>>,
    version: AtomicI64,
    tx: mpsc::UnboundedSender<NotifyEvent>,
}

impl InMemoryConsistencyService {
    pub fn new() -> Self {
        let data: Arc<DashMap<String, Datum>> = Arc::new(DashMap::new());
        let listeners: Arc<DashMap<String, Vec<Arc<dyn RecordListener>>>> =
            Arc::new(DashMap::new());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::notifier_loop(data.clone(), listeners.clone(), rx));

        Self {
            data,
            listeners,
            version: AtomicI64::new(0),
            tx,
        }
    }

    /// Wait until every notification enqueued before this call has been
    /// dispatched. Intended for tests.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(NotifyEvent::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    async fn notifier_loop(
        data: Arc<DashMap<String, Datum>>,
        listeners: Arc<DashMap<String, Vec<Arc<dyn RecordListener>>>>,
        mut rx: mpsc::UnboundedReceiver<NotifyEvent>,
    ) {
        while let Some(event) = rx.recv().await {
            match event {
                NotifyEvent::Change(key) => {
                    // Read the latest value; a burst of puts coalesces.
                    let Some(value) = data.get(&key).map(|d| d.value.clone()) else {
                        continue;
                    };
                    // Snapshot before dispatch: callbacks may listen or
                    // unlisten, which mutates the listener table.
                    for listener in Self::interested(&listeners, &key) {
                        if let Err(e) = listener.on_change(&key, &value).await {
                            warn!("listener failed on change of {}: {}", key, e);
                        }
                    }
                }
                NotifyEvent::Delete(key) => {
                    for listener in Self::interested(&listeners, &key) {
                        if let Err(e) = listener.on_delete(&key).await {
                            warn!("listener failed on delete of {}: {}", key, e);
                        }
                    }
                }
                NotifyEvent::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
        debug!("consistency notifier stopped");
    }

    fn interested(
        listeners: &DashMap<String, Vec<Arc<dyn RecordListener>>>,
        key: &str,
    ) -> Vec<Arc<dyn RecordListener>> {
        listeners
            .iter()
            .flat_map(|entry| entry.value().clone())
            .filter(|listener| listener.interests(key))
            .collect()
    }

    fn publish(&self, event: NotifyEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| TaroError::ConsistencyFailure("notifier is gone".to_string()))
    }
}

#[async_trait::async_trait]
impl ConsistencyService for InMemoryConsistencyService {
    async fn put(&self, key: &str, value: serde_json::Value) -> Result<()> {
        let timestamp = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.data
            .insert(key.to_string(), Datum::new(key.to_string(), value, timestamp));
        self.publish(NotifyEvent::Change(key.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<Datum>> {
        Ok(self.data.get(key).map(|d| d.clone()))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.data.remove(key);
        self.publish(NotifyEvent::Delete(key.to_string()))
    }

    async fn listen(&self, key: &str, listener: Arc<dyn RecordListener>) -> Result<()> {
        let mut entry = self.listeners.entry(key.to_string()).or_default();
        if !entry.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            entry.push(listener);
        }
        Ok(())
    }

    async fn unlisten(&self, key: &str, listener: &Arc<dyn RecordListener>) -> Result<()> {
        if let Some(mut entry) = self.listeners.get_mut(key) {
            entry.retain(|l| !(Arc::ptr_eq(l, listener) && l.match_unlisten_key(key)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener {
        prefix: String,
        changes: AtomicUsize,
        deletes: AtomicUsize,
        fail: bool,
    }

    impl CountingListener {
        fn new(prefix: &str) -> Arc<Self> {
            Arc::new(Self {
                prefix: prefix.to_string(),
                changes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing(prefix: &str) -> Arc<Self> {
            Arc::new(Self {
                prefix: prefix.to_string(),
                changes: AtomicUsize::new(0),
                deletes: AtomicUsize::new(0),
                fail: true,
            })
        }
    }

    #[async_trait::async_trait]
    impl RecordListener for CountingListener {
        fn interests(&self, key: &str) -> bool {
            key.starts_with(&self.prefix)
        }

        fn match_unlisten_key(&self, key: &str) -> bool {
            key.starts_with(&self.prefix)
        }

        async fn on_change(&self, _key: &str, _value: &serde_json::Value) -> anyhow::Result<()> {
            self.changes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("boom");
            }
            Ok(())
        }

        async fn on_delete(&self, _key: &str) -> anyhow::Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_put_notifies_interested_listener() {
        let store = InMemoryConsistencyService::new();
        let listener = CountingListener::new("ns.a");
        store
            .listen("ns.a", listener.clone() as Arc<dyn RecordListener>)
            .await
            .unwrap();

        store.put("ns.a.key", serde_json::json!(1)).await.unwrap();
        store.put("ns.b.key", serde_json::json!(2)).await.unwrap();
        store.flush().await;

        assert_eq!(listener.changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_returns_latest_datum() {
        let store = InMemoryConsistencyService::new();
        store.put("k", serde_json::json!("v1")).await.unwrap();
        store.put("k", serde_json::json!("v2")).await.unwrap();

        let datum = store.get("k").await.unwrap().unwrap();
        assert_eq!(datum.value, serde_json::json!("v2"));
        assert_eq!(datum.timestamp, 2);
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remove_notifies_delete() {
        let store = InMemoryConsistencyService::new();
        let listener = CountingListener::new("k");
        store
            .listen("k", listener.clone() as Arc<dyn RecordListener>)
            .await
            .unwrap();

        store.put("k", serde_json::json!(1)).await.unwrap();
        store.remove("k").await.unwrap();
        store.flush().await;

        assert_eq!(listener.deletes.load(Ordering::SeqCst), 1);
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_block_others() {
        let store = InMemoryConsistencyService::new();
        let bad = CountingListener::failing("k");
        let good = CountingListener::new("k");
        store
            .listen("k", bad.clone() as Arc<dyn RecordListener>)
            .await
            .unwrap();
        store
            .listen("k", good.clone() as Arc<dyn RecordListener>)
            .await
            .unwrap();

        store.put("k", serde_json::json!(1)).await.unwrap();
        store.flush().await;

        assert_eq!(bad.changes.load(Ordering::SeqCst), 1);
        assert_eq!(good.changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unlisten_stops_delivery() {
        let store = InMemoryConsistencyService::new();
        let listener = CountingListener::new("k");
        let as_dyn: Arc<dyn RecordListener> = listener.clone();
        store.listen("k", as_dyn.clone()).await.unwrap();
        store.unlisten("k", &as_dyn).await.unwrap();

        store.put("k", serde_json::json!(1)).await.unwrap();
        store.flush().await;

        assert_eq!(listener.changes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listen_is_idempotent() {
        let store = InMemoryConsistencyService::new();
        let listener = CountingListener::new("k");
        let as_dyn: Arc<dyn RecordListener> = listener.clone();
        store.listen("k", as_dyn.clone()).await.unwrap();
        store.listen("k", as_dyn).await.unwrap();

        store.put("k", serde_json::json!(1)).await.unwrap();
        store.flush().await;

        assert_eq!(listener.changes.load(Ordering::SeqCst), 1);
    }
}
