//! Persistence adapter: the node's only door to the backing store.
//!
//! Every operation is gated by a readiness flag and never fails outward:
//! errors are logged and turned into sentinels (`false`, `None`, empty
//! list). A connectivity error also clears the flag, and the node keeps
//! working on local state until [`PersistenceAdapter::connect`] succeeds
//! again.
//!
//! Subscriptions are single-consumer: each channel has at most one handler,
//! and subscribing again atomically swaps it. One pump task per channel reads
//! the backend subscription and awaits the current handler for each message,
//! so messages on a channel are handled strictly in delivery order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use board_core::{decode_actions, encode_actions, Action};
use futures_util::future::BoxFuture;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::metrics::Metrics;
use crate::store::{Backend, StoreError, Subscription};

/// Handler for messages on one channel.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

type HandlerTable = Arc<RwLock<HashMap<String, MessageHandler>>>;

pub struct PersistenceAdapter {
    backend: Arc<dyn Backend>,
    ready: AtomicBool,
    handlers: HandlerTable,
    pumps: Mutex<HashMap<String, JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

impl PersistenceAdapter {
    pub fn new(backend: Arc<dyn Backend>, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            ready: AtomicBool::new(false),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pumps: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Connect (or reconnect) to the backend. Idempotent; returns readiness.
    ///
    /// On success, channels with a registered handler but no live pump are
    /// subscribed. A channel that fails to subscribe leaves the adapter not
    /// ready, so the next call retries it.
    pub async fn connect(&self) -> bool {
        if self.is_ready() {
            return true;
        }

        match self.backend.connect().await {
            Ok(()) => {
                self.set_ready(true);
                log::info!("Backing store connected");
                let channels: Vec<String> = self
                    .handlers
                    .read()
                    .map(|h| h.keys().cloned().collect())
                    .unwrap_or_default();
                for channel in channels {
                    self.ensure_pump(&channel).await;
                }
                self.is_ready()
            }
            Err(e) => {
                self.set_ready(false);
                log::warn!("Backing store unavailable, running local-only: {e}");
                false
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && self.backend.is_connected()
    }

    /// Retry [`connect`](Self::connect) every `interval` while not ready.
    pub fn spawn_reconnect(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let adapter = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(adapter) = adapter.upgrade() else {
                    break;
                };
                if !adapter.is_ready() && adapter.connect().await {
                    log::info!("Backing store reconnected");
                }
            }
        })
    }

    // ─── Key-value ────────────────────────────────────────────────────

    pub async fn get(&self, key: &str) -> Option<String> {
        if !self.usable() {
            return None;
        }
        match self.backend.get(key).await {
            Ok(value) => value,
            Err(e) => {
                self.absorb("get", key, e);
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> bool {
        if !self.usable() {
            return false;
        }
        match self.backend.set(key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                self.absorb("set", key, e);
                false
            }
        }
    }

    /// Returns whether the delete was carried out (not whether the key existed).
    pub async fn delete(&self, key: &str) -> bool {
        if !self.usable() {
            return false;
        }
        match self.backend.delete(key).await {
            Ok(_) => true,
            Err(e) => {
                self.absorb("delete", key, e);
                false
            }
        }
    }

    // ─── Lists ────────────────────────────────────────────────────────

    pub async fn push(&self, key: &str, item: &str) -> bool {
        if !self.usable() {
            return false;
        }
        match self.backend.push(key, item).await {
            Ok(_) => true,
            Err(e) => {
                self.absorb("push", key, e);
                false
            }
        }
    }

    pub async fn get_all(&self, key: &str) -> Vec<String> {
        if !self.usable() {
            return Vec::new();
        }
        match self.backend.get_all(key).await {
            Ok(items) => items,
            Err(e) => {
                self.absorb("get_all", key, e);
                Vec::new()
            }
        }
    }

    /// Delete the list, then write `items`. Not atomic: a failure between
    /// the two steps leaves the list empty.
    pub async fn replace(&self, key: &str, items: &[String]) -> bool {
        if !self.delete(key).await {
            return false;
        }
        if items.is_empty() {
            return true;
        }
        match self.backend.push_all(key, items).await {
            Ok(_) => true,
            Err(e) => {
                self.absorb("replace", key, e);
                false
            }
        }
    }

    pub async fn push_action(&self, key: &str, action: &Action) -> bool {
        match action.to_json() {
            Ok(raw) => self.push(key, &raw).await,
            Err(e) => {
                log::warn!("Not persisting unserializable action to {key}: {e}");
                false
            }
        }
    }

    /// Stored actions; malformed items are dropped.
    pub async fn get_actions(&self, key: &str) -> Vec<Action> {
        decode_actions(&self.get_all(key).await)
    }

    pub async fn replace_actions(&self, key: &str, actions: &[Action]) -> bool {
        self.replace(key, &encode_actions(actions)).await
    }

    // ─── Pub/sub ──────────────────────────────────────────────────────

    pub async fn publish(&self, channel: &str, message: &str) -> bool {
        if !self.usable() {
            return false;
        }
        match self.backend.publish(channel, message).await {
            Ok(receivers) => {
                self.metrics.record_publish();
                log::trace!("Published to {channel} ({receivers} receivers)");
                true
            }
            Err(e) => {
                self.absorb("publish", channel, e);
                false
            }
        }
    }

    /// Register `handler` as the single consumer of `channel`, replacing any
    /// earlier one. Returns whether the backend subscription is live; when the
    /// store is unavailable the handler is kept and attached on the next
    /// successful [`connect`](Self::connect).
    pub async fn subscribe(&self, channel: &str, handler: MessageHandler) -> bool {
        let replaced = match self.handlers.write() {
            Ok(mut handlers) => handlers.insert(channel.to_string(), handler).is_some(),
            Err(_) => {
                log::error!("Handler table poisoned; cannot subscribe to {channel}");
                return false;
            }
        };
        if replaced {
            log::debug!("Replaced handler for channel {channel}");
        }

        if !self.usable() {
            return false;
        }
        self.ensure_pump(channel).await
    }

    /// Drop the handler for `channel`, stop its pump and release the
    /// backend subscription.
    pub async fn unsubscribe(&self, channel: &str) {
        if let Ok(mut handlers) = self.handlers.write() {
            handlers.remove(channel);
        }
        if let Some(pump) = self.pumps.lock().await.remove(channel) {
            pump.abort();
        }
        if !self.usable() {
            return;
        }
        if let Err(e) = self.backend.unsubscribe(channel).await {
            self.absorb("unsubscribe", channel, e);
        }
    }

    async fn ensure_pump(&self, channel: &str) -> bool {
        let mut pumps = self.pumps.lock().await;
        if pumps.get(channel).is_some_and(|p| !p.is_finished()) {
            return true;
        }
        match self.backend.subscribe(channel).await {
            Ok(subscription) => {
                let pump = tokio::spawn(run_pump(channel.to_string(), subscription, self.handlers.clone()));
                pumps.insert(channel.to_string(), pump);
                log::debug!("Subscribed to channel {channel}");
                true
            }
            Err(e) => {
                self.absorb("subscribe", channel, e);
                self.set_ready(false);
                false
            }
        }
    }

    fn usable(&self) -> bool {
        if !self.ready.load(Ordering::SeqCst) {
            return false;
        }
        if self.backend.is_connected() {
            return true;
        }
        log::warn!("Backing store connection lost, running local-only");
        self.set_ready(false);
        false
    }

    fn absorb(&self, op: &str, key: &str, err: StoreError) {
        log::warn!("Store {op} on {key} failed: {err}");
        if err.is_connectivity() {
            self.set_ready(false);
        }
    }

    fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
        self.metrics.set_store_connected(ready);
    }
}

impl Drop for PersistenceAdapter {
    fn drop(&mut self) {
        if let Ok(pumps) = self.pumps.try_lock() {
            for pump in pumps.values() {
                pump.abort();
            }
        }
    }
}

/// Deliver messages from one subscription to the channel's current handler.
async fn run_pump(channel: String, mut subscription: Subscription, handlers: HandlerTable) {
    loop {
        match subscription.recv().await {
            Ok(message) => {
                let handler = handlers.read().ok().and_then(|h| h.get(&channel).cloned());
                match handler {
                    Some(handler) => handler(message).await,
                    None => log::trace!("No handler for message on {channel}"),
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                log::warn!("Subscription to {channel} lagged, {n} messages lost");
            }
            Err(broadcast::error::RecvError::Closed) => {
                log::debug!("Subscription to {channel} closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;
    use std::sync::atomic::AtomicUsize;

    fn adapter_with(backend: MemoryBackend) -> PersistenceAdapter {
        PersistenceAdapter::new(Arc::new(backend), Arc::new(Metrics::new()))
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> MessageHandler {
        Arc::new(move |_msg: String| -> BoxFuture<'static, ()> {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_sentinels_before_connect() {
        let adapter = adapter_with(MemoryBackend::new());
        assert!(!adapter.is_ready());
        assert_eq!(adapter.get("k").await, None);
        assert!(!adapter.set("k", "v", None).await);
        assert!(!adapter.push("l", "x").await);
        assert!(adapter.get_all("l").await.is_empty());
        assert!(!adapter.publish("ch", "m").await);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let adapter = adapter_with(MemoryBackend::new());
        assert!(adapter.connect().await);
        assert!(adapter.connect().await);
        assert!(adapter.is_ready());
    }

    #[tokio::test]
    async fn test_connect_failure_is_absorbed() {
        let backend = MemoryBackend::new();
        backend.set_available(false);
        let adapter = adapter_with(backend.clone());
        assert!(!adapter.connect().await);
        assert!(!adapter.is_ready());

        backend.set_available(true);
        assert!(adapter.connect().await);
    }

    #[tokio::test]
    async fn test_outage_flips_readiness() {
        let backend = MemoryBackend::new();
        let adapter = adapter_with(backend.clone());
        adapter.connect().await;
        assert!(adapter.push("l", "a").await);

        backend.set_available(false);
        assert!(!adapter.push("l", "b").await);
        assert!(!adapter.is_ready());
        assert!(adapter.get_all("l").await.is_empty());
    }

    #[tokio::test]
    async fn test_replace_rewrites_list() {
        let adapter = adapter_with(MemoryBackend::new());
        adapter.connect().await;
        adapter.push("l", "old-1").await;
        adapter.push("l", "old-2").await;

        assert!(adapter.replace("l", &["new".to_string()]).await);
        assert_eq!(adapter.get_all("l").await, vec!["new"]);

        assert!(adapter.replace("l", &[]).await);
        assert!(adapter.get_all("l").await.is_empty());
    }

    #[tokio::test]
    async fn test_later_subscribe_replaces_handler() {
        let backend = MemoryBackend::new();
        let adapter = adapter_with(backend.clone());
        adapter.connect().await;

        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        assert!(adapter.subscribe("ch", counting_handler(first.clone())).await);
        assert!(adapter.subscribe("ch", counting_handler(second.clone())).await);

        adapter.publish("ch", "one").await;
        adapter.publish("ch", "two").await;
        settle().await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        // One backend subscription regardless of how many handlers were set
        assert_eq!(backend.publish("ch", "three").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_before_connect_attaches_later() {
        let adapter = adapter_with(MemoryBackend::new());
        let count = Arc::new(AtomicUsize::new(0));
        assert!(!adapter.subscribe("ch", counting_handler(count.clone())).await);

        adapter.connect().await;
        adapter.publish("ch", "hello").await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let backend = MemoryBackend::new();
        let adapter = adapter_with(backend.clone());
        adapter.connect().await;
        let count = Arc::new(AtomicUsize::new(0));
        adapter.subscribe("ch", counting_handler(count.clone())).await;
        adapter.unsubscribe("ch").await;

        adapter.publish("ch", "ignored").await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(backend.publish("ch", "after").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_action_helpers_skip_malformed() {
        let adapter = adapter_with(MemoryBackend::new());
        adapter.connect().await;
        let action = Action::new(board_core::Tool::Pen, "alice");
        assert!(adapter.push_action("l", &action).await);
        adapter.push("l", "garbage").await;

        assert_eq!(adapter.get_actions("l").await, vec![action]);
    }
}
