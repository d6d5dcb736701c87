//! In-process backing store.
//!
//! Cloning a [`MemoryBackend`] yields another handle onto the same keyspace
//! and channels, so several nodes in one process can share it the way
//! separate processes share the hub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{Backend, StoreError, Subscription};
use crate::broadcast::RoomManager;

const CHANNEL_CAPACITY: usize = 1024;

enum Entry {
    Value {
        value: String,
        expires_at: Option<Instant>,
    },
    List(Vec<String>),
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self, Entry::Value { expires_at: Some(at), .. } if *at <= now)
    }
}

struct MemoryInner {
    entries: Mutex<HashMap<String, Entry>>,
    channels: RoomManager<String>,
    available: AtomicBool,
}

#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                entries: Mutex::new(HashMap::new()),
                channels: RoomManager::new(CHANNEL_CAPACITY),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }

    fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        self.check()?;
        let mut entries = self
            .inner
            .entries
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))?;
        f(&mut entries)
    }
}

fn list_mut<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
) -> Result<&'a mut Vec<String>, StoreError> {
    let now = Instant::now();
    if entries.get(key).is_some_and(|e| e.is_expired(now)) {
        entries.remove(key);
    }
    match entries
        .entry(key.to_string())
        .or_insert_with(|| Entry::List(Vec::new()))
    {
        Entry::List(items) => Ok(items),
        Entry::Value { .. } => Err(StoreError::WrongType(key.to_string())),
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self) -> Result<(), StoreError> {
        self.check()
    }

    fn is_connected(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_entries(|entries| {
            if entries.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
                entries.remove(key);
                return Ok(None);
            }
            match entries.get(key) {
                Some(Entry::Value { value, .. }) => Ok(Some(value.clone())),
                Some(Entry::List(_)) => Err(StoreError::WrongType(key.to_string())),
                None => Ok(None),
            }
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry::Value {
                    value: value.to_string(),
                    expires_at: ttl.map(|t| Instant::now() + t),
                },
            );
            Ok(())
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.with_entries(|entries| Ok(entries.remove(key).is_some()))
    }

    async fn push(&self, key: &str, item: &str) -> Result<usize, StoreError> {
        self.with_entries(|entries| {
            let items = list_mut(entries, key)?;
            items.push(item.to_string());
            Ok(items.len())
        })
    }

    async fn push_all(&self, key: &str, new_items: &[String]) -> Result<usize, StoreError> {
        if new_items.is_empty() {
            return self.get_all(key).await.map(|items| items.len());
        }
        self.with_entries(|entries| {
            let items = list_mut(entries, key)?;
            items.extend_from_slice(new_items);
            Ok(items.len())
        })
    }

    async fn get_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.with_entries(|entries| match entries.get(key) {
            Some(Entry::List(items)) => Ok(items.clone()),
            Some(Entry::Value { .. }) => Err(StoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        self.check()?;
        Ok(self.inner.channels.send(channel, message.to_string()).await)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.check()?;
        Ok(self.inner.channels.get_or_create(channel).await.subscribe())
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.channels.remove_if_empty(channel).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_values_and_ttl() {
        let store = MemoryBackend::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        store.set("short", "x", Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("short").await.unwrap(), None);

        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_lists_keep_order() {
        let store = MemoryBackend::new();
        assert_eq!(store.push("l", "a").await.unwrap(), 1);
        assert_eq!(store.push_all("l", &["b".into(), "c".into()]).await.unwrap(), 3);
        assert_eq!(store.get_all("l").await.unwrap(), vec!["a", "b", "c"]);
        assert!(store.get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryBackend::new();
        store.set("v", "1", None).await.unwrap();
        assert!(matches!(store.push("v", "x").await, Err(StoreError::WrongType(_))));
        store.push("l", "x").await.unwrap();
        assert!(matches!(store.get("l").await, Err(StoreError::WrongType(_))));
    }

    #[tokio::test]
    async fn test_shared_between_clones() {
        let a = MemoryBackend::new();
        let b = a.clone();
        a.push("shared", "1").await.unwrap();
        assert_eq!(b.get_all("shared").await.unwrap(), vec!["1"]);
    }

    #[tokio::test]
    async fn test_pubsub() {
        let store = MemoryBackend::new();
        assert_eq!(store.publish("ch", "lost").await.unwrap(), 0);

        let mut rx1 = store.subscribe("ch").await.unwrap();
        let mut rx2 = store.clone().subscribe("ch").await.unwrap();
        assert_eq!(store.publish("ch", "hi").await.unwrap(), 2);
        assert_eq!(rx1.recv().await.unwrap(), "hi");
        assert_eq!(rx2.recv().await.unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_outage() {
        let store = MemoryBackend::new();
        store.set_available(false);
        assert!(!store.is_connected());
        assert_eq!(store.connect().await, Err(StoreError::Unavailable));
        assert_eq!(store.get("k").await, Err(StoreError::Unavailable));
        assert_eq!(store.publish("ch", "x").await, Err(StoreError::Unavailable));

        store.set_available(true);
        assert!(store.connect().await.is_ok());
    }
}
