//! Keyed fan-out with backpressure.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! subscriber gets an independent receiver that buffers up to `capacity`
//! messages; a lagging receiver loses the oldest ones.
//!
//! The same primitive carries pub/sub channels (in the memory backend and the
//! store hub) and per-board client rooms (in the event router).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Messages sent while nobody was subscribed.
    pub messages_dropped: u64,
    pub subscribers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// A broadcast group for one channel or room.
pub struct BroadcastGroup<T> {
    sender: broadcast::Sender<T>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl<T: Clone + Send + 'static> BroadcastGroup<T> {
    /// `capacity` is the number of messages buffered per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            stats: AtomicBroadcastStats::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Send to every current subscriber. Returns how many received it.
    pub fn send(&self, msg: T) -> usize {
        match self.sender.send(msg) {
            Ok(count) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                count
            }
            Err(_) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps string keys (channel names, board ids) to broadcast groups.
pub struct RoomManager<T> {
    rooms: RwLock<HashMap<String, Arc<BroadcastGroup<T>>>>,
    default_capacity: usize,
}

impl<T: Clone + Send + 'static> RoomManager<T> {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the room for `key`.
    pub async fn get_or_create(&self, key: &str) -> Arc<BroadcastGroup<T>> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(BroadcastGroup::new(self.default_capacity)))
            .clone()
    }

    /// Existing room for `key`, without creating one.
    pub async fn get(&self, key: &str) -> Option<Arc<BroadcastGroup<T>>> {
        self.rooms.read().await.get(key).cloned()
    }

    /// Send to the room for `key` if it exists. Returns the receiver count.
    pub async fn send(&self, key: &str, msg: T) -> usize {
        match self.get(key).await {
            Some(room) => room.send(msg),
            None => 0,
        }
    }

    /// Drop the room when nobody listens anymore.
    pub async fn remove_if_empty(&self, key: &str) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            if room.subscriber_count() == 0 {
                rooms.remove(key);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<String> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_fan_out() {
        let group = BroadcastGroup::<String>::new(16);
        let mut rx1 = group.subscribe();
        let mut rx2 = group.subscribe();
        let mut rx3 = group.subscribe();

        assert_eq!(group.send("hello".to_string()), 3);
        assert_eq!(rx1.recv().await.unwrap(), "hello");
        assert_eq!(rx2.recv().await.unwrap(), "hello");
        assert_eq!(rx3.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_send_without_subscribers_counts_drop() {
        let group = BroadcastGroup::<u32>::new(4);
        assert_eq!(group.send(1), 0);
        let stats = group.stats();
        assert_eq!(stats.messages_sent, 0);
        assert_eq!(stats.messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_broadcast_stats() {
        let group = BroadcastGroup::<u32>::new(16);
        let _rx = group.subscribe();
        group.send(1);
        group.send(2);

        let stats = group.stats();
        assert_eq!(stats.messages_sent, 2);
        assert_eq!(stats.subscribers, 1);
        assert_eq!(group.capacity(), 16);
    }

    #[tokio::test]
    async fn test_lagging_subscriber() {
        let group = BroadcastGroup::<u32>::new(2);
        let mut rx = group.subscribe();
        for i in 0..5 {
            group.send(i);
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
    }

    #[tokio::test]
    async fn test_room_manager_get_or_create() {
        let manager = RoomManager::<String>::new(16);
        let room1 = manager.get_or_create("board-1").await;
        let room2 = manager.get_or_create("board-1").await;

        assert!(Arc::ptr_eq(&room1, &room2));
        assert_eq!(manager.room_count().await, 1);
        assert!(manager.get("board-2").await.is_none());
    }

    #[tokio::test]
    async fn test_room_manager_isolation() {
        let manager = RoomManager::<String>::new(16);
        let mut rx_a = manager.get_or_create("a").await.subscribe();
        let _rx_b = manager.get_or_create("b").await.subscribe();

        assert_eq!(manager.send("a", "only-a".to_string()).await, 1);
        assert_eq!(manager.send("missing", "nobody".to_string()).await, 0);
        assert_eq!(rx_a.recv().await.unwrap(), "only-a");

        let mut rooms = manager.active_rooms().await;
        rooms.sort();
        assert_eq!(rooms, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_room_manager_cleanup() {
        let manager = RoomManager::<u32>::new(16);
        let rx = manager.get_or_create("room").await.subscribe();

        assert!(!manager.remove_if_empty("room").await);
        drop(rx);
        assert!(manager.remove_if_empty("room").await);
        assert_eq!(manager.room_count().await, 0);
    }
}
