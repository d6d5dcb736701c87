//! WebSocket client for the store hub.
//!
//! Provides:
//! - Connection lifecycle (connect, loss detection, reconnect on demand)
//! - Request/reply correlation by id, with a per-request timeout
//! - Channel subscriptions that survive reconnects: each channel has a local
//!   broadcast sender, and every `connect` re-subscribes the channels the hub
//!   has not acknowledged on the current connection

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use super::{Backend, StoreError, Subscription};
use crate::protocol::{HubFrame, HubOp, HubReply, HubRequest, ProtocolError};

type PendingMap = HashMap<u64, oneshot::Sender<Result<HubReply, String>>>;

/// Client settings.
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Hub URL, e.g. `ws://127.0.0.1:6380`
    pub url: String,
    /// Timeout for connecting and for each request
    pub request_timeout: Duration,
    /// Messages buffered per local subscriber
    pub channel_capacity: usize,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            request_timeout: Duration::from_secs(5),
            channel_capacity: 1024,
        }
    }
}

/// Outgoing frame queue of one connection, tagged with its generation.
type Outgoing = (u64, mpsc::Sender<Vec<u8>>);

struct RemoteShared {
    connected: AtomicBool,
    /// Bumped on every successful open; tasks of older connections compare
    /// against it before tearing anything down.
    generation: AtomicU64,
    pending: Mutex<PendingMap>,
    channels: RwLock<HashMap<String, broadcast::Sender<String>>>,
    /// Channels the hub acknowledged on the current connection.
    subscribed: Mutex<HashSet<String>>,
    outgoing: RwLock<Option<Outgoing>>,
}

impl RemoteShared {
    fn outgoing(&self) -> Option<Outgoing> {
        self.outgoing.read().ok().and_then(|o| o.clone())
    }

    /// Mark connection `generation` lost and fail every in-flight request.
    /// A no-op once a newer connection has been installed.
    fn disconnect(&self, generation: u64) {
        let Ok(mut outgoing) = self.outgoing.write() else {
            return;
        };
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        *outgoing = None;
        self.connected.store(false, Ordering::SeqCst);
        if let Ok(mut subscribed) = self.subscribed.lock() {
            subscribed.clear();
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }

    fn install(&self, sender: mpsc::Sender<Vec<u8>>) -> u64 {
        let mut outgoing = match self.outgoing.write() {
            Ok(outgoing) => outgoing,
            Err(poisoned) => poisoned.into_inner(),
        };
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *outgoing = Some((generation, sender));
        if let Ok(mut subscribed) = self.subscribed.lock() {
            subscribed.clear();
        }
        self.connected.store(true, Ordering::SeqCst);
        generation
    }

    fn is_acked(&self, channel: &str) -> bool {
        self.subscribed
            .lock()
            .map(|s| s.contains(channel))
            .unwrap_or(false)
    }

    fn deliver(&self, channel: &str, payload: String) {
        let sender = self
            .channels
            .read()
            .ok()
            .and_then(|channels| channels.get(channel).cloned());
        match sender {
            Some(sender) => {
                let _ = sender.send(payload);
            }
            None => log::debug!("Message on unsubscribed channel {channel}"),
        }
    }

    fn complete(&self, id: u64, result: Result<HubReply, String>) {
        let waiter = self.pending.lock().ok().and_then(|mut p| p.remove(&id));
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
    }
}

/// Backend that talks to a [`HubServer`](crate::hub::HubServer).
pub struct RemoteBackend {
    config: RemoteConfig,
    shared: Arc<RemoteShared>,
    next_id: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
}

impl RemoteBackend {
    pub fn new(config: RemoteConfig) -> Self {
        Self {
            config,
            shared: Arc::new(RemoteShared {
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                pending: Mutex::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                subscribed: Mutex::new(HashSet::new()),
                outgoing: RwLock::new(None),
            }),
            next_id: AtomicU64::new(1),
            connect_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn open(&self) -> Result<(), StoreError> {
        let connect = tokio_tungstenite::connect_async(self.config.url.as_str());
        let (ws_stream, _) = match tokio::time::timeout(self.config.request_timeout, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                log::debug!("Hub connect to {} failed: {e}", self.config.url);
                return Err(StoreError::Unavailable);
            }
            Err(_) => return Err(StoreError::Timeout),
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let generation = self.shared.install(out_tx);

        // Writer task: forward outgoing frames to the socket
        let shared = self.shared.clone();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    shared.disconnect(generation);
                    break;
                }
            }
        });

        // Reader task: route replies and channel messages
        let shared = self.shared.clone();
        let url = self.config.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match HubFrame::decode(&data) {
                        Ok(HubFrame::Reply { id, result }) => shared.complete(id, result),
                        Ok(HubFrame::Message { channel, payload }) => shared.deliver(&channel, payload),
                        Err(e) => log::warn!("Undecodable frame from hub: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            log::warn!("Lost connection to hub at {url}");
            shared.disconnect(generation);
        });

        match self.request(HubOp::Ping).await {
            Ok(HubReply::Pong) => {}
            Ok(other) => {
                self.shared.disconnect(generation);
                return Err(unexpected(other));
            }
            Err(e) => {
                self.shared.disconnect(generation);
                return Err(e);
            }
        }

        log::info!("Connected to hub at {}", self.config.url);
        Ok(())
    }

    /// Ask the hub to forward `channel`; remembered only once acknowledged.
    async fn hub_subscribe(&self, channel: &str) -> Result<(), StoreError> {
        let op = HubOp::Subscribe {
            channel: channel.to_string(),
        };
        match self.request(op).await? {
            HubReply::Done => {
                if let Ok(mut subscribed) = self.shared.subscribed.lock() {
                    subscribed.insert(channel.to_string());
                }
                Ok(())
            }
            other => Err(unexpected(other)),
        }
    }

    /// Subscribe every locally known channel the hub has not acknowledged.
    async fn resubscribe(&self) -> Result<(), StoreError> {
        let missing: Vec<String> = self
            .shared
            .channels
            .read()
            .map(|c| c.keys().cloned().collect::<Vec<String>>())
            .unwrap_or_default()
            .into_iter()
            .filter(|channel| !self.shared.is_acked(channel))
            .collect();
        for channel in missing {
            self.hub_subscribe(&channel).await?;
        }
        Ok(())
    }

    async fn request(&self, op: HubOp) -> Result<HubReply, StoreError> {
        let (generation, outgoing) = match self.shared.outgoing() {
            Some(out) if self.is_connected() => out,
            _ => return Err(StoreError::Unavailable),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let bytes = HubRequest { id, op }.encode()?;
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending.lock() {
            pending.insert(id, tx);
        }

        if outgoing.send(bytes).await.is_err() {
            self.shared.complete(id, Err(String::new()));
            self.shared.disconnect(generation);
            return Err(ProtocolError::ConnectionClosed.into());
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(remote))) => Err(StoreError::Database(remote)),
            Ok(Err(_)) => Err(ProtocolError::ConnectionClosed.into()),
            Err(_) => {
                if let Ok(mut pending) = self.shared.pending.lock() {
                    pending.remove(&id);
                }
                Err(StoreError::Timeout)
            }
        }
    }
}

fn unexpected(reply: HubReply) -> StoreError {
    ProtocolError::UnexpectedReply(format!("{reply:?}")).into()
}

#[async_trait]
impl Backend for RemoteBackend {
    async fn connect(&self) -> Result<(), StoreError> {
        let _guard = self.connect_lock.lock().await;
        if !self.is_connected() {
            self.open().await?;
        }
        self.resubscribe().await
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.request(HubOp::Get { key: key.to_string() }).await? {
            HubReply::Value(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        let op = HubOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
        };
        match self.request(op).await? {
            HubReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        match self.request(HubOp::Delete { key: key.to_string() }).await? {
            HubReply::Deleted(existed) => Ok(existed),
            other => Err(unexpected(other)),
        }
    }

    async fn push(&self, key: &str, item: &str) -> Result<usize, StoreError> {
        let op = HubOp::Push {
            key: key.to_string(),
            item: item.to_string(),
        };
        match self.request(op).await? {
            HubReply::Len(len) => Ok(len),
            other => Err(unexpected(other)),
        }
    }

    async fn push_all(&self, key: &str, items: &[String]) -> Result<usize, StoreError> {
        let op = HubOp::PushAll {
            key: key.to_string(),
            items: items.to_vec(),
        };
        match self.request(op).await? {
            HubReply::Len(len) => Ok(len),
            other => Err(unexpected(other)),
        }
    }

    async fn get_all(&self, key: &str) -> Result<Vec<String>, StoreError> {
        match self.request(HubOp::GetAll { key: key.to_string() }).await? {
            HubReply::Items(items) => Ok(items),
            other => Err(unexpected(other)),
        }
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<usize, StoreError> {
        let op = HubOp::Publish {
            channel: channel.to_string(),
            message: message.to_string(),
        };
        match self.request(op).await? {
            HubReply::Receivers(count) => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        let rx = {
            let mut channels = self
                .shared
                .channels
                .write()
                .map_err(|_| StoreError::Protocol("channel table poisoned".into()))?;
            match channels.get(channel) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (sender, rx) = broadcast::channel(self.config.channel_capacity);
                    channels.insert(channel.to_string(), sender);
                    rx
                }
            }
        };

        // Unacknowledged channels are retried by the next `connect`, so a
        // failure here is reported but the local receiver stays valid.
        if !self.shared.is_acked(channel) {
            self.hub_subscribe(channel).await?;
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), StoreError> {
        if let Ok(mut channels) = self.shared.channels.write() {
            channels.remove(channel);
        }
        let acked = self
            .shared
            .subscribed
            .lock()
            .map(|mut s| s.remove(channel))
            .unwrap_or(false);
        if !acked || !self.is_connected() {
            return Ok(());
        }
        match self
            .request(HubOp::Unsubscribe {
                channel: channel.to_string(),
            })
            .await?
        {
            HubReply::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_requests_fail_fast_when_disconnected() {
        let backend = RemoteBackend::new(RemoteConfig::new("ws://127.0.0.1:1"));
        assert!(!backend.is_connected());
        assert_eq!(backend.get("k").await, Err(StoreError::Unavailable));
        assert_eq!(backend.publish("ch", "m").await, Err(StoreError::Unavailable));
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let mut config = RemoteConfig::new("ws://127.0.0.1:1");
        config.request_timeout = Duration::from_millis(500);
        let backend = RemoteBackend::new(config);
        assert!(backend.connect().await.unwrap_err().is_connectivity());
        assert!(!backend.is_connected());
    }

    #[tokio::test]
    async fn test_subscribe_keeps_local_receiver_when_offline() {
        let backend = RemoteBackend::new(RemoteConfig::new("ws://127.0.0.1:1"));
        assert!(backend.subscribe("ch").await.is_err());
        // Channel is remembered for re-subscription on connect
        assert!(backend.shared.channels.read().unwrap().contains_key("ch"));
        assert!(!backend.shared.is_acked("ch"));
        backend.shared.deliver("ch", "local".into());
    }

    #[tokio::test]
    async fn test_stale_connection_cannot_tear_down_newer_one() {
        let backend = RemoteBackend::new(RemoteConfig::new("ws://127.0.0.1:1"));
        let (first, _rx1) = mpsc::channel(1);
        let (second, _rx2) = mpsc::channel(1);
        let old = backend.shared.install(first);
        let current = backend.shared.install(second);
        assert_ne!(old, current);
        backend.shared.subscribed.lock().unwrap().insert("ch".into());

        backend.shared.disconnect(old);
        assert!(backend.is_connected());
        assert_eq!(backend.shared.outgoing().map(|(g, _)| g), Some(current));
        assert!(backend.shared.is_acked("ch"));

        backend.shared.disconnect(current);
        assert!(!backend.is_connected());
        assert!(backend.shared.outgoing().is_none());
        assert!(!backend.shared.is_acked("ch"));
    }

    #[tokio::test]
    async fn test_unsubscribe_offline_forgets_channel() {
        let backend = RemoteBackend::new(RemoteConfig::new("ws://127.0.0.1:1"));
        let _ = backend.subscribe("ch").await;
        assert!(backend.unsubscribe("ch").await.is_ok());
        assert!(!backend.shared.channels.read().unwrap().contains_key("ch"));
    }
}
