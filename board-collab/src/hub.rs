//! Store hub: the shared backing store that nodes connect to.
//!
//! Architecture:
//! ```text
//! Node A ──┐   HubRequest (bincode / WebSocket)
//!          ├── HubServer ── Keyspace (RocksDB or in-memory)
//! Node B ──┘       │
//!                  └── RoomManager<String>  (one broadcast group per channel)
//!                          │
//!                 ┌────────┴────────┐
//!                 ▼                 ▼
//!              Node A            Node B        HubFrame::Message
//! ```
//!
//! Requests on one connection are applied in arrival order. Pub/sub
//! deliveries are forwarded by one task per (connection, channel).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::RoomManager;
use crate::config::env_or;
use crate::protocol::{HubFrame, HubOp, HubReply, HubRequest};
use crate::store::{Backend, MemoryBackend, RocksStore, StoreConfig, StoreError};

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Messages buffered per subscriber and channel
    pub channel_capacity: usize,
    /// Outgoing frames buffered per connection
    pub outgoing_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:6380".to_string(),
            storage_path: None,
            channel_capacity: 1024,
            outgoing_capacity: 1024,
        }
    }
}

impl HubConfig {
    /// Defaults overridden by `BOARD_HUB_ADDR`, `BOARD_HUB_DATA` and
    /// `BOARD_HUB_CHANNEL_CAPACITY`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("BOARD_HUB_ADDR", defaults.bind_addr),
            storage_path: std::env::var("BOARD_HUB_DATA").ok().map(PathBuf::from),
            channel_capacity: env_or("BOARD_HUB_CHANNEL_CAPACITY", defaults.channel_capacity),
            outgoing_capacity: defaults.outgoing_capacity,
        }
    }
}

/// Hub statistics.
#[derive(Debug, Clone, Default)]
pub struct HubStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub published_messages: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("failed to open store: {0}")]
    Store(#[from] StoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable or volatile key storage behind the hub.
enum Keyspace {
    /// RocksDB calls block, so they run on the blocking pool.
    Durable(Arc<RocksStore>),
    Volatile(MemoryBackend),
}

impl Keyspace {
    async fn apply(&self, op: HubOp) -> Result<HubReply, StoreError> {
        match self {
            Keyspace::Durable(store) => {
                let store = store.clone();
                tokio::task::spawn_blocking(move || apply_durable(&store, op))
                    .await
                    .map_err(|e| StoreError::Database(format!("store task failed: {e}")))?
            }
            Keyspace::Volatile(store) => match op {
                HubOp::Get { key } => store.get(&key).await.map(HubReply::Value),
                HubOp::Set { key, value, ttl_ms } => store
                    .set(&key, &value, ttl_ms.map(Duration::from_millis))
                    .await
                    .map(|_| HubReply::Done),
                HubOp::Delete { key } => store.delete(&key).await.map(HubReply::Deleted),
                HubOp::Push { key, item } => store.push(&key, &item).await.map(HubReply::Len),
                HubOp::PushAll { key, items } => store.push_all(&key, &items).await.map(HubReply::Len),
                HubOp::GetAll { key } => store.get_all(&key).await.map(HubReply::Items),
                other => Err(StoreError::Protocol(format!("not a keyspace op: {other:?}"))),
            },
        }
    }
}

fn apply_durable(store: &RocksStore, op: HubOp) -> Result<HubReply, StoreError> {
    match op {
        HubOp::Get { key } => store.get(&key).map(HubReply::Value),
        HubOp::Set { key, value, ttl_ms } => store.set(&key, &value, ttl_ms).map(|_| HubReply::Done),
        HubOp::Delete { key } => store.delete(&key).map(HubReply::Deleted),
        HubOp::Push { key, item } => store.push(&key, &item).map(HubReply::Len),
        HubOp::PushAll { key, items } => store.push_all(&key, &items).map(HubReply::Len),
        HubOp::GetAll { key } => store.get_all(&key).map(HubReply::Items),
        other => Err(StoreError::Protocol(format!("not a keyspace op: {other:?}"))),
    }
}

struct HubShared {
    keyspace: Keyspace,
    channels: RoomManager<String>,
    stats: RwLock<HubStats>,
    config: HubConfig,
}

/// The store hub server.
pub struct HubServer {
    shared: Arc<HubShared>,
}

impl HubServer {
    /// Create a hub; opens RocksDB when `storage_path` is set.
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        let keyspace = match &config.storage_path {
            Some(path) => Keyspace::Durable(Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => Keyspace::Volatile(MemoryBackend::new()),
        };

        Ok(Self {
            shared: Arc::new(HubShared {
                keyspace,
                channels: RoomManager::new(config.channel_capacity),
                stats: RwLock::new(HubStats::default()),
                config,
            }),
        })
    }

    /// In-memory hub with default settings.
    pub fn with_defaults() -> Self {
        Self {
            shared: Arc::new(HubShared {
                keyspace: Keyspace::Volatile(MemoryBackend::new()),
                channels: RoomManager::new(HubConfig::default().channel_capacity),
                stats: RwLock::new(HubStats::default()),
                config: HubConfig::default(),
            }),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), HubError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Store hub listening on {}", self.shared.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), HubError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<HubShared>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Node connected from {addr}");

        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(shared.config.outgoing_capacity);
        let mut forwarders: HashMap<String, JoinHandle<()>> = HashMap::new();

        let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let request = match HubRequest::decode(&data) {
                                    Ok(request) => request,
                                    Err(e) => {
                                        log::warn!("Failed to decode request from {addr}: {e}");
                                        continue;
                                    }
                                };
                                let reply = Self::handle_request(&shared, request.op, &out_tx, &mut forwarders).await;
                                {
                                    let mut s = shared.stats.write().await;
                                    s.total_requests += 1;
                                    if reply.is_err() {
                                        s.failed_requests += 1;
                                    }
                                }
                                let frame = HubFrame::reply(request.id, reply).encode()?;
                                ws_sender.send(Message::Binary(frame.into())).await?;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Node at {addr} disconnected");
                                break;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    Some(frame) = out_rx.recv() => {
                        ws_sender.send(Message::Binary(frame.into())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        for (channel, task) in forwarders.drain() {
            task.abort();
            shared.channels.remove_if_empty(&channel).await;
        }
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    async fn handle_request(
        shared: &Arc<HubShared>,
        op: HubOp,
        out_tx: &mpsc::Sender<Vec<u8>>,
        forwarders: &mut HashMap<String, JoinHandle<()>>,
    ) -> Result<HubReply, StoreError> {
        match op {
            HubOp::Ping => Ok(HubReply::Pong),
            HubOp::Publish { channel, message } => {
                let receivers = shared.channels.send(&channel, message).await;
                shared.stats.write().await.published_messages += 1;
                log::trace!("Published on {channel} to {receivers} subscribers");
                Ok(HubReply::Receivers(receivers))
            }
            HubOp::Subscribe { channel } => {
                if !forwarders.contains_key(&channel) {
                    let rx = shared.channels.get_or_create(&channel).await.subscribe();
                    let task = tokio::spawn(Self::forward(channel.clone(), rx, out_tx.clone()));
                    forwarders.insert(channel.clone(), task);
                    log::debug!("Subscribed connection to {channel}");
                }
                Ok(HubReply::Done)
            }
            HubOp::Unsubscribe { channel } => {
                if let Some(task) = forwarders.remove(&channel) {
                    task.abort();
                    shared.channels.remove_if_empty(&channel).await;
                }
                Ok(HubReply::Done)
            }
            keyspace_op => shared.keyspace.apply(keyspace_op).await,
        }
    }

    /// Relay channel messages into one connection's outgoing queue.
    async fn forward(channel: String, mut rx: broadcast::Receiver<String>, out_tx: mpsc::Sender<Vec<u8>>) {
        loop {
            match rx.recv().await {
                Ok(payload) => {
                    let frame = HubFrame::Message {
                        channel: channel.clone(),
                        payload,
                    };
                    match frame.encode() {
                        Ok(bytes) => {
                            if out_tx.send(bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::error!("Failed to encode message on {channel}: {e}"),
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscriber on {channel} lagged by {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    pub async fn stats(&self) -> HubStats {
        self.shared.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.shared.keyspace, Keyspace::Durable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_config_default() {
        let config = HubConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:6380");
        assert!(config.storage_path.is_none());
        assert_eq!(config.channel_capacity, 1024);
    }

    #[test]
    fn test_hub_creation() {
        let hub = HubServer::with_defaults();
        assert_eq!(hub.bind_addr(), "127.0.0.1:6380");
        assert!(!hub.is_durable());
    }

    #[tokio::test]
    async fn test_hub_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let hub = HubServer::new(HubConfig {
            storage_path: Some(dir.path().join("db")),
            ..HubConfig::default()
        })
        .unwrap();
        assert!(hub.is_durable());
    }

    #[tokio::test]
    async fn test_keyspace_volatile_ops() {
        let keyspace = Keyspace::Volatile(MemoryBackend::new());
        let reply = keyspace
            .apply(HubOp::Push { key: "l".into(), item: "a".into() })
            .await
            .unwrap();
        assert_eq!(reply, HubReply::Len(1));
        let reply = keyspace.apply(HubOp::GetAll { key: "l".into() }).await.unwrap();
        assert_eq!(reply, HubReply::Items(vec!["a".into()]));
        assert!(keyspace.apply(HubOp::Ping).await.is_err());
    }

    #[tokio::test]
    async fn test_keyspace_durable_ops() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let keyspace = Keyspace::Durable(Arc::new(store));
        keyspace
            .apply(HubOp::Set { key: "k".into(), value: "v".into(), ttl_ms: None })
            .await
            .unwrap();
        let reply = keyspace.apply(HubOp::Get { key: "k".into() }).await.unwrap();
        assert_eq!(reply, HubReply::Value(Some("v".into())));
        let reply = keyspace.apply(HubOp::Delete { key: "k".into() }).await.unwrap();
        assert_eq!(reply, HubReply::Deleted(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_durable_ops_run_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let keyspace = Arc::new(Keyspace::Durable(Arc::new(store)));

        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let keyspace = keyspace.clone();
                tokio::spawn(async move {
                    keyspace
                        .apply(HubOp::Push { key: "l".into(), item: i.to_string() })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reply = keyspace.apply(HubOp::GetAll { key: "l".into() }).await.unwrap();
        match reply {
            HubReply::Items(items) => assert_eq!(items.len(), 16),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(keyspace.apply(HubOp::Ping).await.is_err());
    }

    #[tokio::test]
    async fn test_hub_stats_initial() {
        let hub = HubServer::with_defaults();
        let stats = hub.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_requests, 0);
    }
}
