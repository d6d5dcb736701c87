//! Boundary between the client transport and the replication service.
//!
//! Inbound commands are forwarded to [`ReplicationService`]. Remote events
//! the service applies are re-emitted to the local clients of the board and
//! of its read-only mirror. The service callback only enqueues; fan-out
//! happens on the router's own task.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use board_core::{keys, Command, ReplicationEvent};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::broadcast::RoomManager;
use crate::replication::ReplicationService;

pub type ClientEvents = broadcast::Receiver<Arc<ReplicationEvent>>;

pub struct EventRouter {
    service: Arc<ReplicationService>,
    rooms: RoomManager<Arc<ReplicationEvent>>,
    /// board id → read-only mirror id
    mirrors: RwLock<HashMap<String, String>>,
    /// read-only mirror id → board id
    owners: RwLock<HashMap<String, String>>,
}

impl EventRouter {
    /// Create a router and register it with `service`. Rooms buffer
    /// `room_capacity` events per client, from the service's config. Must be
    /// called from within a tokio runtime.
    pub fn attach(service: Arc<ReplicationService>) -> Arc<Self> {
        let router = Arc::new(Self {
            service: service.clone(),
            rooms: RoomManager::new(service.config().room_capacity),
            mirrors: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
        });

        let (tx, mut rx) = mpsc::unbounded_channel::<ReplicationEvent>();
        service.on_remote_event(Arc::new(move |event: &ReplicationEvent| {
            if tx.send(event.clone()).is_err() {
                log::trace!("Router gone; event for {} not re-emitted", event.board_id);
            }
        }));

        let weak = Arc::downgrade(&router);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(router) = weak.upgrade() else {
                    break;
                };
                router.fan_out(event).await;
            }
        });

        router
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    pub async fn draw(&self, command: Command) {
        self.service.handle_events_and_data(command).await;
    }

    pub async fn undo(&self, board_id: &str, username: &str) {
        self.service
            .handle_events_and_data(Command::undo(board_id, username))
            .await;
    }

    pub async fn redo(&self, board_id: &str, username: &str) {
        self.service
            .handle_events_and_data(Command::redo(board_id, username))
            .await;
    }

    pub async fn clear(&self, board_id: &str) {
        self.service
            .handle_events_and_data(Command::clear(board_id))
            .await;
    }

    // ─── Local clients ────────────────────────────────────────────────

    /// Subscribe a local client to a board or read-only mirror id.
    ///
    /// A mirror id is resolved to its board here, so remote events for the
    /// board reach the mirror room even if this node never issued the id.
    pub async fn join(&self, room_id: &str) -> ClientEvents {
        if let Some(board_id) = self.board_for_read_only(room_id).await {
            log::debug!("Client joined read-only view of {board_id}");
        }
        self.service.metrics().connection_opened();
        self.rooms.get_or_create(room_id).await.subscribe()
    }

    pub async fn leave(&self, room_id: &str, events: ClientEvents) {
        drop(events);
        self.service.metrics().connection_closed();
        if self.rooms.remove_if_empty(room_id).await {
            log::debug!("Room {room_id} closed");
        }
    }

    async fn fan_out(&self, event: ReplicationEvent) -> usize {
        let mirror = self.cached_mirror(&event.board_id);
        let event = Arc::new(event);
        let mut delivered = self.rooms.send(&event.board_id, event.clone()).await;
        if let Some(mirror) = mirror {
            delivered += self.rooms.send(&mirror, event).await;
        }
        delivered
    }

    // ─── Read-only mirrors ────────────────────────────────────────────

    /// Read-only mirror id of `board_id`, created on first request.
    pub async fn read_only_id(&self, board_id: &str) -> String {
        if let Some(mirror) = self.cached_mirror(board_id) {
            return mirror;
        }

        let adapter = self.service.adapter();
        let key = keys::read_only(board_id);
        let mirror = match adapter.get(&key).await {
            Some(mirror) => mirror,
            None => {
                let mirror = Uuid::new_v4().to_string();
                adapter.set(&key, &mirror, None).await;
                adapter
                    .set(&keys::read_only_owner(&mirror), board_id, None)
                    .await;
                log::debug!("Created read-only id for {board_id}");
                mirror
            }
        };
        self.remember(board_id, &mirror);
        mirror
    }

    /// Board behind a read-only mirror id, if known.
    pub async fn board_for_read_only(&self, mirror_id: &str) -> Option<String> {
        let cached = self
            .owners
            .read()
            .ok()
            .and_then(|owners| owners.get(mirror_id).cloned());
        if cached.is_some() {
            return cached;
        }

        let board_id = self
            .service
            .adapter()
            .get(&keys::read_only_owner(mirror_id))
            .await?;
        self.remember(&board_id, mirror_id);
        Some(board_id)
    }

    fn cached_mirror(&self, board_id: &str) -> Option<String> {
        self.mirrors
            .read()
            .ok()
            .and_then(|mirrors| mirrors.get(board_id).cloned())
    }

    fn remember(&self, board_id: &str, mirror_id: &str) {
        if let Ok(mut mirrors) = self.mirrors.write() {
            mirrors.insert(board_id.to_string(), mirror_id.to_string());
        }
        if let Ok(mut owners) = self.owners.write() {
            owners.insert(mirror_id.to_string(), board_id.to_string());
        }
    }

    pub fn service(&self) -> &Arc<ReplicationService> {
        &self.service
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.room_count().await
    }
}
