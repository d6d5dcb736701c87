//! Per-node replication and reconciliation.
//!
//! Every accepted mutation is applied to the node's local cache, persisted
//! through the [`PersistenceAdapter`], and announced as a full-snapshot
//! [`ReplicationEvent`]. Other nodes replace their cached copy wholesale;
//! the originating node recognises its own events by node id and skips them.
//!
//! Within one node, all work on a board (loads, local mutations, remote
//! applications) runs under that board's gate. Nodes do not coordinate: the
//! last snapshot to be published wins.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use board_core::{keys, now_millis, Action, Command, EventType, ReplicationEvent, Tool};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

use crate::adapter::{MessageHandler, PersistenceAdapter};
use crate::config::NodeConfig;
use crate::metrics::Metrics;
use crate::store::{Backend, MemoryBackend, RemoteBackend, RemoteConfig};

/// Called for every applied remote event. Must not block.
pub type RemoteCallback = Arc<dyn Fn(&ReplicationEvent) + Send + Sync>;

pub struct ReplicationService {
    config: NodeConfig,
    adapter: Arc<PersistenceAdapter>,
    metrics: Arc<Metrics>,
    cache: RwLock<HashMap<String, Vec<Action>>>,
    undo_cache: RwLock<HashMap<String, Vec<Action>>>,
    gates: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    callbacks: StdRwLock<Vec<RemoteCallback>>,
}

impl ReplicationService {
    pub fn new(config: NodeConfig, backend: Arc<dyn Backend>) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        let adapter = Arc::new(PersistenceAdapter::new(backend, metrics.clone()));
        log::info!("Replication node {} created", config.node_id);
        Arc::new(Self {
            config,
            adapter,
            metrics,
            cache: RwLock::new(HashMap::new()),
            undo_cache: RwLock::new(HashMap::new()),
            gates: StdMutex::new(HashMap::new()),
            callbacks: StdRwLock::new(Vec::new()),
        })
    }

    /// Service backed by the hub at `config.hub_url`, or by a private
    /// in-memory store when no hub is configured.
    pub fn from_config(config: NodeConfig) -> Arc<Self> {
        let backend: Arc<dyn Backend> = match &config.hub_url {
            Some(url) => {
                let mut remote = RemoteConfig::new(url.clone());
                remote.request_timeout = config.request_timeout;
                Arc::new(RemoteBackend::new(remote))
            }
            None => {
                log::warn!("No hub configured; node {} keeps state in memory", config.node_id);
                Arc::new(MemoryBackend::new())
            }
        };
        Self::new(config, backend)
    }

    /// Connect to the store and listen for remote events.
    ///
    /// Returns whether the store was reachable. When it is not, the node runs
    /// local-only and the subscription is attached once a reconnect succeeds.
    pub async fn start(self: &Arc<Self>) -> bool {
        let connected = self.adapter.connect().await;

        let service = Arc::downgrade(self);
        let handler: MessageHandler = Arc::new(move |raw: String| -> BoxFuture<'static, ()> {
            let service = service.clone();
            Box::pin(async move {
                let Some(service) = service.upgrade() else {
                    return;
                };
                match ReplicationEvent::from_json(&raw) {
                    Ok(event) => {
                        service.handle_remote_event(event).await;
                    }
                    Err(e) => log::warn!("Dropping malformed replication event: {e}"),
                }
            })
        });
        self.adapter.subscribe(&self.config.events_channel, handler).await;

        log::info!(
            "Node {} started ({})",
            self.config.node_id,
            if connected { "store connected" } else { "local-only" }
        );
        connected
    }

    /// Reconnect loop and heartbeat, per the node config.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        vec![
            self.adapter.spawn_reconnect(self.config.reconnect_interval),
            self.spawn_heartbeat(self.config.heartbeat_interval, self.config.heartbeat_ttl),
        ]
    }

    /// Refresh `node:{id}:alive` every `interval`, expiring after `ttl`.
    pub fn spawn_heartbeat(self: &Arc<Self>, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let service = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else {
                    break;
                };
                let key = keys::node_alive(&service.config.node_id);
                if !service.adapter.set(&key, &now_millis().to_string(), Some(ttl)).await {
                    log::debug!("Heartbeat for {} not written", service.config.node_id);
                }
            }
        })
    }

    pub fn on_remote_event(&self, callback: RemoteCallback) {
        match self.callbacks.write() {
            Ok(mut callbacks) => callbacks.push(callback),
            Err(_) => log::error!("Callback registry poisoned; callback dropped"),
        }
    }

    // ─── Loading ──────────────────────────────────────────────────────

    /// Current actions of `board_id`: cached copy, else the stored list, else
    /// empty. The result is cached in every case.
    pub async fn load_stored_data(&self, board_id: &str) -> Vec<Action> {
        let _gate = self.gate(board_id).await;
        self.load_locked(board_id).await
    }

    async fn load_locked(&self, board_id: &str) -> Vec<Action> {
        if let Some(actions) = self.cache.read().await.get(board_id) {
            return actions.clone();
        }
        let actions = self.adapter.get_actions(&keys::actions(board_id)).await;
        log::debug!("Loaded board {board_id} ({} actions)", actions.len());
        self.cache
            .write()
            .await
            .insert(board_id.to_string(), actions.clone());
        actions
    }

    // The store copy wins while it is reachable so that a group undone on one
    // node can be redone on another.
    async fn load_undo_locked(&self, board_id: &str) -> Vec<Action> {
        if self.adapter.is_ready() {
            let stack = self.adapter.get_actions(&keys::undo_stack(board_id)).await;
            self.undo_cache
                .write()
                .await
                .insert(board_id.to_string(), stack.clone());
            return stack;
        }
        self.undo_cache
            .read()
            .await
            .get(board_id)
            .cloned()
            .unwrap_or_default()
    }

    // ─── Mutations ────────────────────────────────────────────────────

    /// Single entry point for inbound mutations.
    pub async fn handle_events_and_data(&self, command: Command) {
        let Command { board_id, action } = command;
        match action.tool {
            Tool::Clear => self.clear_whiteboard(&board_id).await,
            Tool::Undo => self.handle_undo(&board_id, &action.username).await,
            Tool::Redo => self.handle_redo(&board_id, &action.username).await,
            _ if action.tool.is_drawing() => self.save_drawing_action(&board_id, action).await,
            _ => log::trace!("Not replicating transient {} on {board_id}", action.tool),
        }
    }

    /// Append `action` to the board. A `setTextboxText` first replaces any
    /// earlier text for the same textbox.
    pub async fn save_drawing_action(&self, board_id: &str, action: Action) {
        let _gate = self.gate(board_id).await;
        let mut actions = self.load_locked(board_id).await;
        let key = keys::actions(board_id);

        if action.tool == Tool::SetTextboxText {
            let textbox = action.leading_id();
            actions.retain(|a| !(a.tool == Tool::SetTextboxText && a.leading_id() == textbox));
            actions.push(action.clone());
            self.adapter.replace_actions(&key, &actions).await;
        } else {
            actions.push(action.clone());
            self.adapter.push_action(&key, &action).await;
        }
        self.cache
            .write()
            .await
            .insert(board_id.to_string(), actions.clone());
        self.metrics.record_draw();

        let tool = action.tool.clone();
        self.publish(ReplicationEvent::update(
            board_id,
            &self.config.node_id,
            Some(tool),
            actions,
            Some(action),
        ))
        .await;
    }

    /// Purge the board's actions and undo stack, locally and in the store.
    pub async fn clear_whiteboard(&self, board_id: &str) {
        let _gate = self.gate(board_id).await;
        self.cache.write().await.remove(board_id);
        self.undo_cache.write().await.remove(board_id);
        self.adapter.delete(&keys::actions(board_id)).await;
        self.adapter.delete(&keys::undo_stack(board_id)).await;
        self.metrics.record_clear();
        log::debug!("Cleared board {board_id}");

        self.publish(ReplicationEvent::clear(board_id, &self.config.node_id))
            .await;
    }

    /// Move `username`'s most recent action group onto the undo stack.
    pub async fn handle_undo(&self, board_id: &str, username: &str) {
        let _gate = self.gate(board_id).await;
        let mut actions = self.load_locked(board_id).await;
        let mut stack = self.load_undo_locked(board_id).await;

        let group = actions
            .iter()
            .rev()
            .find(|a| a.username == username)
            .map(|a| a.draw_id.clone());

        if let Some(draw_id) = group {
            // Newest first: the group lands on the stack in reverse order.
            let mut kept = Vec::with_capacity(actions.len());
            for action in actions.into_iter().rev() {
                if action.in_group(draw_id.as_deref(), username) {
                    stack.push(action);
                } else {
                    kept.push(action);
                }
            }
            kept.reverse();
            actions = kept;

            if stack.len() > self.config.undo_limit {
                let excess = stack.len() - self.config.undo_limit;
                stack.drain(..excess);
            }
            self.store_lists(board_id, &actions, &stack).await;
        } else {
            log::debug!("Nothing to undo for {username} on {board_id}");
        }
        self.metrics.record_undo();

        self.publish(ReplicationEvent::update(
            board_id,
            &self.config.node_id,
            Some(Tool::Undo),
            actions,
            None,
        ))
        .await;
    }

    /// Restore `username`'s most recently undone group at the end of the board.
    pub async fn handle_redo(&self, board_id: &str, username: &str) {
        let _gate = self.gate(board_id).await;
        let mut actions = self.load_locked(board_id).await;
        let stack = self.load_undo_locked(board_id).await;

        let group = stack
            .iter()
            .rev()
            .find(|a| a.username == username)
            .map(|a| a.draw_id.clone());

        if let Some(draw_id) = group {
            let mut remaining = Vec::with_capacity(stack.len());
            for action in stack.into_iter().rev() {
                if action.in_group(draw_id.as_deref(), username) {
                    actions.push(action);
                } else {
                    remaining.push(action);
                }
            }
            remaining.reverse();
            self.store_lists(board_id, &actions, &remaining).await;
        } else {
            log::debug!("Nothing to redo for {username} on {board_id}");
        }
        self.metrics.record_redo();

        self.publish(ReplicationEvent::update(
            board_id,
            &self.config.node_id,
            Some(Tool::Redo),
            actions,
            None,
        ))
        .await;
    }

    async fn store_lists(&self, board_id: &str, actions: &[Action], stack: &[Action]) {
        self.cache
            .write()
            .await
            .insert(board_id.to_string(), actions.to_vec());
        self.undo_cache
            .write()
            .await
            .insert(board_id.to_string(), stack.to_vec());
        self.adapter
            .replace_actions(&keys::actions(board_id), actions)
            .await;
        self.adapter
            .replace_actions(&keys::undo_stack(board_id), stack)
            .await;
    }

    /// Seed `target` with a copy of `source`. Only happens when `target` is
    /// empty and `source` is not; returns whether anything was copied.
    pub async fn copy_stored_data(&self, source: &str, target: &str) -> bool {
        if source == target {
            return false;
        }
        // Fixed lock order across boards.
        let (first, second) = if source < target { (source, target) } else { (target, source) };
        let _first = self.gate(first).await;
        let _second = self.gate(second).await;

        if !self.load_locked(target).await.is_empty() {
            return false;
        }
        let actions = self.load_locked(source).await;
        if actions.is_empty() {
            return false;
        }

        self.cache
            .write()
            .await
            .insert(target.to_string(), actions.clone());
        self.adapter
            .replace_actions(&keys::actions(target), &actions)
            .await;
        log::info!("Copied {} actions from {source} to {target}", actions.len());

        self.publish(ReplicationEvent::update(
            target,
            &self.config.node_id,
            None,
            actions,
            None,
        ))
        .await;
        true
    }

    // ─── Remote events ────────────────────────────────────────────────

    /// Apply an event published by another node, then run the registered
    /// callbacks in registration order. Returns false for this node's own
    /// events, which are ignored.
    pub async fn handle_remote_event(&self, event: ReplicationEvent) -> bool {
        if event.originated_at(&self.config.node_id) {
            self.metrics.record_remote_suppressed();
            return false;
        }

        {
            let _gate = self.gate(&event.board_id).await;
            match event.kind {
                EventType::Update => {
                    let actions = event.data.clone().unwrap_or_default();
                    self.cache
                        .write()
                        .await
                        .insert(event.board_id.clone(), actions);
                }
                EventType::Clear => {
                    self.cache.write().await.remove(&event.board_id);
                    self.undo_cache.write().await.remove(&event.board_id);
                }
            }
        }
        self.metrics.record_remote_applied();
        log::trace!(
            "Applied {:?} for {} from node {}",
            event.kind,
            event.board_id,
            event.node_id
        );

        let callbacks: Vec<RemoteCallback> = self
            .callbacks
            .read()
            .map(|c| c.clone())
            .unwrap_or_default();
        for callback in callbacks {
            callback(&event);
        }
        true
    }

    async fn publish(&self, event: ReplicationEvent) -> bool {
        match event.to_json() {
            Ok(raw) => self.adapter.publish(&self.config.events_channel, &raw).await,
            Err(e) => {
                log::warn!("Cannot encode event for {}: {e}", event.board_id);
                false
            }
        }
    }

    async fn gate(&self, board_id: &str) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().unwrap_or_else(|p| p.into_inner());
            gates.entry(board_id.to_string()).or_default().clone()
        };
        gate.lock_owned().await
    }

    // ─── Accessors ────────────────────────────────────────────────────

    /// Cached actions of `board_id` without touching the store.
    pub async fn snapshot(&self, board_id: &str) -> Option<Vec<Action>> {
        self.cache.read().await.get(board_id).cloned()
    }

    pub async fn undo_stack(&self, board_id: &str) -> Vec<Action> {
        let _gate = self.gate(board_id).await;
        self.load_undo_locked(board_id).await
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn adapter(&self) -> &Arc<PersistenceAdapter> {
        &self.adapter
    }
}
