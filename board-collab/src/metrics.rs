//! Passive node counters for an observability endpoint.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Point-in-time copy of [`Metrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections: u64,
    pub draws: u64,
    pub undos: u64,
    pub redos: u64,
    pub clears: u64,
    pub publishes: u64,
    pub remote_applied: u64,
    pub remote_suppressed: u64,
    pub store_connected: bool,
}

#[derive(Debug, Default)]
pub struct Metrics {
    connections: AtomicU64,
    draws: AtomicU64,
    undos: AtomicU64,
    redos: AtomicU64,
    clears: AtomicU64,
    publishes: AtomicU64,
    remote_applied: AtomicU64,
    remote_suppressed: AtomicU64,
    store_connected: AtomicBool,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        let _ = self
            .connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn record_draw(&self) {
        self.draws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_undo(&self) {
        self.undos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redo(&self) {
        self.redos.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_clear(&self) {
        self.clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_publish(&self) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_applied(&self) {
        self.remote_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_remote_suppressed(&self) {
        self.remote_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_store_connected(&self, connected: bool) {
        self.store_connected.store(connected, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            draws: self.draws.load(Ordering::Relaxed),
            undos: self.undos.load(Ordering::Relaxed),
            redos: self.redos.load(Ordering::Relaxed),
            clears: self.clears.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            remote_applied: self.remote_applied.load(Ordering::Relaxed),
            remote_suppressed: self.remote_suppressed.load(Ordering::Relaxed),
            store_connected: self.store_connected.load(Ordering::Relaxed),
        }
    }
}
