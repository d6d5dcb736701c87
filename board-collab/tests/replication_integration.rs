//! Multi-node replication over a shared in-process store.

use std::sync::Arc;
use std::time::Duration;

use board_collab::{EventRouter, MemoryBackend, NodeConfig, ReplicationService};
use board_core::{keys, Action, Command, EventType, Tool};
use serde_json::json;
use tokio::time::timeout;

async fn node(id: &str, backend: &MemoryBackend) -> Arc<ReplicationService> {
    let service = ReplicationService::new(NodeConfig::with_node_id(id), Arc::new(backend.clone()));
    assert!(service.start().await);
    service
}

fn stroke(board: &str, user: &str, draw_id: &str) -> Command {
    Command::new(
        board,
        Action::new(Tool::Pen, user)
            .with_draw_id(draw_id)
            .with_field("d", json!([1, 2, 3, 4])),
    )
}

/// Poll until `node`'s cached copy of `board` has `len` actions.
async fn converge(node: &ReplicationService, board: &str, len: usize) -> bool {
    for _ in 0..100 {
        if node.snapshot(board).await.map(|s| s.len()) == Some(len) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_three_nodes_converge() {
    let backend = MemoryBackend::new();
    let nodes = [
        node("a", &backend).await,
        node("b", &backend).await,
        node("c", &backend).await,
    ];

    nodes[0].handle_events_and_data(stroke("board", "alice", "1")).await;
    assert!(converge(&nodes[1], "board", 1).await);
    nodes[1].handle_events_and_data(stroke("board", "bob", "2")).await;
    assert!(converge(&nodes[2], "board", 2).await);
    nodes[2].handle_events_and_data(stroke("board", "carol", "3")).await;

    for n in &nodes {
        assert!(converge(n, "board", 3).await, "node {} diverged", n.node_id());
    }
    let stored = board_core::decode_actions(&backend_list(&backend, &keys::actions("board")).await);
    assert_eq!(Some(stored), nodes[0].snapshot("board").await);
}

async fn backend_list(backend: &MemoryBackend, key: &str) -> Vec<String> {
    use board_collab::Backend;
    backend.get_all(key).await.unwrap()
}

#[tokio::test]
async fn test_clear_propagates() {
    let backend = MemoryBackend::new();
    let a = node("a", &backend).await;
    let b = node("b", &backend).await;

    a.handle_events_and_data(stroke("board", "alice", "1")).await;
    assert!(converge(&b, "board", 1).await);

    b.handle_events_and_data(Command::clear("board")).await;
    let mut cleared = false;
    for _ in 0..100 {
        if a.snapshot("board").await.is_none() {
            cleared = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(cleared);
    assert!(a.load_stored_data("board").await.is_empty());
}

#[tokio::test]
async fn test_store_outage_and_recovery() {
    let backend = MemoryBackend::new();
    let a = node("a", &backend).await;

    backend.set_available(false);
    a.handle_events_and_data(stroke("board", "alice", "1")).await;
    assert_eq!(a.snapshot("board").await.map(|s| s.len()), Some(1));
    assert!(!a.adapter().is_ready());
    assert!(!a.metrics().snapshot().store_connected);

    backend.set_available(true);
    assert!(a.adapter().connect().await);
    a.handle_events_and_data(stroke("board", "alice", "2")).await;
    // The write made during the outage never reached the store
    assert_eq!(backend_list(&backend, &keys::actions("board")).await.len(), 1);
}

#[tokio::test]
async fn test_reconnect_task_restores_readiness() {
    let backend = MemoryBackend::new();
    backend.set_available(false);
    let service = ReplicationService::new(NodeConfig::with_node_id("a"), Arc::new(backend.clone()));
    assert!(!service.start().await);
    let task = service.adapter().spawn_reconnect(Duration::from_millis(10));

    backend.set_available(true);
    let mut ready = false;
    for _ in 0..100 {
        if service.adapter().is_ready() {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    task.abort();
    assert!(ready);
}

#[tokio::test]
async fn test_heartbeat_marks_node_alive() {
    let backend = MemoryBackend::new();
    let service = node("beating", &backend).await;
    let task = service.spawn_heartbeat(Duration::from_millis(10), Duration::from_secs(5));
    tokio::time::sleep(Duration::from_millis(50)).await;
    task.abort();

    use board_collab::Backend;
    assert!(backend.get(&keys::node_alive("beating")).await.unwrap().is_some());
}

#[tokio::test]
async fn test_maintenance_tasks_follow_config() {
    let backend = MemoryBackend::new();
    backend.set_available(false);
    let mut config = NodeConfig::with_node_id("kept");
    config.reconnect_interval = Duration::from_millis(10);
    config.heartbeat_interval = Duration::from_millis(10);
    config.heartbeat_ttl = Duration::from_secs(5);
    let service = ReplicationService::new(config, Arc::new(backend.clone()));
    assert!(!service.start().await);
    let tasks = service.spawn_maintenance();
    assert_eq!(tasks.len(), 2);

    backend.set_available(true);
    use board_collab::Backend;
    let mut alive = false;
    for _ in 0..100 {
        if service.adapter().is_ready()
            && backend.get(&keys::node_alive("kept")).await.unwrap().is_some()
        {
            alive = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for task in tasks {
        task.abort();
    }
    assert!(alive);
}

#[tokio::test]
async fn test_router_delivers_remote_events_to_clients() {
    let backend = MemoryBackend::new();
    let writer = node("writer", &backend).await;
    let reader = node("reader", &backend).await;
    let router = EventRouter::attach(reader.clone());

    let mirror = router.read_only_id("board").await;
    let mut viewer = router.join(&mirror).await;
    let mut editor = router.join("board").await;

    writer.handle_events_and_data(stroke("board", "alice", "1")).await;

    let event = timeout(Duration::from_secs(2), editor.recv()).await.unwrap().unwrap();
    assert_eq!(event.kind, EventType::Update);
    assert_eq!(event.node_id, "writer");
    let event = timeout(Duration::from_secs(2), viewer.recv()).await.unwrap().unwrap();
    assert_eq!(event.data.as_ref().map(|d| d.len()), Some(1));
    assert_eq!(router.board_for_read_only(&mirror).await.as_deref(), Some("board"));
}

#[tokio::test]
async fn test_concurrent_boards_are_independent() {
    let backend = MemoryBackend::new();
    let service = node("a", &backend).await;

    let tasks: Vec<_> = (0..8)
        .map(|board| {
            let service = service.clone();
            tokio::spawn(async move {
                let board = format!("board-{board}");
                for i in 0..10 {
                    service
                        .handle_events_and_data(stroke(&board, "alice", &i.to_string()))
                        .await;
                }
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap();
    }

    for board in 0..8 {
        let board = format!("board-{board}");
        assert_eq!(service.load_stored_data(&board).await.len(), 10);
    }
}
