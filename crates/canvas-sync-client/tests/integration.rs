//! Client integration tests: two adapters joined through a real relay.
//!
//! Run with: `cargo test -p canvas-sync-client --test integration`

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use canvas_sync_client::{EditorSurface, MemorySurface, SyncAdapter};
use canvas_sync_core::config::{ClientConfig, RelayConfig};
use canvas_sync_core::{Node, NodeKind};
use canvas_sync_relay::{Automation, RelayState};

struct Harness {
    relay: Arc<RelayState>,
    port: u16,
    cancel: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl Harness {
    /// Shut the relay down and wait until its listener is released.
    async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(server) = self.server.take() {
            server.await.unwrap();
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_relay() -> Harness {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    start_relay_on(listener).await
}

async fn start_relay_on(listener: TcpListener) -> Harness {
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(RelayState::new(RelayConfig {
        port,
        request_timeout_secs: 2,
        ..RelayConfig::default()
    }));
    let cancel = CancellationToken::new();

    let state = relay.clone();
    let shutdown = cancel.clone();
    let server = tokio::spawn(async move {
        let _ = canvas_sync_relay::serve(listener, state, async move {
            shutdown.cancelled().await;
        })
        .await;
    });

    Harness {
        relay,
        port,
        cancel,
        server: Some(server),
    }
}

fn spawn_client(harness: &Harness) -> Arc<SyncAdapter<MemorySurface>> {
    spawn_client_with(harness.port, harness.cancel.child_token())
}

fn spawn_client_with(port: u16, cancel: CancellationToken) -> Arc<SyncAdapter<MemorySurface>> {
    let config = ClientConfig {
        relay_url: format!("ws://127.0.0.1:{port}/ws"),
        reconnect_interval_secs: 1,
        ..ClientConfig::default()
    };
    let adapter = Arc::new(SyncAdapter::new(MemorySurface::new(), config, None));
    let runner = adapter.clone();
    tokio::spawn(async move { runner.run(cancel).await });
    adapter
}

/// Poll a condition until it holds or four seconds pass.
macro_rules! eventually {
    ($cond:expr) => {{
        let mut held = false;
        for _ in 0..200 {
            if $cond {
                held = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        held
    }};
}

/// Wait until every client is connected and its initial state push has landed.
async fn wait_until_joined(harness: &Harness, clients: &[&Arc<SyncAdapter<MemorySurface>>]) {
    let count = clients.len();
    assert!(
        eventually!(harness.relay.connection_count().await == count),
        "relay never reached {count} connections"
    );
    assert!(eventually!(clients.iter().all(|c| c.is_connected())));
    // Each join replaces the mirror; let those pushes settle before mutating.
    tokio::time::sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_local_edit_reaches_other_client() {
    let harness = start_relay().await;
    let alice = spawn_client(&harness);
    let bob = spawn_client(&harness);
    wait_until_joined(&harness, &[&alice, &bob]).await;

    alice.surface().lock().await.user_add(Node::with_properties(
        "r1",
        NodeKind::Rect,
        json!({"left": 12, "fill": "#333333"}).as_object().unwrap(),
    ));

    assert!(
        eventually!(bob.surface().lock().await.node("r1").is_some()),
        "edit never reached the other client"
    );
    let node = bob.surface().lock().await.node("r1").unwrap();
    assert_eq!(node.properties["fill"], "#333333");
    assert_eq!(harness.relay.node_count().await, 1);

    bob.surface().lock().await.user_remove("r1");
    assert!(eventually!(alice.surface().lock().await.node("r1").is_none()));
    assert!(eventually!(harness.relay.node_count().await == 0));
}

#[tokio::test]
async fn test_automation_reaches_clients_and_schema() {
    let harness = start_relay().await;
    let editor = spawn_client(&harness);
    wait_until_joined(&harness, &[&editor]).await;

    let automation = Automation::new(harness.relay.clone());
    let result = automation
        .invoke(
            "create_node",
            json!({"type": "rect", "props": {"id": "r1", "left": 50, "top": 50}}),
        )
        .await
        .unwrap();
    assert_eq!(result["id"], "r1");

    assert!(eventually!(editor.surface().lock().await.node("r1").is_some()));

    let schema = serde_json::to_value(automation.get_design_schema().await).unwrap();
    assert_eq!(schema["layers"].as_array().unwrap().len(), 1);
    assert_eq!(schema["layers"][0]["id"], "r1");
    assert_eq!(schema["layers"][0]["type"], "rect");
    assert_eq!(schema["layers"][0]["position"], json!({"x": 50, "y": 50}));

    automation.delete_node("r1").await.unwrap();
    assert!(automation.get_design_schema().await.layers.is_empty());
    assert!(eventually!(editor.surface().lock().await.document().is_empty()));
}

#[tokio::test]
async fn test_get_snapshot_answered_by_connected_editor() {
    let harness = start_relay().await;
    let editor = spawn_client(&harness);
    wait_until_joined(&harness, &[&editor]).await;

    let automation = Automation::new(harness.relay.clone());
    let image = automation.get_snapshot().await.unwrap();
    assert!(
        image["image"]
            .as_str()
            .unwrap()
            .starts_with("data:application/json;base64,")
    );
    assert!(harness.relay.pending.is_empty());
}

#[tokio::test]
async fn test_client_reconnects_and_resyncs_new_relay() {
    let mut first = start_relay().await;
    let port = first.port;
    let client_cancel = CancellationToken::new();
    let editor = spawn_client_with(port, client_cancel.clone());
    wait_until_joined(&first, &[&editor]).await;

    editor.surface().lock().await.user_add(Node::with_properties(
        "t1",
        NodeKind::Text,
        json!({"text": "kept", "fontSize": 18}).as_object().unwrap(),
    ));
    assert!(eventually!(first.relay.node_count().await == 1));

    first.stop().await;
    assert!(
        eventually!(!editor.is_connected()),
        "client never noticed the relay going away"
    );

    // A fresh relay on the same port starts with an empty mirror.
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let second = start_relay_on(listener).await;
    assert_eq!(second.relay.node_count().await, 0);

    assert!(
        eventually!(second.relay.connection_count().await == 1),
        "client never reconnected"
    );
    assert!(eventually!(second.relay.node_count().await == 1));

    let schema = second.relay.snapshot().await;
    assert_eq!(schema.layers[0].id, "t1");
    assert_eq!(schema.layers[0].properties["text"], "kept");
    assert_eq!(schema.layers[0].properties["fontSize"], 18);

    client_cancel.cancel();
}
