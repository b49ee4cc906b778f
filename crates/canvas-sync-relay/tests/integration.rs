//! Relay integration tests: start a real relay and interact via WS + HTTP.
//!
//! Run with: `cargo test -p canvas-sync-relay --test integration`

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use canvas_sync_core::config::RelayConfig;
use canvas_sync_relay::RelayState;

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay in the background and return its state + port.
async fn start_test_relay() -> (Arc<RelayState>, u16) {
    let port = find_free_port();
    let config = RelayConfig {
        port,
        request_timeout_secs: 1,
        ..RelayConfig::default()
    };
    let state = Arc::new(RelayState::new(config));

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = canvas_sync_relay::start_relay(state_clone).await;
    });

    // Wait for relay to be ready
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }

    (state, port)
}

async fn connect(port: u16, role: &str) -> Ws {
    let url = format!("ws://127.0.0.1:{port}/ws");
    let (mut ws, _) = connect_async(&url).await.expect("WS connect failed");
    let handshake = json!({"type": "HANDSHAKE", "clientRole": role});
    ws.send(Message::Text(handshake.to_string().into()))
        .await
        .unwrap();
    ws
}

/// Block until the relay has registered `count` connections.
async fn wait_for_connections(state: &RelayState, count: usize) {
    for _ in 0..50 {
        if state.connection_count().await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("relay never reached {count} connections");
}

async fn next_json(ws: &mut Ws) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for a frame")
        .unwrap()
        .unwrap();
    serde_json::from_str(msg.to_text().unwrap()).unwrap()
}

async fn post_tool(port: u16, tool: &str, args: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/tools/{tool}"))
        .json(&args)
        .send()
        .await
        .expect("tool request failed");
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn test_health_endpoint() {
    let (_state, port) = start_test_relay().await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
    assert_eq!(body["protocol"], 1);
    assert_eq!(body["connections"], 0);
    assert_eq!(body["nodes"], 0);
}

#[tokio::test]
async fn test_tools_listing() {
    let (_state, port) = start_test_relay().await;

    let body: Value = reqwest::get(format!("http://127.0.0.1:{port}/tools"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let tools = body["tools"].as_array().unwrap();
    assert!(tools.contains(&json!("create_node")));
    assert!(tools.contains(&json!("get_design_schema")));
}

#[tokio::test]
async fn test_mutation_reaches_peers_but_not_sender() {
    let (state, port) = start_test_relay().await;
    let mut editor = connect(port, "editor").await;
    let mut viewer = connect(port, "editor").await;
    wait_for_connections(&state, 2).await;

    let event = json!({
        "tool": "create_node",
        "args": {"type": "rect", "props": {"id": "r1", "left": 10, "top": 20}},
        "source": "local_ui",
    });
    editor
        .send(Message::Text(event.to_string().into()))
        .await
        .unwrap();

    let relayed = next_json(&mut viewer).await;
    assert_eq!(relayed, event);

    let echo = tokio::time::timeout(Duration::from_millis(300), editor.next()).await;
    assert!(echo.is_err(), "sender must not receive its own event");
    assert_eq!(state.node_count().await, 1);

    editor.close(None).await.ok();
    viewer.close(None).await.ok();
}

#[tokio::test]
async fn test_automation_end_to_end() {
    let (state, port) = start_test_relay().await;
    let mut editor = connect(port, "editor").await;
    wait_for_connections(&state, 1).await;

    let (status, body) = post_tool(
        port,
        "create_node",
        json!({"type": "rect", "props": {"id": "r1", "left": 50, "top": 50}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(body["id"], "r1");

    let frame = next_json(&mut editor).await;
    assert_eq!(frame["tool"], "create_node");
    assert_eq!(frame["source"], "remote_automation");

    let (status, schema) = post_tool(port, "get_design_schema", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(
        schema["layers"],
        json!([{
            "id": "r1",
            "type": "rect",
            "position": {"x": 50, "y": 50},
            "properties": {"left": 50, "top": 50},
        }])
    );

    let (status, _) = post_tool(port, "delete_node", json!({"id": "r1"})).await;
    assert_eq!(status, 200);
    let (_, schema) = post_tool(port, "get_design_schema", json!({})).await;
    assert_eq!(schema["layers"], json!([]));

    editor.close(None).await.ok();
}

#[tokio::test]
async fn test_tool_errors_map_to_status() {
    let (_state, port) = start_test_relay().await;

    let (status, body) = post_tool(port, "explode", json!({})).await;
    assert_eq!(status, 404);
    assert!(body["error"].as_str().unwrap().contains("explode"));

    let (status, body) = post_tool(port, "delete_node", json!({"id": "workspace"})).await;
    assert_eq!(status, 400);
    assert!(body["error"].is_string());

    let (status, _) = post_tool(port, "set_background_color", json!({"colour": "red"})).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_get_snapshot_times_out_without_editor() {
    let (_state, port) = start_test_relay().await;

    let start = std::time::Instant::now();
    let (status, body) = post_tool(port, "get_snapshot", json!({})).await;
    assert!(start.elapsed() >= Duration::from_secs(1));
    assert_eq!(status, 504);
    assert!(body["error"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_get_snapshot_answered_by_editor() {
    let (state, port) = start_test_relay().await;
    let mut editor = connect(port, "editor").await;
    wait_for_connections(&state, 1).await;

    let responder = tokio::spawn(async move {
        let request = next_json(&mut editor).await;
        assert_eq!(request["type"], "REQUEST");
        assert_eq!(request["tool"], "get_snapshot");
        let response = json!({
            "type": "RESPONSE",
            "requestId": request["requestId"],
            "payload": {"image": "data:image/png;base64,iVBOR"},
        });
        editor
            .send(Message::Text(response.to_string().into()))
            .await
            .unwrap();
        editor
    });

    let (status, body) = post_tool(port, "get_snapshot", json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(body["image"], "data:image/png;base64,iVBOR");

    let mut editor = responder.await.unwrap();
    editor.close(None).await.ok();
    assert!(state.pending.is_empty());
}
