//! WebSocket connection lifecycle and inbound message classification.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use canvas_sync_core::{Envelope, Frame};

use crate::state::RelayState;

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<RelayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let (tx, mut rx) = mpsc::channel::<String>(state.config.outbound_buffer.max(1));

    state.register(&conn_id, tx).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_connect();

    // Spawn writer task
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(Message::Text(msg.into())).await.is_err() {
                return;
            }
        }
        // Sender dropped by the relay: tell the peer we are going away.
        ws_tx.send(Message::Close(None)).await.ok();
    });

    // Main read loop
    while let Some(msg_result) = ws_rx.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                on_message(&state, &conn_id, text.as_str()).await;
            }
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Peer requested close");
                break;
            }
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
            _ => {}
        }
    }

    send_task.abort();
    state.unregister(&conn_id).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_ws_disconnect();

    info!(conn_id = %conn_id, "WebSocket connection closed");
}

/// Classify one inbound text frame and act on it.
///
/// Malformed input is logged and dropped; the connection stays open.
pub async fn on_message(state: &RelayState, conn_id: &str, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(conn_id, %e, "Dropping malformed message");
            #[cfg(feature = "metrics")]
            crate::metrics::record_error("protocol");
            return;
        }
    };

    debug!(conn_id, kind = envelope.kind(), "Inbound message");

    match envelope {
        Envelope::Mutation(event) => {
            state.relay_mutation(Some(conn_id), &event, text).await;
        }
        Envelope::Frame(Frame::Handshake { client_role }) => {
            state.record_role(conn_id, &client_role).await;
        }
        Envelope::Frame(Frame::InitialStateSync { payload }) => {
            state.replace_mirror(&payload).await;
        }
        Envelope::Frame(Frame::Response { request_id, payload }) => {
            state.resolve_response(conn_id, &request_id, payload, text).await;
        }
        Envelope::Frame(Frame::Request { tool, request_id, .. }) => {
            // A peer asking other peers for an artifact; the relay only routes it.
            let sent = state.forward(Some(conn_id), text).await;
            debug!(conn_id, tool = %tool, request_id = %request_id, sent, "Forwarded peer request");
        }
        Envelope::Frame(Frame::Ack { tool, .. }) => {
            debug!(conn_id, tool = %tool, "Ignoring ack from peer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_sync_core::config::RelayConfig;
    use canvas_sync_core::ArtifactTool;
    use serde_json::{json, Value};
    use std::time::Duration;

    async fn relay_with(ids: &[&str]) -> (Arc<RelayState>, Vec<mpsc::Receiver<String>>) {
        let state = Arc::new(RelayState::new(RelayConfig::default()));
        let mut receivers = Vec::new();
        for id in ids {
            let (tx, rx) = mpsc::channel(16);
            state.register(id, tx).await;
            receivers.push(rx);
        }
        (state, receivers)
    }

    #[tokio::test]
    async fn test_mutation_relayed_to_all_but_sender() {
        let (state, mut rxs) = relay_with(&["a", "b", "c"]).await;
        let text = r#"{"tool":"create_node","args":{"type":"rect","props":{"id":"r1","left":1}},"source":"local_ui"}"#;
        on_message(&state, "a", text).await;

        assert!(rxs[0].try_recv().is_err());
        assert_eq!(rxs[1].try_recv().unwrap(), text);
        assert_eq!(rxs[2].try_recv().unwrap(), text);
        assert_eq!(state.node_count().await, 1);
    }

    #[tokio::test]
    async fn test_malformed_message_is_dropped() {
        let (state, mut rxs) = relay_with(&["a", "b"]).await;
        on_message(&state, "a", "{not json").await;
        on_message(&state, "a", r#"{"tool":"create_node","args":{},"source":"local_ui"}"#).await;
        assert!(rxs[1].try_recv().is_err());
        assert_eq!(state.node_count().await, 0);
        assert_eq!(state.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_initial_state_sync_replaces_mirror() {
        let (state, _rxs) = relay_with(&["a"]).await;
        on_message(
            &state,
            "a",
            r#"{"tool":"create_node","args":{"props":{"id":"old"}},"source":"local_ui"}"#,
        )
        .await;

        let sync = json!({
            "type": "INITIAL_STATE_SYNC",
            "payload": {
                "layers": [{"id": "fresh", "type": "circle", "position": {"x": 3, "y": 4}}],
                "background": "#222222"
            }
        });
        on_message(&state, "a", &sync.to_string()).await;

        let snapshot = state.snapshot().await;
        assert_eq!(snapshot.layers.len(), 1);
        assert_eq!(snapshot.layers[0].id, "fresh");
        assert_eq!(snapshot.background, "#222222");
    }

    #[tokio::test]
    async fn test_handshake_records_role() {
        let (state, _rxs) = relay_with(&["a"]).await;
        on_message(&state, "a", r#"{"type":"HANDSHAKE","clientRole":"editor"}"#).await;
        let hub = state.hub.lock().await;
        assert_eq!(hub.connections["a"].role.as_deref(), Some("editor"));
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_by_id() {
        let (state, mut rxs) = relay_with(&["editor"]).await;

        let spawn_request = |tag: &'static str| {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .request_artifact(ArtifactTool::GetSnapshot, json!({"tag": tag}), Duration::from_secs(5))
                    .await
            })
        };
        let first = spawn_request("first");
        let second = spawn_request("second");

        let mut requests = Vec::new();
        for _ in 0..2 {
            let frame: Value = serde_json::from_str(&rxs[0].recv().await.unwrap()).unwrap();
            assert_eq!(frame["type"], "REQUEST");
            requests.push((
                frame["requestId"].as_str().unwrap().to_string(),
                frame["args"]["tag"].clone(),
            ));
        }
        assert_ne!(requests[0].0, requests[1].0);

        // Answer in reverse order; each payload echoes the tag of its own request.
        for (id, tag) in requests.iter().rev() {
            let response = json!({"type": "RESPONSE", "requestId": id, "payload": {"tag": tag}});
            on_message(&state, "editor", &response.to_string()).await;
        }

        assert_eq!(first.await.unwrap().unwrap()["tag"], "first");
        assert_eq!(second.await.unwrap().unwrap()["tag"], "second");
        assert!(state.pending.is_empty());
    }
}
