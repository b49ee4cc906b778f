//! Relay shared state: the authoritative mirror, the connection registry, and
//! the pending-request table.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use canvas_sync_core::config::RelayConfig;
use canvas_sync_core::{ArtifactTool, Document, Envelope, MutationEvent, Result, Snapshot, SyncError};

use crate::events::{broadcast_frame, send_to};
use crate::pending::{PendingGuard, PendingRequests};

/// Per-connection state.
pub struct ConnectionState {
    pub conn_id: String,
    pub role: Option<String>,
    pub tx: mpsc::Sender<String>,
}

impl ConnectionState {
    pub fn new(conn_id: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            conn_id,
            role: None,
            tx,
        }
    }
}

/// Mirror and registry behind one lock, so applying an event and fanning it
/// out happen as a unit and every connection sees mirror order.
#[derive(Default)]
pub struct Hub {
    pub mirror: Document,
    pub connections: HashMap<String, ConnectionState>,
}

/// Shared relay state accessible from all connections and handlers.
///
/// The mirror starts empty when the relay starts and is reset wholesale by
/// every `INITIAL_STATE_SYNC`.
pub struct RelayState {
    pub config: RelayConfig,
    pub hub: Mutex<Hub>,
    pub pending: PendingRequests,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            hub: Mutex::new(Hub::default()),
            pending: PendingRequests::new(),
        }
    }

    /// Register a connection. Nothing is pushed to it; the peer syncs explicitly.
    pub async fn register(&self, conn_id: &str, tx: mpsc::Sender<String>) {
        let mut hub = self.hub.lock().await;
        hub.connections
            .insert(conn_id.to_string(), ConnectionState::new(conn_id.to_string(), tx));
        info!(conn_id, connections = hub.connections.len(), "Connection registered");
    }

    pub async fn unregister(&self, conn_id: &str) {
        let mut hub = self.hub.lock().await;
        hub.connections.remove(conn_id);
        info!(conn_id, connections = hub.connections.len(), "Connection removed");
    }

    /// Drop every registered connection. Each writer then closes its socket.
    pub async fn disconnect_all(&self) -> usize {
        let mut hub = self.hub.lock().await;
        let closed = hub.connections.len();
        hub.connections.clear();
        info!(closed, "Disconnected all peers");
        closed
    }

    pub async fn record_role(&self, conn_id: &str, role: &str) {
        let mut hub = self.hub.lock().await;
        if let Some(conn) = hub.connections.get_mut(conn_id) {
            conn.role = Some(role.to_string());
        }
        info!(conn_id, role, "Peer handshake");
    }

    /// Apply a mutation to the mirror and forward `frame` to everyone but `origin`.
    ///
    /// When acknowledgments are enabled and the event came from a peer, an
    /// `ACK` is queued back to that peer.
    pub async fn relay_mutation(&self, origin: Option<&str>, event: &MutationEvent, frame: &str) -> usize {
        let mut hub = self.hub.lock().await;
        hub.mirror.apply_command(&event.command);
        let sent = broadcast_frame(&mut hub, frame, origin);

        if let (Some(conn_id), true) = (origin, self.config.acknowledge_mutations) {
            match Envelope::ack(event.tool()).encode() {
                Ok(ack) => {
                    if !send_to(&hub, conn_id, &ack) {
                        warn!(conn_id, "Failed to queue mutation ack");
                    }
                }
                Err(e) => warn!(%e, "Failed to encode mutation ack"),
            }
        }

        #[cfg(feature = "metrics")]
        crate::metrics::record_mutation(event.tool().as_str());

        debug!(tool = %event.tool(), source = ?event.source, sent, "Relayed mutation");
        sent
    }

    /// Apply an automation command and broadcast it to every connection.
    pub async fn invoke_command(&self, event: MutationEvent) -> Result<usize> {
        let frame = Envelope::from(event.clone()).encode()?;
        Ok(self.relay_mutation(None, &event, &frame).await)
    }

    /// Replace the mirror wholesale from a full snapshot push.
    pub async fn replace_mirror(&self, snapshot: &Snapshot) {
        let mut hub = self.hub.lock().await;
        hub.mirror.replace_from_snapshot(snapshot);
        info!(nodes = hub.mirror.len(), "Mirror replaced from initial state sync");
    }

    /// Resolve a pending request and fan the response out to other parties.
    pub async fn resolve_response(
        &self,
        origin: &str,
        request_id: &str,
        payload: Value,
        frame: &str,
    ) -> bool {
        let resolved = self.pending.resolve(request_id, payload);
        if !resolved {
            debug!(request_id, "Response for unknown or expired request");
        }

        let mut hub = self.hub.lock().await;
        broadcast_frame(&mut hub, frame, Some(origin));
        resolved
    }

    /// Forward a frame to every connection except `origin`.
    pub async fn forward(&self, origin: Option<&str>, frame: &str) -> usize {
        let mut hub = self.hub.lock().await;
        broadcast_frame(&mut hub, frame, origin)
    }

    /// Ask connected parties for an artifact and wait for the first response.
    ///
    /// Fails with [`SyncError::Timeout`] if nothing answers within `timeout`,
    /// including when no party is connected at all.
    pub async fn request_artifact(
        &self,
        tool: ArtifactTool,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let rx = self.pending.insert(&request_id, tool, timeout);
        let _guard = PendingGuard {
            table: &self.pending,
            request_id: request_id.clone(),
        };

        let frame = Envelope::request(tool.as_str(), args, &request_id).encode()?;
        let sent = self.forward(None, &frame).await;
        debug!(request_id = %request_id, %tool, sent, "Artifact request broadcast");

        #[cfg(feature = "metrics")]
        crate::metrics::record_artifact_request(tool.as_str());

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(SyncError::Transport(format!(
                "request {request_id} for {tool} was dropped"
            ))),
            Err(_) => {
                warn!(request_id = %request_id, %tool, "Artifact request timed out");
                #[cfg(feature = "metrics")]
                crate::metrics::record_artifact_timeout(tool.as_str());
                Err(SyncError::Timeout {
                    tool: tool.to_string(),
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
        }
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.hub.lock().await.mirror.snapshot()
    }

    pub async fn connection_count(&self) -> usize {
        self.hub.lock().await.connections.len()
    }

    pub async fn node_count(&self) -> usize {
        self.hub.lock().await.mirror.len()
    }
}
