//! Client sync adapter: joins a local editor surface to the relay.
//!
//! Remote mutations are replayed into the surface with the replay flag set,
//! so the local-edit observer never sends them back out. Local edits are
//! turned into mutation events and queued on the current connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use canvas_sync_core::config::ClientConfig;
use canvas_sync_core::{
    ArtifactTool, Command, Envelope, Frame, MutationEvent, Node, Properties, Snapshot,
};

use crate::store::SnapshotStore;
use crate::surface::{ChangeKind, EditorSurface, LocalEditObserver, NodeOperation};

const OUTBOX_CAPACITY: usize = 256;

/// State shared between the adapter and the observer it registers.
#[derive(Default)]
struct Link {
    replaying: AtomicBool,
    outbox: StdMutex<Option<mpsc::Sender<String>>>,
}

impl Link {
    fn attach(&self, tx: mpsc::Sender<String>) {
        *self.outbox.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
    }

    fn detach(&self) {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    fn is_connected(&self) -> bool {
        self.outbox
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    /// Queue a frame on the open connection. Returns false when offline.
    fn send(&self, frame: String) -> bool {
        let outbox = self.outbox.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = outbox.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                warn!(%e, "Dropping outbound frame");
                false
            }
        }
    }

    /// Send a mutation that originated locally, unless a remote replay is in progress.
    fn send_local(&self, command: Command) -> bool {
        if self.is_replaying() {
            debug!(tool = %command.tool(), "Suppressing echo of remote mutation");
            return false;
        }
        if !self.is_connected() {
            debug!(tool = %command.tool(), "Offline, local edit not sent");
            return false;
        }
        match Envelope::from(MutationEvent::local(command)).encode() {
            Ok(frame) => self.send(frame),
            Err(e) => {
                warn!(%e, "Failed to encode local edit");
                false
            }
        }
    }
}

/// Clears the replay flag when a replay finishes or is abandoned.
struct ReplayGuard<'a>(&'a AtomicBool);

impl<'a> ReplayGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Observer registered on the surface; turns node changes into mutation events.
struct LocalEditForwarder {
    link: Arc<Link>,
}

impl LocalEditObserver for LocalEditForwarder {
    fn on_local_edit(&self, node: &mut Node, change: ChangeKind) {
        if node.id.is_empty() {
            node.id = Uuid::new_v4().to_string();
        }
        if node.is_reserved() {
            return;
        }

        let command = match change {
            ChangeKind::Added => Command::CreateNode {
                id: node.id.clone(),
                kind: node.kind.clone(),
                props: node.properties.clone(),
            },
            ChangeKind::Modified => Command::UpdateNode {
                id: node.id.clone(),
                props: node.properties.clone(),
            },
            ChangeKind::Removed => Command::DeleteNode {
                id: node.id.clone(),
            },
        };
        self.link.send_local(command);
    }
}

/// Keeps one editor surface in sync with the relay.
pub struct SyncAdapter<S: EditorSurface> {
    surface: Arc<Mutex<S>>,
    config: ClientConfig,
    store: Option<Arc<dyn SnapshotStore>>,
    link: Arc<Link>,
}

impl<S: EditorSurface> SyncAdapter<S> {
    pub fn new(mut surface: S, config: ClientConfig, store: Option<Arc<dyn SnapshotStore>>) -> Self {
        let link = Arc::new(Link::default());
        surface.subscribe(Arc::new(LocalEditForwarder { link: link.clone() }));
        Self {
            surface: Arc::new(Mutex::new(surface)),
            config,
            store,
            link,
        }
    }

    pub fn surface(&self) -> &Arc<Mutex<S>> {
        &self.surface
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn is_replaying(&self) -> bool {
        self.link.is_replaying()
    }

    /// Apply a mutation received from the relay without re-emitting it.
    pub async fn apply_remote(&self, event: &MutationEvent) {
        let _replay = ReplayGuard::set(&self.link.replaying);
        self.execute_command(&event.command).await;
        // Admit side effects scheduled by the surface in the same tick.
        tokio::task::yield_now().await;
        debug!(tool = %event.tool(), source = ?event.source, "Applied remote mutation");
    }

    /// Apply a command to the surface. Used for both remote and local commands.
    pub async fn execute_command(&self, command: &Command) {
        let mut surface = self.surface.lock().await;
        match command {
            Command::CreateNode { id, kind, props } => {
                surface.apply_operation(NodeOperation::Add(Node::with_properties(
                    id.clone(),
                    kind.clone(),
                    props,
                )));
            }
            Command::UpdateNode { id, props } => {
                surface.apply_operation(NodeOperation::Modify {
                    id: id.clone(),
                    props: props.clone(),
                });
            }
            Command::DeleteNode { id } => {
                surface.apply_operation(NodeOperation::Remove { id: id.clone() });
            }
            Command::ClearCanvas => surface.apply_operation(NodeOperation::Clear),
            Command::SetBackgroundColor { color } => {
                surface.apply_operation(NodeOperation::SetBackground(color.clone()));
            }
            Command::SetDesignTokens { tokens } => {
                surface.apply_operation(NodeOperation::MergeTokens(tokens.clone()));
            }
            Command::ApplyTheme { colors } => {
                if colors.is_empty() {
                    return;
                }
                let snapshot = surface.document_snapshot();
                for (i, layer) in snapshot.layers.iter().enumerate() {
                    let color = &colors[i % colors.len()];
                    let fill = snapshot.tokens.get(color).unwrap_or(color);
                    let mut props = Properties::new();
                    props.insert("fill".into(), Value::String(fill.clone()));
                    surface.apply_operation(NodeOperation::Modify {
                        id: layer.id.clone(),
                        props,
                    });
                }
            }
        }
    }

    /// Run a command issued by the local user.
    ///
    /// Node-level changes reach the relay through the surface observer;
    /// document-level ones are sent here.
    pub async fn execute_local(&self, command: Command) {
        self.execute_command(&command).await;
        if matches!(
            command,
            Command::ClearCanvas
                | Command::SetBackgroundColor { .. }
                | Command::SetDesignTokens { .. }
        ) {
            self.link.send_local(command);
        }
    }

    /// Answer an artifact request. The response always carries `request_id`.
    pub async fn handle_data_request(&self, tool: &str, args: &Value, request_id: &str) -> Envelope {
        let payload = match tool.parse::<ArtifactTool>() {
            Ok(ArtifactTool::GetSnapshot) => {
                let surface = self.surface.lock().await;
                match surface.render_to_image().await {
                    Ok(image) => json!({ "image": image }),
                    Err(e) => {
                        warn!(request_id, %e, "Render failed");
                        json!({ "error": e.to_string() })
                    }
                }
            }
            Ok(ArtifactTool::GetDesignSchema) => {
                let snapshot = self.surface.lock().await.document_snapshot();
                serde_json::to_value(snapshot)
                    .unwrap_or_else(|e| json!({ "error": e.to_string() }))
            }
            Ok(ArtifactTool::SaveToCloud) => self.save(args).await,
            Err(e) => e.to_payload(),
        };
        Envelope::response(request_id, payload)
    }

    async fn save(&self, args: &Value) -> Value {
        let Some(store) = &self.store else {
            return json!({ "error": "no snapshot store configured" });
        };
        let name = args.get("name").and_then(Value::as_str);
        let id = args.get("id").and_then(Value::as_str);
        let snapshot = self.surface.lock().await.document_snapshot();
        match store.save(name, id, &snapshot).await {
            Ok(id) => {
                info!(id = %id, "Document saved");
                json!({ "status": "saved", "id": id })
            }
            Err(e) => {
                warn!(%e, "Save failed");
                json!({ "error": e.to_string() })
            }
        }
    }

    /// Handle one inbound text frame from the relay.
    pub async fn handle_message(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%e, "Dropping malformed message");
                return;
            }
        };

        match envelope {
            Envelope::Mutation(event) => self.apply_remote(&event).await,
            Envelope::Frame(Frame::Request { tool, args, request_id }) => {
                let response = self.handle_data_request(&tool, &args, &request_id).await;
                match response.encode() {
                    Ok(frame) => {
                        if !self.link.send(frame) {
                            warn!(request_id = %request_id, "Could not queue response");
                        }
                    }
                    Err(e) => warn!(request_id = %request_id, %e, "Failed to encode response"),
                }
            }
            Envelope::Frame(Frame::InitialStateSync { payload }) => {
                self.replace_document(payload).await;
            }
            Envelope::Frame(Frame::Response { request_id, .. }) => {
                debug!(request_id = %request_id, "Response for another party");
            }
            Envelope::Frame(Frame::Ack { tool, success }) => {
                debug!(tool = %tool, success, "Mutation acknowledged");
            }
            Envelope::Frame(Frame::Handshake { client_role }) => {
                debug!(role = %client_role, "Peer handshake");
            }
        }
    }

    async fn replace_document(&self, snapshot: Snapshot) {
        let _replay = ReplayGuard::set(&self.link.replaying);
        let layers = snapshot.layers.len();
        self.surface
            .lock()
            .await
            .apply_operation(NodeOperation::Replace(snapshot));
        info!(layers, "Local document replaced from peer state");
    }

    /// Stay connected to the relay until `cancel` fires.
    ///
    /// A failed or closed connection is retried after the configured interval.
    pub async fn run(&self, cancel: CancellationToken) {
        let url = self.config.relay_url.clone();
        let interval = self.config.reconnect_interval();

        loop {
            match self.connect_once(&url, &cancel).await {
                Ok(()) => info!(url = %url, "Disconnected from relay"),
                Err(e) => error!(url = %url, %e, "Relay connection failed"),
            }
            self.link.detach();

            if cancel.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    debug!(url = %url, "Reconnecting");
                }
            }
        }
        info!("Sync adapter stopped");
    }

    async fn connect_once(&self, url: &str, cancel: &CancellationToken) -> anyhow::Result<()> {
        let (ws, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = connect_async(url) => result?,
        };
        let (mut write, mut read) = ws.split();

        let (tx, mut rx) = mpsc::channel::<String>(OUTBOX_CAPACITY);
        // Attach before capturing state so no edit falls between the two.
        self.link.attach(tx);

        let handshake = Envelope::handshake(&self.config.role).encode()?;
        write.send(Message::Text(handshake.into())).await?;
        let snapshot = self.surface.lock().await.document_snapshot();
        let layers = snapshot.layers.len();
        let initial = Envelope::initial_state(snapshot).encode()?;
        write.send(Message::Text(initial.into())).await?;
        info!(url, role = %self.config.role, layers, "Connected to relay");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    write.send(Message::Close(None)).await.ok();
                    return Ok(());
                }
                Some(frame) = rx.recv() => {
                    write.send(Message::Text(frame.into())).await?;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_message(text.as_str()).await,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}
