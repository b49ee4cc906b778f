//! Rendering surface contract and an in-memory reference surface.
//!
//! A surface owns the local document. It reports every node added, modified,
//! or removed to its subscribed observers, whether the change came from the
//! user or from a programmatic operation; the sync adapter decides what to
//! forward.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

use canvas_sync_core::{Document, Node, Properties, Snapshot};

/// What happened to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A programmatic change requested of the surface.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeOperation {
    /// Add a node; an existing node with the same id is merged instead.
    Add(Node),
    /// Merge properties into a node, creating it when missing.
    Modify { id: String, props: Properties },
    /// Remove a node; missing ids are a no-op.
    Remove { id: String },
    Clear,
    SetBackground(String),
    MergeTokens(BTreeMap<String, String>),
    /// Replace nodes and background wholesale.
    Replace(Snapshot),
}

/// Receives node changes from a surface.
///
/// Called synchronously from inside the surface, before an added node is
/// stored, so an observer may fill in a missing id.
pub trait LocalEditObserver: Send + Sync {
    fn on_local_edit(&self, node: &mut Node, change: ChangeKind);
}

/// The editor a client synchronizes.
#[async_trait]
pub trait EditorSurface: Send + Sync + 'static {
    /// Full description of the current document.
    fn document_snapshot(&self) -> Snapshot;

    fn node(&self, id: &str) -> Option<Node>;

    fn apply_operation(&mut self, op: NodeOperation);

    /// Render the canvas and return it as a data URL.
    async fn render_to_image(&self) -> anyhow::Result<String>;

    fn subscribe(&mut self, observer: Arc<dyn LocalEditObserver>);
}

/// Surface backed by a [`Document`], for headless clients and tests.
#[derive(Default)]
pub struct MemorySurface {
    document: Document,
    observers: Vec<Arc<dyn LocalEditObserver>>,
}

impl MemorySurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    /// Simulate the user drawing a node.
    pub fn user_add(&mut self, node: Node) {
        self.apply_operation(NodeOperation::Add(node));
    }

    /// Simulate the user moving or restyling a node.
    pub fn user_modify(&mut self, id: &str, props: Properties) {
        self.apply_operation(NodeOperation::Modify {
            id: id.to_string(),
            props,
        });
    }

    /// Simulate the user deleting a node.
    pub fn user_remove(&mut self, id: &str) {
        self.apply_operation(NodeOperation::Remove { id: id.to_string() });
    }

    fn notify(&self, node: &mut Node, change: ChangeKind) {
        for observer in &self.observers {
            observer.on_local_edit(node, change);
        }
    }
}

#[async_trait]
impl EditorSurface for MemorySurface {
    fn document_snapshot(&self) -> Snapshot {
        self.document.snapshot()
    }

    fn node(&self, id: &str) -> Option<Node> {
        self.document.node(id).cloned()
    }

    fn apply_operation(&mut self, op: NodeOperation) {
        match op {
            NodeOperation::Add(mut node) => {
                if self.document.contains(&node.id) {
                    self.document
                        .upsert_node(&node.id, node.kind.clone(), &node.properties);
                    if let Some(mut merged) = self.node(&node.id) {
                        self.notify(&mut merged, ChangeKind::Modified);
                    }
                } else {
                    self.notify(&mut node, ChangeKind::Added);
                    self.document.insert_node(node);
                }
            }
            NodeOperation::Modify { id, props } => {
                let created = self.document.merge_node(&id, &props);
                if let Some(mut node) = self.node(&id) {
                    let change = if created {
                        ChangeKind::Added
                    } else {
                        ChangeKind::Modified
                    };
                    self.notify(&mut node, change);
                }
            }
            NodeOperation::Remove { id } => {
                if let Some(mut node) = self.node(&id) {
                    self.document.remove_node(&id);
                    self.notify(&mut node, ChangeKind::Removed);
                }
            }
            NodeOperation::Clear => self.document.clear(),
            NodeOperation::SetBackground(color) => self.document.set_background(color),
            NodeOperation::MergeTokens(tokens) => self.document.merge_tokens(&tokens),
            NodeOperation::Replace(snapshot) => {
                self.document.replace_from_snapshot(&snapshot);
                debug!(nodes = self.document.len(), "Surface replaced from snapshot");
            }
        }
    }

    async fn render_to_image(&self) -> anyhow::Result<String> {
        let bytes = serde_json::to_vec(&self.document.snapshot())?;
        Ok(format!("data:application/json;base64,{}", STANDARD.encode(bytes)))
    }

    fn subscribe(&mut self, observer: Arc<dyn LocalEditObserver>) {
        self.observers.push(observer);
    }
}
