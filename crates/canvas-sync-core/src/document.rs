//! In-memory design document: ordered nodes, background, and design tokens.
//!
//! Both the relay mirror and every client own their own [`Document`]. Merge
//! semantics are property-level overwrite and node-level upsert, so any
//! arrival order of the same events converges to the same node set and
//! property values (paint order may differ).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::debug;

use crate::command::Command;

/// Node id reserved for the canvas background/frame. Never synchronized.
pub const RESERVED_NODE_ID: &str = "workspace";

/// Background color of a fresh document.
pub const DEFAULT_BACKGROUND: &str = "#ffffff";

/// Open property bag of a node (geometry, style, text content, ...).
pub type Properties = serde_json::Map<String, Value>;

/// Returns true for ids that must never be emitted, mirrored, or addressed.
pub fn is_reserved_id(id: &str) -> bool {
    id == RESERVED_NODE_ID
}

/// Properties every kind accepts.
const COMMON_PROPERTIES: &[&str] = &[
    "left",
    "top",
    "width",
    "height",
    "fill",
    "stroke",
    "strokeWidth",
    "opacity",
    "angle",
    "scaleX",
    "scaleY",
    "visible",
    "name",
    "rx",
    "ry",
];

const TEXT_PROPERTIES: &[&str] = &[
    "text",
    "fontSize",
    "fontFamily",
    "fontWeight",
    "fontStyle",
    "textAlign",
    "lineHeight",
];

/// Visual node kind. Unknown kinds are carried through verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum NodeKind {
    Rect,
    Circle,
    Ellipse,
    Triangle,
    Line,
    Text,
    Image,
    Path,
    Group,
    Other(String),
}

impl NodeKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Rect => "rect",
            Self::Circle => "circle",
            Self::Ellipse => "ellipse",
            Self::Triangle => "triangle",
            Self::Line => "line",
            Self::Text => "text",
            Self::Image => "image",
            Self::Path => "path",
            Self::Group => "group",
            Self::Other(kind) => kind,
        }
    }

    /// Whether `key` is an accepted property for this kind.
    pub fn allows(&self, key: &str) -> bool {
        if COMMON_PROPERTIES.contains(&key) {
            return true;
        }
        match self {
            Self::Circle => key == "radius",
            Self::Line => matches!(key, "x1" | "y1" | "x2" | "y2"),
            Self::Text => TEXT_PROPERTIES.contains(&key),
            Self::Image => key == "src",
            Self::Path => key == "path",
            Self::Group => key == "objects",
            Self::Other(_) => key != "id" && key != "type",
            Self::Rect | Self::Ellipse | Self::Triangle => false,
        }
    }
}

impl From<String> for NodeKind {
    fn from(kind: String) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "rect" => Self::Rect,
            "circle" => Self::Circle,
            "ellipse" => Self::Ellipse,
            "triangle" => Self::Triangle,
            "line" => Self::Line,
            "text" | "i-text" | "textbox" => Self::Text,
            "image" => Self::Image,
            "path" => Self::Path,
            "group" => Self::Group,
            _ => Self::Other(kind),
        }
    }
}

impl From<&str> for NodeKind {
    fn from(kind: &str) -> Self {
        Self::from(kind.to_string())
    }
}

impl From<NodeKind> for String {
    fn from(kind: NodeKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recursively merge `patch` into `target`. Objects merge, anything else overwrites.
pub fn deep_merge(target: &mut Properties, patch: &Properties) {
    for (key, value) in patch {
        if let (Some(Value::Object(existing)), Value::Object(incoming)) =
            (target.get_mut(key), value)
        {
            deep_merge(existing, incoming);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

/// A single visual element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub properties: Properties,
    /// Keys the guessed kind does not allow, kept until the real kind arrives.
    #[serde(skip)]
    held: Option<Properties>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: Properties::new(),
            held: None,
        }
    }

    /// A node created by an update before its create: kind is a `rect` guess
    /// and nothing is dropped until [`Node::settle_kind`].
    fn placeholder(id: impl Into<String>, props: &Properties) -> Self {
        let mut node = Self::new(id, NodeKind::Rect);
        node.held = Some(Properties::new());
        node.merge(props);
        node
    }

    /// True while the kind is still a guess.
    pub fn is_placeholder(&self) -> bool {
        self.held.is_some()
    }

    /// Fix the node's kind and apply any properties held back for it.
    pub fn settle_kind(&mut self, kind: NodeKind) {
        self.kind = kind;
        if let Some(held) = self.held.take() {
            self.merge(&held);
        }
    }

    /// Build a node from a property bag, keeping only allowed keys.
    pub fn with_properties(id: impl Into<String>, kind: NodeKind, props: &Properties) -> Self {
        let mut node = Self::new(id, kind);
        node.merge(props);
        node
    }

    /// Merge a patch into this node, dropping keys the kind does not allow.
    ///
    /// A placeholder holds such keys back instead.
    pub fn merge(&mut self, patch: &Properties) {
        let mut allowed = Properties::new();
        let mut deferred = Properties::new();
        for (key, value) in patch {
            if key == "id" || key == "type" {
                continue;
            }
            if self.kind.allows(key) {
                allowed.insert(key.clone(), value.clone());
            } else if self.held.is_some() {
                deferred.insert(key.clone(), value.clone());
            } else {
                debug!(node = %self.id, kind = %self.kind, key = %key, "Dropping disallowed property");
            }
        }
        deep_merge(&mut self.properties, &allowed);
        if let Some(held) = self.held.as_mut() {
            deep_merge(held, &deferred);
        }
    }

    /// Properties including the `id`, as carried by `create_node` events.
    pub fn props_with_id(&self) -> Properties {
        let mut props = self.properties.clone();
        props.insert("id".into(), Value::String(self.id.clone()));
        props
    }

    pub fn position(&self) -> Position {
        Position {
            x: number_or_zero(self.properties.get("left")),
            y: number_or_zero(self.properties.get("top")),
        }
    }

    pub fn is_reserved(&self) -> bool {
        is_reserved_id(&self.id)
    }

    pub fn to_layer(&self) -> Layer {
        Layer {
            id: self.id.clone(),
            kind: self.kind.clone(),
            position: self.position(),
            properties: self.properties.clone(),
        }
    }

    pub fn from_layer(layer: &Layer) -> Self {
        let mut node = Self::with_properties(layer.id.clone(), layer.kind.clone(), &layer.properties);
        node.properties
            .entry("left")
            .or_insert_with(|| Value::Number(layer.position.x.clone()));
        node.properties
            .entry("top")
            .or_insert_with(|| Value::Number(layer.position.y.clone()));
        node
    }
}

fn number_or_zero(value: Option<&Value>) -> Number {
    match value {
        Some(Value::Number(n)) => n.clone(),
        _ => Number::from(0),
    }
}

/// Canvas coordinates of a layer's origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: Number,
    pub y: Number,
}

/// Serialized description of one node inside a [`Snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub position: Position,
    #[serde(default)]
    pub properties: Properties,
}

/// Full dump of a document, used for (re)synchronization and schema queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub layers: Vec<Layer>,
    pub background: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tokens: BTreeMap<String, String>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            layers: Vec::new(),
            background: DEFAULT_BACKGROUND.to_string(),
            tokens: BTreeMap::new(),
        }
    }
}

/// The shared design document.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    nodes: Vec<Node>,
    background: String,
    tokens: BTreeMap<String, String>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            background: DEFAULT_BACKGROUND.to_string(),
            tokens: BTreeMap::new(),
        }
    }

    /// Nodes in paint order (later is drawn on top).
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.node(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn background(&self) -> &str {
        &self.background
    }

    pub fn tokens(&self) -> &BTreeMap<String, String> {
        &self.tokens
    }

    /// Create a node, or on id collision replace its kind and merge the new
    /// properties over the old ones. Returns true if a new node was appended.
    pub fn upsert_node(&mut self, id: &str, kind: NodeKind, props: &Properties) -> bool {
        if id.is_empty() {
            debug!("Ignoring create without node id");
            return false;
        }
        if is_reserved_id(id) {
            debug!(id, "Ignoring create for reserved node id");
            return false;
        }
        match self.nodes.iter_mut().find(|n| n.id == id) {
            Some(existing) => {
                existing.settle_kind(kind);
                existing.merge(props);
                false
            }
            None => {
                self.nodes.push(Node::with_properties(id, kind, props));
                true
            }
        }
    }

    /// Merge properties into a node; a missing node is created from the
    /// properties (kind taken from `props.type`, else a `rect` placeholder
    /// that keeps every key until a create names the kind). Returns true if
    /// the node was created.
    pub fn merge_node(&mut self, id: &str, props: &Properties) -> bool {
        if id.is_empty() {
            debug!("Ignoring update without node id");
            return false;
        }
        if is_reserved_id(id) {
            debug!(id, "Ignoring update for reserved node id");
            return false;
        }
        if let Some(existing) = self.nodes.iter_mut().find(|n| n.id == id) {
            existing.merge(props);
            return false;
        }
        let node = match props.get("type").and_then(|v| v.as_str()) {
            Some(kind) => Node::with_properties(id, NodeKind::from(kind), props),
            None => Node::placeholder(id, props),
        };
        debug!(id, kind = %node.kind, placeholder = node.is_placeholder(), "Upserting node on update");
        self.nodes.push(node);
        true
    }

    /// Insert a fully-formed node (used by surfaces adding nodes).
    pub fn insert_node(&mut self, node: Node) -> bool {
        let Node { id, kind, properties, .. } = node;
        self.upsert_node(&id, kind, &properties)
    }

    /// Remove a node. Missing ids are a no-op.
    pub fn remove_node(&mut self, id: &str) -> bool {
        let before = self.nodes.len();
        self.nodes.retain(|n| n.id != id);
        before != self.nodes.len()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }

    pub fn set_background(&mut self, color: impl Into<String>) {
        self.background = color.into();
    }

    /// Shallow merge into the token map.
    pub fn merge_tokens(&mut self, tokens: &BTreeMap<String, String>) {
        for (name, color) in tokens {
            self.tokens.insert(name.clone(), color.clone());
        }
    }

    /// Resolve a token name to its color; other values pass through.
    pub fn resolve_color<'a>(&'a self, value: &'a str) -> &'a str {
        self.tokens.get(value).map(String::as_str).unwrap_or(value)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            layers: self.nodes.iter().map(Node::to_layer).collect(),
            background: self.background.clone(),
            tokens: self.tokens.clone(),
        }
    }

    /// Replace nodes and background wholesale. Tokens in the snapshot are
    /// merged; an empty token map leaves the current tokens alone.
    pub fn replace_from_snapshot(&mut self, snapshot: &Snapshot) {
        self.nodes = snapshot
            .layers
            .iter()
            .filter(|layer| !is_reserved_id(&layer.id))
            .map(Node::from_layer)
            .collect();
        self.background = snapshot.background.clone();
        self.merge_tokens(&snapshot.tokens);
    }

    /// Apply a command with mirror semantics. Returns true if state changed.
    ///
    /// `apply_theme` is not modelled here; clients resolve it locally.
    pub fn apply_command(&mut self, command: &Command) -> bool {
        match command {
            Command::CreateNode { id, kind, props } => {
                self.upsert_node(id, kind.clone(), props);
                true
            }
            Command::UpdateNode { id, props } => {
                self.merge_node(id, props);
                true
            }
            Command::DeleteNode { id } => self.remove_node(id),
            Command::ClearCanvas => {
                let changed = !self.nodes.is_empty();
                self.clear();
                changed
            }
            Command::SetBackgroundColor { color } => {
                self.set_background(color.clone());
                true
            }
            Command::SetDesignTokens { tokens } => {
                self.merge_tokens(tokens);
                true
            }
            Command::ApplyTheme { .. } => false,
        }
    }
}
