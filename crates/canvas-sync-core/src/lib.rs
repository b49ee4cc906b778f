//! Core types for Canvas Sync: document model, wire protocol, errors, and config.

pub mod command;
pub mod config;
pub mod document;
pub mod error;
pub mod protocol;

pub use command::{Command, ToolName};
pub use document::{Document, Layer, Node, NodeKind, Position, Properties, Snapshot, RESERVED_NODE_ID};
pub use error::{Result, SyncError};
pub use protocol::{ArtifactTool, Envelope, EventSource, Frame, MutationEvent, PROTOCOL_VERSION};
