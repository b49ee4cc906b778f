//! Canvas Sync wire protocol.
//!
//! JSON-over-WebSocket, one message per text frame. Typed frames carry a
//! `type` tag (handshake, request/response, initial state sync, ack); mutation
//! events are untagged and recognized by their `tool` + `source` fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{Command, ToolName};
use crate::document::Snapshot;
use crate::error::{Result, SyncError};

/// Wire protocol version, reported by the relay health endpoint.
pub const PROTOCOL_VERSION: u32 = 1;

/// Who originated a mutation event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    LocalUi,
    RemoteAutomation,
}

/// A document mutation travelling between parties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMutation", into = "RawMutation")]
pub struct MutationEvent {
    pub command: Command,
    pub source: EventSource,
}

impl MutationEvent {
    pub fn new(command: Command, source: EventSource) -> Self {
        Self { command, source }
    }

    pub fn local(command: Command) -> Self {
        Self::new(command, EventSource::LocalUi)
    }

    pub fn automation(command: Command) -> Self {
        Self::new(command, EventSource::RemoteAutomation)
    }

    pub fn tool(&self) -> ToolName {
        self.command.tool()
    }
}

#[derive(Serialize, Deserialize)]
struct RawMutation {
    tool: ToolName,
    #[serde(default)]
    args: Value,
    source: EventSource,
}

impl TryFrom<RawMutation> for MutationEvent {
    type Error = SyncError;

    fn try_from(raw: RawMutation) -> Result<Self> {
        Ok(Self {
            command: Command::decode(raw.tool, raw.args)?,
            source: raw.source,
        })
    }
}

impl From<MutationEvent> for RawMutation {
    fn from(event: MutationEvent) -> Self {
        Self {
            tool: event.command.tool(),
            args: event.command.args(),
            source: event.source,
        }
    }
}

/// Asynchronous data queries answered by a party rather than applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactTool {
    /// Rendered image of the canvas; only a live editor can answer.
    GetSnapshot,
    /// Structured snapshot of the document.
    GetDesignSchema,
    /// Persist the document through the external store.
    SaveToCloud,
}

impl ArtifactTool {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GetSnapshot => "get_snapshot",
            Self::GetDesignSchema => "get_design_schema",
            Self::SaveToCloud => "save_to_cloud",
        }
    }
}

impl FromStr for ArtifactTool {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "get_snapshot" => Ok(Self::GetSnapshot),
            "get_design_schema" => Ok(Self::GetDesignSchema),
            "save_to_cloud" => Ok(Self::SaveToCloud),
            other => Err(SyncError::UnknownTool(other.to_string())),
        }
    }
}

impl fmt::Display for ArtifactTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed frames, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frame {
    /// Sent once per connection, right after open.
    Handshake {
        #[serde(rename = "clientRole")]
        client_role: String,
    },

    /// Directed data request; answered by a [`Frame::Response`] with the same id.
    Request {
        tool: String,
        #[serde(default)]
        args: Value,
        #[serde(rename = "requestId")]
        request_id: String,
    },

    Response {
        #[serde(rename = "requestId")]
        request_id: String,
        #[serde(default)]
        payload: Value,
    },

    /// Full-state replace of nodes and background.
    InitialStateSync { payload: Snapshot },

    /// Synchronous acknowledgment of a relayed mutation.
    Ack { tool: String, success: bool },
}

/// Any message that can appear on the connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Envelope {
    Frame(Frame),
    Mutation(MutationEvent),
}

impl Envelope {
    pub fn handshake(role: impl Into<String>) -> Self {
        Self::Frame(Frame::Handshake {
            client_role: role.into(),
        })
    }

    pub fn request(tool: impl Into<String>, args: Value, request_id: impl Into<String>) -> Self {
        Self::Frame(Frame::Request {
            tool: tool.into(),
            args,
            request_id: request_id.into(),
        })
    }

    pub fn response(request_id: impl Into<String>, payload: Value) -> Self {
        Self::Frame(Frame::Response {
            request_id: request_id.into(),
            payload,
        })
    }

    pub fn initial_state(snapshot: Snapshot) -> Self {
        Self::Frame(Frame::InitialStateSync { payload: snapshot })
    }

    pub fn ack(tool: ToolName) -> Self {
        Self::Frame(Frame::Ack {
            tool: tool.to_string(),
            success: true,
        })
    }

    /// Classify and decode a text frame by its shape.
    pub fn decode(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("not JSON: {e}")))?;
        let Some(object) = value.as_object() else {
            return Err(SyncError::Protocol("expected a JSON object".into()));
        };

        if object.contains_key("type") {
            serde_json::from_value(value)
                .map(Self::Frame)
                .map_err(|e| SyncError::Protocol(format!("invalid frame: {e}")))
        } else if object.contains_key("tool") {
            serde_json::from_value(value)
                .map(Self::Mutation)
                .map_err(|e| SyncError::Protocol(format!("invalid mutation event: {e}")))
        } else {
            Err(SyncError::Protocol(
                "message has neither a type nor a tool".into(),
            ))
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Frame(Frame::Handshake { .. }) => "handshake",
            Self::Frame(Frame::Request { .. }) => "request",
            Self::Frame(Frame::Response { .. }) => "response",
            Self::Frame(Frame::InitialStateSync { .. }) => "initial_state_sync",
            Self::Frame(Frame::Ack { .. }) => "ack",
            Self::Mutation(_) => "mutation",
        }
    }
}

impl From<MutationEvent> for Envelope {
    fn from(event: MutationEvent) -> Self {
        Self::Mutation(event)
    }
}

impl From<Frame> for Envelope {
    fn from(frame: Frame) -> Self {
        Self::Frame(frame)
    }
}
