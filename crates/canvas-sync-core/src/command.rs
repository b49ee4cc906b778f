//! Typed mutation commands keyed by tool name.
//!
//! On the wire a mutation carries `tool` plus a free-form `args` object; here
//! the pair is decoded into a [`Command`] so every consumer works with a
//! checked shape instead of a property bag.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::document::{is_reserved_id, NodeKind, Properties};
use crate::error::{Result, SyncError};

/// Mutation tools understood by every party.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolName {
    CreateNode,
    UpdateNode,
    DeleteNode,
    ClearCanvas,
    ApplyTheme,
    SetBackgroundColor,
    SetDesignTokens,
}

impl ToolName {
    pub const ALL: [ToolName; 7] = [
        Self::CreateNode,
        Self::UpdateNode,
        Self::DeleteNode,
        Self::ClearCanvas,
        Self::ApplyTheme,
        Self::SetBackgroundColor,
        Self::SetDesignTokens,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateNode => "create_node",
            Self::UpdateNode => "update_node",
            Self::DeleteNode => "delete_node",
            Self::ClearCanvas => "clear_canvas",
            Self::ApplyTheme => "apply_theme",
            Self::SetBackgroundColor => "set_background_color",
            Self::SetDesignTokens => "set_design_tokens",
        }
    }
}

impl FromStr for ToolName {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|tool| tool.as_str() == s)
            .ok_or_else(|| SyncError::UnknownTool(s.to_string()))
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded document mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    CreateNode {
        id: String,
        kind: NodeKind,
        props: Properties,
    },
    UpdateNode {
        id: String,
        props: Properties,
    },
    DeleteNode {
        id: String,
    },
    ClearCanvas,
    ApplyTheme {
        colors: Vec<String>,
    },
    SetBackgroundColor {
        color: String,
    },
    SetDesignTokens {
        tokens: BTreeMap<String, String>,
    },
}

#[derive(Deserialize)]
struct CreateNodeArgs {
    #[serde(rename = "type", default)]
    kind: Option<NodeKind>,
    #[serde(default)]
    props: Properties,
}

#[derive(Deserialize)]
struct UpdateNodeArgs {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    props: Properties,
}

#[derive(Deserialize)]
struct DeleteNodeArgs {
    id: String,
}

#[derive(Deserialize)]
struct ApplyThemeArgs {
    colors: Vec<String>,
}

#[derive(Deserialize)]
struct SetBackgroundArgs {
    color: String,
}

#[derive(Deserialize)]
struct SetTokensArgs {
    tokens: BTreeMap<String, String>,
}

fn parse_args<T: serde::de::DeserializeOwned>(tool: ToolName, args: Value) -> Result<T> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| SyncError::InvalidArgs {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

fn checked_id(tool: ToolName, id: Option<String>) -> Result<String> {
    match id {
        Some(id) if is_reserved_id(&id) => Err(SyncError::ReservedId(id)),
        Some(id) if !id.is_empty() => Ok(id),
        _ => Err(SyncError::InvalidArgs {
            tool: tool.to_string(),
            message: "a non-empty node id is required".into(),
        }),
    }
}

fn string_prop(props: &Properties, key: &str) -> Option<String> {
    props.get(key).and_then(|v| v.as_str()).map(String::from)
}

impl Command {
    /// Decode wire `args` for the given tool.
    pub fn decode(tool: ToolName, args: Value) -> Result<Self> {
        match tool {
            ToolName::CreateNode => {
                let CreateNodeArgs { kind, mut props } = parse_args(tool, args)?;
                let id = checked_id(tool, string_prop(&props, "id"))?;
                let kind = kind
                    .or_else(|| string_prop(&props, "type").map(NodeKind::from))
                    .unwrap_or(NodeKind::Rect);
                props.remove("id");
                props.remove("type");
                Ok(Self::CreateNode { id, kind, props })
            }
            ToolName::UpdateNode => {
                let UpdateNodeArgs { id, mut props } = parse_args(tool, args)?;
                let id = checked_id(tool, id.or_else(|| string_prop(&props, "id")))?;
                props.remove("id");
                Ok(Self::UpdateNode { id, props })
            }
            ToolName::DeleteNode => {
                let DeleteNodeArgs { id } = parse_args(tool, args)?;
                let id = checked_id(tool, Some(id))?;
                Ok(Self::DeleteNode { id })
            }
            ToolName::ClearCanvas => Ok(Self::ClearCanvas),
            ToolName::ApplyTheme => {
                let ApplyThemeArgs { colors } = parse_args(tool, args)?;
                Ok(Self::ApplyTheme { colors })
            }
            ToolName::SetBackgroundColor => {
                let SetBackgroundArgs { color } = parse_args(tool, args)?;
                Ok(Self::SetBackgroundColor { color })
            }
            ToolName::SetDesignTokens => {
                let SetTokensArgs { tokens } = parse_args(tool, args)?;
                Ok(Self::SetDesignTokens { tokens })
            }
        }
    }

    /// Decode from a tool name string, rejecting unknown tools.
    pub fn parse(tool: &str, args: Value) -> Result<Self> {
        Self::decode(tool.parse()?, args)
    }

    pub fn tool(&self) -> ToolName {
        match self {
            Self::CreateNode { .. } => ToolName::CreateNode,
            Self::UpdateNode { .. } => ToolName::UpdateNode,
            Self::DeleteNode { .. } => ToolName::DeleteNode,
            Self::ClearCanvas => ToolName::ClearCanvas,
            Self::ApplyTheme { .. } => ToolName::ApplyTheme,
            Self::SetBackgroundColor { .. } => ToolName::SetBackgroundColor,
            Self::SetDesignTokens { .. } => ToolName::SetDesignTokens,
        }
    }

    /// Encode back into wire `args`.
    pub fn args(&self) -> Value {
        match self {
            Self::CreateNode { id, kind, props } => {
                let mut props = props.clone();
                props.insert("id".into(), Value::String(id.clone()));
                json!({ "type": kind, "props": props })
            }
            Self::UpdateNode { id, props } => json!({ "id": id, "props": props }),
            Self::DeleteNode { id } => json!({ "id": id }),
            Self::ClearCanvas => json!({}),
            Self::ApplyTheme { colors } => json!({ "colors": colors }),
            Self::SetBackgroundColor { color } => json!({ "color": color }),
            Self::SetDesignTokens { tokens } => json!({ "tokens": tokens }),
        }
    }

    /// The node this command addresses, if any.
    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::CreateNode { id, .. } | Self::UpdateNode { id, .. } | Self::DeleteNode { id } => {
                Some(id.as_str())
            }
            _ => None,
        }
    }
}
