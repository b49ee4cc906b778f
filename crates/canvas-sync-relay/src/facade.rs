//! Automation facade: tool-style operations over the relay.
//!
//! Mutating tools are applied to the mirror and broadcast tagged as
//! `remote_automation`. `get_design_schema` reads the mirror directly;
//! `get_snapshot` needs a live editor and round-trips through the bus.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, info};
use uuid::Uuid;

use canvas_sync_core::{
    ArtifactTool, Command, Envelope, MutationEvent, NodeKind, Properties, Result, Snapshot,
    SyncError, ToolName,
};

use crate::state::RelayState;

/// Handle used by automation callers (HTTP routes, tests, embedding code).
#[derive(Clone)]
pub struct Automation {
    state: Arc<RelayState>,
}

impl Automation {
    pub fn new(state: Arc<RelayState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &Arc<RelayState> {
        &self.state
    }

    /// Every tool name accepted by [`Automation::invoke`].
    pub fn tool_names() -> Vec<&'static str> {
        ToolName::ALL
            .iter()
            .map(ToolName::as_str)
            .chain([
                ArtifactTool::GetDesignSchema.as_str(),
                ArtifactTool::GetSnapshot.as_str(),
                ArtifactTool::SaveToCloud.as_str(),
            ])
            .collect()
    }

    /// Dispatch a tool by name with JSON arguments.
    pub async fn invoke(&self, tool: &str, args: Value) -> Result<Value> {
        debug!(tool, "Invoking automation tool");

        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let result = self.invoke_inner(tool, args).await;

        #[cfg(feature = "metrics")]
        crate::metrics::record_tool_call(tool, start.elapsed().as_secs_f64());

        result
    }

    async fn invoke_inner(&self, tool: &str, args: Value) -> Result<Value> {
        match tool {
            "create_node" => {
                let command = Command::decode(ToolName::CreateNode, with_generated_id(args))?;
                let id = command.target_id().unwrap_or_default().to_string();
                self.apply(command).await?;
                Ok(json!({ "id": id }))
            }
            "get_design_schema" => Ok(serde_json::to_value(self.get_design_schema().await)?),
            "get_snapshot" => self.get_snapshot().await,
            "save_to_cloud" => {
                let name = string_arg(&args, "name");
                let id = string_arg(&args, "id");
                self.save_to_cloud(name, id).await
            }
            _ => {
                let command = Command::parse(tool, args)?;
                self.apply(command).await?;
                Ok(json!({ "success": true }))
            }
        }
    }

    /// Apply a decoded command and broadcast it. Returns the number of
    /// connections the event was queued for.
    pub async fn apply(&self, command: Command) -> Result<usize> {
        self.state
            .invoke_command(MutationEvent::automation(command))
            .await
    }

    /// Create a node; an id is generated when `props` carries none.
    pub async fn create_node(&self, kind: NodeKind, props: Properties) -> Result<String> {
        let args = with_generated_id(json!({ "type": kind, "props": props }));
        let command = Command::decode(ToolName::CreateNode, args)?;
        let id = command.target_id().unwrap_or_default().to_string();
        self.apply(command).await?;
        Ok(id)
    }

    pub async fn update_node(&self, id: &str, props: Properties) -> Result<()> {
        let command = Command::decode(ToolName::UpdateNode, json!({ "id": id, "props": props }))?;
        self.apply(command).await?;
        Ok(())
    }

    pub async fn delete_node(&self, id: &str) -> Result<()> {
        let command = Command::decode(ToolName::DeleteNode, json!({ "id": id }))?;
        self.apply(command).await?;
        Ok(())
    }

    pub async fn clear_canvas(&self) -> Result<()> {
        self.apply(Command::ClearCanvas).await?;
        Ok(())
    }

    pub async fn apply_theme(&self, colors: Vec<String>) -> Result<()> {
        self.apply(Command::ApplyTheme { colors }).await?;
        Ok(())
    }

    pub async fn set_design_tokens(&self, tokens: BTreeMap<String, String>) -> Result<()> {
        self.apply(Command::SetDesignTokens { tokens }).await?;
        Ok(())
    }

    pub async fn set_background_color(&self, color: impl Into<String>) -> Result<()> {
        self.apply(Command::SetBackgroundColor {
            color: color.into(),
        })
        .await?;
        Ok(())
    }

    /// Structured snapshot of the mirror. No round trip.
    pub async fn get_design_schema(&self) -> Snapshot {
        self.state.snapshot().await
    }

    /// Rendered image from a connected editor, or a timeout error.
    pub async fn get_snapshot(&self) -> Result<Value> {
        let timeout = self.state.config.request_timeout();
        self.state
            .request_artifact(ArtifactTool::GetSnapshot, json!({}), timeout)
            .await
    }

    /// Ask connected editors to persist their document. Does not wait for the
    /// outcome; the caller gets the request id to correlate later responses.
    pub async fn save_to_cloud(&self, name: Option<String>, id: Option<String>) -> Result<Value> {
        let request_id = Uuid::new_v4().to_string();
        let mut args = serde_json::Map::new();
        if let Some(name) = name {
            args.insert("name".into(), Value::String(name));
        }
        if let Some(id) = id {
            args.insert("id".into(), Value::String(id));
        }

        let frame = Envelope::request(
            ArtifactTool::SaveToCloud.as_str(),
            Value::Object(args),
            &request_id,
        )
        .encode()?;
        let recipients = self.state.forward(None, &frame).await;
        info!(request_id = %request_id, recipients, "Save requested");

        Ok(json!({
            "status": "requested",
            "requestId": request_id,
            "recipients": recipients,
        }))
    }
}

/// Fill in `props.id` with a fresh UUID when it is missing or empty.
fn with_generated_id(args: Value) -> Value {
    let mut args = if args.is_null() { json!({}) } else { args };
    if let Some(object) = args.as_object_mut() {
        let props = object.entry("props").or_insert_with(|| json!({}));
        if let Some(props) = props.as_object_mut() {
            let missing = props
                .get("id")
                .and_then(Value::as_str)
                .is_none_or(str::is_empty);
            if missing {
                props.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
            }
        }
    }
    args
}

fn string_arg(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(String::from)
}

/// HTTP status class for a facade error.
pub fn error_status(err: &SyncError) -> u16 {
    match err {
        SyncError::UnknownTool(_) => 404,
        SyncError::InvalidArgs { .. } | SyncError::ReservedId(_) => 400,
        SyncError::Timeout { .. } => 504,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_sync_core::config::RelayConfig;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn automation() -> Automation {
        Automation::new(Arc::new(RelayState::new(RelayConfig::default())))
    }

    fn props(value: Value) -> Properties {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn test_create_then_schema_then_delete() {
        let auto = automation();
        let id = auto
            .create_node(NodeKind::Rect, props(json!({"id": "r1", "left": 50, "top": 50})))
            .await
            .unwrap();
        assert_eq!(id, "r1");

        let schema = serde_json::to_value(auto.get_design_schema().await).unwrap();
        assert_eq!(schema["layers"].as_array().unwrap().len(), 1);
        assert_eq!(schema["layers"][0]["id"], "r1");
        assert_eq!(schema["layers"][0]["type"], "rect");
        assert_eq!(schema["layers"][0]["position"], json!({"x": 50, "y": 50}));

        auto.delete_node("r1").await.unwrap();
        assert!(auto.get_design_schema().await.layers.is_empty());
    }

    #[tokio::test]
    async fn test_invoke_create_generates_id() {
        let auto = automation();
        let result = auto
            .invoke("create_node", json!({"type": "circle", "props": {"radius": 3}}))
            .await
            .unwrap();
        let id = result["id"].as_str().unwrap();
        assert!(!id.is_empty());
        assert!(auto.state().hub.lock().await.mirror.contains(id));
    }

    #[tokio::test]
    async fn test_invoke_unknown_tool() {
        let err = automation().invoke("explode", json!({})).await.unwrap_err();
        assert!(matches!(err, SyncError::UnknownTool(ref t) if t == "explode"));
        assert_eq!(error_status(&err), 404);
    }

    #[tokio::test]
    async fn test_workspace_is_not_addressable() {
        let auto = automation();
        let err = auto
            .invoke("update_node", json!({"id": "workspace", "props": {"fill": "red"}}))
            .await
            .unwrap_err();
        assert_eq!(error_status(&err), 400);
        assert!(auto.get_design_schema().await.layers.is_empty());
    }

    #[tokio::test]
    async fn test_mutating_tools_broadcast_as_automation() {
        let auto = automation();
        let (tx, mut rx) = mpsc::channel(8);
        auto.state().register("editor", tx).await;

        let result = auto
            .invoke("set_background_color", json!({"color": "#101010"}))
            .await
            .unwrap();
        assert_eq!(result, json!({"success": true}));

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["tool"], "set_background_color");
        assert_eq!(frame["source"], "remote_automation");
        assert_eq!(auto.get_design_schema().await.background, "#101010");
    }

    #[tokio::test]
    async fn test_get_snapshot_round_trip() {
        let auto = automation();
        let (tx, mut rx) = mpsc::channel(8);
        auto.state().register("editor", tx).await;

        let state = auto.state().clone();
        tokio::spawn(async move {
            let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            let request_id = frame["requestId"].as_str().unwrap().to_string();
            let payload = json!({"image": "data:image/png;base64,AAAA"});
            let text = Envelope::response(&request_id, payload.clone()).encode().unwrap();
            state.resolve_response("editor", &request_id, payload, &text).await;
        });

        let image = tokio::time::timeout(Duration::from_secs(2), auto.get_snapshot())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(image["image"], "data:image/png;base64,AAAA");
    }

    #[tokio::test]
    async fn test_save_to_cloud_is_fire_and_forget() {
        let auto = automation();
        let (tx, mut rx) = mpsc::channel(8);
        auto.state().register("editor", tx).await;

        let result = auto
            .save_to_cloud(Some("poster".into()), None)
            .await
            .unwrap();
        assert_eq!(result["status"], "requested");
        assert_eq!(result["recipients"], 1);

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "REQUEST");
        assert_eq!(frame["tool"], "save_to_cloud");
        assert_eq!(frame["args"]["name"], "poster");
        assert_eq!(frame["requestId"], result["requestId"]);
        assert!(auto.state().pending.is_empty());
    }

    #[test]
    fn test_tool_names_cover_everything() {
        let names = Automation::tool_names();
        assert_eq!(names.len(), 10);
        assert!(names.contains(&"apply_theme"));
        assert!(names.contains(&"get_snapshot"));
    }
}
