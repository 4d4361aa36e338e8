//! Frames received on the backend's event socket.
//!
//! Every text frame is an envelope `{"type": ..., "data": {...}}`.
//! [`ServerMessage::parse`] decodes the envelope kinds this client acts
//! on; anything else is a parse error the caller logs and skips.

use serde::Deserialize;

/// A decoded event-socket frame.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Queue depth broadcast, not tied to a prompt.
    Status(StatusPayload),
    ExecutionStart(PromptScoped),
    ExecutionCached(CachedPayload),
    /// `node: None` marks the end of the prompt.
    Executing(ExecutingPayload),
    Progress(ProgressPayload),
    Executed(ExecutedPayload),
    ExecutionError(ErrorPayload),
    ExecutionInterrupted(InterruptedPayload),
    /// Sent by newer servers next to the final `executing`.
    ExecutionSuccess(PromptScoped),
}

impl ServerMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusPayload {
    pub status: StatusBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusBody {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload that only names its prompt.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptScoped {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedPayload {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingPayload {
    pub prompt_id: String,
    pub node: Option<String>,
}

/// Sampler step progress inside one node.
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressPayload {
    pub value: i32,
    pub max: i32,
    /// Absent on older servers.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedPayload {
    pub prompt_id: String,
    pub node: String,
    /// Node-specific output map; images live under `images`.
    pub output: serde_json::Value,
}

impl ExecutedPayload {
    /// Images listed under `output.images`, in server order.
    ///
    /// Entries that do not match the expected `{filename, subfolder,
    /// type}` shape are skipped.
    pub fn images(&self) -> Vec<ImageRef> {
        let Some(entries) = self.output.get("images").and_then(|v| v.as_array()) else {
            return Vec::new();
        };
        entries
            .iter()
            .filter_map(|entry| ImageRef::deserialize(entry).ok())
            .collect()
    }
}

/// Location of an artifact on the server, as reported by `executed`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// Storage area: `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_image_kind")]
    pub kind: String,
}

fn default_image_kind() -> String {
    "output".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorPayload {
    pub prompt_id: String,
    pub exception_message: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedPayload {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn parse(text: &str) -> ServerMessage {
        ServerMessage::parse(text).unwrap()
    }

    #[test]
    fn status_frame_carries_queue_depth() {
        let msg = parse(
            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":2}},"sid":"s1"}}"#,
        );
        assert_matches!(msg, ServerMessage::Status(s) if s.status.exec_info.queue_remaining == 2);
    }

    #[test]
    fn lifecycle_frames_name_their_prompt() {
        assert_matches!(
            parse(r#"{"type":"execution_start","data":{"prompt_id":"p-7"}}"#),
            ServerMessage::ExecutionStart(p) if p.prompt_id == "p-7"
        );
        assert_matches!(
            parse(r#"{"type":"execution_cached","data":{"prompt_id":"p-7","nodes":["1","4"]}}"#),
            ServerMessage::ExecutionCached(c) if c.nodes == ["1", "4"]
        );
        assert_matches!(
            parse(r#"{"type":"execution_success","data":{"prompt_id":"p-7","timestamp":1}}"#),
            ServerMessage::ExecutionSuccess(p) if p.prompt_id == "p-7"
        );
    }

    #[test]
    fn cached_nodes_default_to_empty() {
        assert_matches!(
            parse(r#"{"type":"execution_cached","data":{"prompt_id":"p"}}"#),
            ServerMessage::ExecutionCached(c) if c.nodes.is_empty()
        );
    }

    #[test]
    fn executing_null_node_is_completion() {
        assert_matches!(
            parse(r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#),
            ServerMessage::Executing(ExecutingPayload { node: None, .. })
        );
        assert_matches!(
            parse(r#"{"type":"executing","data":{"node":"12","display_node":"12","prompt_id":"p"}}"#),
            ServerMessage::Executing(ExecutingPayload { node: Some(n), .. }) if n == "12"
        );
    }

    #[test]
    fn progress_prompt_id_is_optional() {
        assert_matches!(
            parse(r#"{"type":"progress","data":{"value":3,"max":20}}"#),
            ServerMessage::Progress(ProgressPayload { prompt_id: None, value: 3, max: 20 })
        );
        assert_matches!(
            parse(r#"{"type":"progress","data":{"value":3,"max":20,"prompt_id":"p","node":"3"}}"#),
            ServerMessage::Progress(ProgressPayload { prompt_id: Some(_), .. })
        );
    }

    #[test]
    fn executed_images_keep_server_order() {
        let msg = parse(
            r#"{"type":"executed","data":{"node":"9","prompt_id":"p","output":{"images":[
                {"filename":"tryon_00001_.png","subfolder":"","type":"output"},
                {"filename":"preview.png","subfolder":"previews","type":"temp"},
                {"unexpected":true}
            ]}}}"#,
        );
        let ServerMessage::Executed(executed) = msg else {
            panic!("not an executed frame");
        };
        let images = executed.images();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].filename, "tryon_00001_.png");
        assert_eq!(
            images[1],
            ImageRef {
                filename: "preview.png".into(),
                subfolder: "previews".into(),
                kind: "temp".into(),
            }
        );
    }

    #[test]
    fn executed_without_images_yields_nothing() {
        let msg = parse(r#"{"type":"executed","data":{"node":"9","prompt_id":"p","output":{"text":["ok"]}}}"#);
        assert_matches!(msg, ServerMessage::Executed(e) if e.images().is_empty());
    }

    #[test]
    fn image_ref_fills_defaults() {
        let image: ImageRef = serde_json::from_str(r#"{"filename":"x.png"}"#).unwrap();
        assert_eq!(image.subfolder, "");
        assert_eq!(image.kind, "output");
    }

    #[test]
    fn error_frame_keeps_backend_details() {
        let msg = parse(
            r#"{"type":"execution_error","data":{"prompt_id":"p","node_id":"12","node_type":"KSampler",
                "exception_message":"CUDA out of memory","exception_type":"torch.OutOfMemoryError","traceback":[]}}"#,
        );
        let ServerMessage::ExecutionError(err) = msg else {
            panic!("not an error frame");
        };
        assert_eq!(err.exception_message, "CUDA out of memory");
        assert_eq!(err.node_id.as_deref(), Some("12"));
        assert_eq!(err.exception_type.as_deref(), Some("torch.OutOfMemoryError"));
    }

    #[test]
    fn interrupted_frame_parses() {
        assert_matches!(
            parse(r#"{"type":"execution_interrupted","data":{"prompt_id":"p","node_id":"5","executed":[]}}"#),
            ServerMessage::ExecutionInterrupted(i) if i.node_id.as_deref() == Some("5")
        );
    }

    #[test]
    fn unknown_kinds_and_garbage_are_errors() {
        assert!(ServerMessage::parse(r#"{"type":"crystools.monitor","data":{"cpu":3}}"#).is_err());
        assert!(ServerMessage::parse("{truncated").is_err());
        assert!(ServerMessage::parse(r#"{"type":"executing"}"#).is_err());
    }
}
