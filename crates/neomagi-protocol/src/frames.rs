use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client → Server request.
/// Wire: `{ "type": "req", "id": "abc", "method": "chat.send", "params": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Server → Client response.
/// Wire: `{ "type": "res", "id": "abc", "ok": true, "payload": {...} }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

impl ResFrame {
    pub fn ok(id: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            frame_type: "res".to_string(),
            id: id.into(),
            ok: true,
            payload: Some(serde_json::to_value(payload).unwrap_or(Value::Null)),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, code: &str, message: &str) -> Self {
        Self {
            frame_type: "res".to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(ErrorShape {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

/// Server → Client unsolicited push event.
/// Wire: `{ "type": "event", "event": "tick", "payload": {...}, "seq": 42 }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_version: Option<StateVersion>,
}

impl EventFrame {
    pub fn new(event: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            frame_type: "event".to_string(),
            event: event.into(),
            payload: Some(serde_json::to_value(payload).unwrap_or(Value::Null)),
            seq: None,
            state_version: None,
        }
    }

    pub fn with_seq(mut self, seq: u64) -> Self {
        self.seq = Some(seq);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateVersion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<u64>,
}

/// Server → Client streamed text chunk for an in-flight `chat.send`.
/// Wire: `{ "type": "stream_chunk", "id": "abc", "data": { "content": "...", "done": false } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunkFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub data: StreamChunkData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunkData {
    pub content: String,
    pub done: bool,
}

impl StreamChunkFrame {
    pub fn new(id: impl Into<String>, content: impl Into<String>, done: bool) -> Self {
        Self {
            frame_type: "stream_chunk".to_string(),
            id: id.into(),
            data: StreamChunkData { content: content.into(), done },
        }
    }
}

/// Server → Client announcement that a tool call is about to run.
/// Wire: `{ "type": "tool_call", "id": "abc", "data": { "tool_name": "...", "arguments": {...}, "call_id": "..." } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub data: ToolCallData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallData {
    pub tool_name: String,
    pub arguments: Value,
    pub call_id: String,
}

impl ToolCallFrame {
    pub fn new(id: impl Into<String>, tool_name: impl Into<String>, arguments: Value, call_id: impl Into<String>) -> Self {
        Self {
            frame_type: "tool_call".to_string(),
            id: id.into(),
            data: ToolCallData { tool_name: tool_name.into(), arguments, call_id: call_id.into() },
        }
    }
}

/// Server → Client announcement that a tool call was blocked before it ran.
/// Wire: `{ "type": "tool_denied", "id": "abc", "data": { "call_id", "tool_name", "mode", "error_code", "message", "next_action" } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeniedFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub data: ToolDeniedData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDeniedData {
    pub call_id: String,
    pub tool_name: String,
    pub mode: String,
    pub error_code: String,
    pub message: String,
    pub next_action: String,
}

impl ToolDeniedFrame {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        mode: impl Into<String>,
        error_code: impl Into<String>,
        message: impl Into<String>,
        next_action: impl Into<String>,
    ) -> Self {
        Self {
            frame_type: "tool_denied".to_string(),
            id: id.into(),
            data: ToolDeniedData {
                call_id: call_id.into(),
                tool_name: tool_name.into(),
                mode: mode.into(),
                error_code: error_code.into(),
                message: message.into(),
                next_action: next_action.into(),
            },
        }
    }
}

/// Server → Client terminal error for a request, carrying the originating id.
/// Wire: `{ "type": "error", "id": "abc", "error": { "code": "...", "message": "..." } }`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub id: String,
    pub error: ErrorShape,
}

impl ErrorFrame {
    pub fn new(id: impl Into<String>, code: &str, message: &str) -> Self {
        Self {
            frame_type: "error".to_string(),
            id: id.into(),
            error: ErrorShape { code: code.to_string(), message: message.to_string() },
        }
    }
}

/// Raw inbound frame — parse the `type` discriminator first, then extract body.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, Value>,
}

impl InboundFrame {
    /// Try to interpret this frame as a client request. Accepts both the
    /// gateway's internal `"req"` (connect/ping/agent.status) and the
    /// external `"request"` envelope (`chat.send`/`chat.history`) — both
    /// carry the same `{id, method, params}` body.
    pub fn as_req(&self) -> Option<ReqFrame> {
        if self.frame_type != "req" && self.frame_type != "request" {
            return None;
        }
        let mut map = self.rest.clone();
        map.insert("type".to_string(), Value::String(self.frame_type.clone()));
        serde_json::from_value(Value::Object(map)).ok()
    }
}
