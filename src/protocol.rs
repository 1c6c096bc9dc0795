//! Wire-protocol model for the streaming backend.
//!
//! The backend speaks newline-delimited JSON: every line is one object
//! discriminated by a `type` tag (`system`, `assistant`, `user`, `result`,
//! `control_request`, `control_response`). Each tagged union here carries an
//! untagged catch-all arm so unrecognized tags survive deserialization
//! instead of failing the stream.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// === Stream events ===

/// One line of backend output (or engine input), tagged by `type`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "system")]
    System(SystemEvent),
    #[serde(rename = "assistant")]
    Assistant(AssistantEvent),
    #[serde(rename = "user")]
    User(UserEvent),
    #[serde(rename = "result")]
    Result(ResultEvent),
    #[serde(rename = "control_request")]
    ControlRequest(ControlRequestEvent),
    #[serde(rename = "control_response")]
    ControlResponse(ControlResponseEvent),
    /// Any line with an unrecognized `type` tag, preserved verbatim.
    #[serde(untagged)]
    Unknown(Value),
}

/// System-scoped event; `subtype: "init"` announces session metadata.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct SystemEvent {
    pub subtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub slash_commands: Vec<String>,
    /// Subtype-specific payload (errors, parse diagnostics, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Assistant output: a nested message with ordered content blocks.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AssistantEvent {
    pub message: WireMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// User-shaped line: what the engine sends per round, and what the backend
/// echoes for tool results it handled itself.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserEvent {
    pub message: WireMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_tool_use_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Terminal summary for one backend call.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ResultEvent {
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_api_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    /// Closing text, or the backend's own error description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ResultEvent {
    pub const SUBTYPE_SUCCESS: &'static str = "success";
    pub const SUBTYPE_ERROR: &'static str = "error";
    pub const SUBTYPE_MAX_TURNS: &'static str = "error_max_turns";
}

/// Out-of-band command to the backend (interrupt et al.).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ControlRequestEvent {
    pub request_id: String,
    pub request: ControlBody,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ControlBody {
    pub subtype: String,
}

impl ControlRequestEvent {
    pub const SUBTYPE_INTERRUPT: &'static str = "interrupt";

    /// Build an interrupt request with a fresh request id.
    #[must_use]
    pub fn interrupt() -> Self {
        Self {
            request_id: format!("req_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]),
            request: ControlBody {
                subtype: Self::SUBTYPE_INTERRUPT.to_string(),
            },
        }
    }
}

/// Acknowledgment for a control request, matched by `request_id`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ControlResponseEvent {
    pub response: ControlResponseBody,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ControlResponseBody {
    pub request_id: String,
    pub subtype: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// === Messages and content blocks ===

/// Message envelope nested inside `assistant` and `user` lines.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WireMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    pub content: Vec<WireContentBlock>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl WireMessage {
    /// Finish reason indicating the model wants tool results before it can
    /// continue.
    pub const STOP_TOOL_USE: &'static str = "tool_use";

    #[must_use]
    pub fn user(content: Vec<WireContentBlock>) -> Self {
        Self {
            id: None,
            role: "user".to_string(),
            content,
            model: None,
            stop_reason: None,
            stop_sequence: None,
            usage: None,
        }
    }
}

/// A single content block, tagged by `type`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum WireContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "thinking")]
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    #[serde(rename = "redacted_thinking")]
    RedactedThinking { data: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        content: Option<ToolResultPayload>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    #[serde(rename = "image")]
    Image { source: MediaSource },
    #[serde(rename = "document")]
    Document { source: MediaSource },
    /// Forward-compatibility arm for unrecognized block types.
    #[serde(untagged)]
    Unknown(Value),
}

/// `tool_result.content` arrives either as a bare string or as nested blocks.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum ToolResultPayload {
    Text(String),
    Blocks(Vec<WireContentBlock>),
}

/// Base64 payload for images and documents.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MediaSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

impl MediaSource {
    #[must_use]
    pub fn base64(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            source_type: "base64".to_string(),
            media_type: media_type.into(),
            data: data.into(),
        }
    }
}

// === Usage ===

/// Token accounting for one backend call. Missing fields default to zero so
/// partial usage objects still parse.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl Usage {
    /// Field-wise saturating accumulation; the engine calls this once per
    /// round so turn totals stay monotone.
    pub fn add(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(other.cache_read_input_tokens);
    }

    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens
            .saturating_add(self.output_tokens)
            .saturating_add(self.cache_creation_input_tokens)
            .saturating_add(self.cache_read_input_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn init_line_parses_session_metadata() {
        let line = r#"{"type":"system","subtype":"init","session_id":"sess-1",
            "cwd":"/home/u/project","tools":["ListFiles","WebSearch"],
            "mcp_servers":[],"model":"sonnet","permission_mode":"acceptEdits"}"#;
        let event: StreamEvent = serde_json::from_str(line).unwrap();
        let StreamEvent::System(init) = event else {
            panic!("expected system event");
        };
        assert_eq!(init.subtype, "init");
        assert_eq!(init.session_id.as_deref(), Some("sess-1"));
        assert_eq!(init.tools, vec!["ListFiles", "WebSearch"]);
    }

    #[test]
    fn assistant_line_preserves_block_order() {
        let line = json!({
            "type": "assistant",
            "message": {
                "id": "msg_1",
                "role": "assistant",
                "content": [
                    {"type": "thinking", "thinking": "hm"},
                    {"type": "text", "text": "hello"},
                    {"type": "tool_use", "id": "toolu_1", "name": "ListFiles", "input": {"path": "."}}
                ],
                "model": "sonnet",
                "stop_reason": "tool_use",
                "usage": {"input_tokens": 10, "output_tokens": 4}
            },
            "session_id": "sess-1"
        });
        let event: StreamEvent = serde_json::from_value(line).unwrap();
        let StreamEvent::Assistant(assistant) = event else {
            panic!("expected assistant event");
        };
        assert_eq!(assistant.message.content.len(), 3);
        assert!(matches!(
            assistant.message.content[0],
            WireContentBlock::Thinking { .. }
        ));
        assert!(matches!(
            assistant.message.content[2],
            WireContentBlock::ToolUse { .. }
        ));
        assert_eq!(
            assistant.message.stop_reason.as_deref(),
            Some(WireMessage::STOP_TOOL_USE)
        );
    }

    #[test]
    fn unknown_type_tag_falls_back_to_unknown_arm() {
        let event: StreamEvent =
            serde_json::from_str(r#"{"type":"telemetry","payload":{"x":1}}"#).unwrap();
        assert!(matches!(event, StreamEvent::Unknown(_)));
    }

    #[test]
    fn unknown_block_type_survives_inside_known_message() {
        let line = json!({
            "type": "assistant",
            "message": {
                "role": "assistant",
                "content": [
                    {"type": "hologram", "frames": 3},
                    {"type": "text", "text": "still here"}
                ]
            }
        });
        let event: StreamEvent = serde_json::from_value(line).unwrap();
        let StreamEvent::Assistant(assistant) = event else {
            panic!("expected assistant event");
        };
        assert!(matches!(
            assistant.message.content[0],
            WireContentBlock::Unknown(_)
        ));
    }

    #[test]
    fn tool_result_content_accepts_string_or_blocks() {
        let as_string: WireContentBlock = serde_json::from_value(json!({
            "type": "tool_result", "tool_use_id": "toolu_1", "content": "3 files"
        }))
        .unwrap();
        let as_blocks: WireContentBlock = serde_json::from_value(json!({
            "type": "tool_result", "tool_use_id": "toolu_1",
            "content": [{"type": "text", "text": "3 files"}], "is_error": true
        }))
        .unwrap();
        assert!(matches!(
            as_string,
            WireContentBlock::ToolResult {
                content: Some(ToolResultPayload::Text(_)),
                is_error: false,
                ..
            }
        ));
        assert!(matches!(
            as_blocks,
            WireContentBlock::ToolResult {
                content: Some(ToolResultPayload::Blocks(_)),
                is_error: true,
                ..
            }
        ));
    }

    #[test]
    fn usage_addition_is_fieldwise_and_defaults_missing_counters() {
        let mut total = Usage::default();
        let round: Usage = serde_json::from_str(r#"{"input_tokens":7,"output_tokens":3}"#).unwrap();
        total.add(&round);
        total.add(&Usage {
            input_tokens: 1,
            output_tokens: 2,
            cache_creation_input_tokens: 4,
            cache_read_input_tokens: 8,
        });
        assert_eq!(total.input_tokens, 8);
        assert_eq!(total.output_tokens, 5);
        assert_eq!(total.cache_creation_input_tokens, 4);
        assert_eq!(total.cache_read_input_tokens, 8);
        assert_eq!(total.total_tokens(), 25);
    }

    #[test]
    fn control_round_trip_matches_by_request_id() {
        let request = ControlRequestEvent::interrupt();
        let ack = StreamEvent::ControlResponse(ControlResponseEvent {
            response: ControlResponseBody {
                request_id: request.request_id.clone(),
                subtype: ControlRequestEvent::SUBTYPE_INTERRUPT.to_string(),
                error: None,
            },
        });
        let encoded = serde_json::to_string(&ack).unwrap();
        let decoded: StreamEvent = serde_json::from_str(&encoded).unwrap();
        let StreamEvent::ControlResponse(response) = decoded else {
            panic!("expected control response");
        };
        assert_eq!(response.response.request_id, request.request_id);
    }
}
