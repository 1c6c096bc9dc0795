//! Internal structured message model.
//!
//! The engine appends to a conversation transcript of [`ChatMessage`]s and
//! never mutates what it already emitted. Wire shapes live in
//! [`crate::protocol`]; the translator maps between the two.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::Usage;

/// Identity of one conversation; owned externally, referenced here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl ConversationId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Speaker role for a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Backend-specific metadata attached to a message when known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MessageMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<String>,
}

/// One transcript entry: a role plus ordered content items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<MessageContent>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub meta: MessageMeta,
}

impl ChatMessage {
    #[must_use]
    pub fn new(role: Role, content: Vec<MessageContent>) -> Self {
        Self {
            role,
            content,
            timestamp: Utc::now(),
            meta: MessageMeta::default(),
        }
    }

    #[must_use]
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessageContent::text(text)])
    }

    #[must_use]
    pub fn system_text(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![MessageContent::text(text)])
    }

    #[must_use]
    pub fn with_meta(mut self, meta: MessageMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Concatenated plain text of all `Text` items.
    #[must_use]
    pub fn joined_text(&self) -> String {
        let mut out = String::new();
        for item in &self.content {
            if let MessageContent::Text { text, .. } = item {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// All tool calls carried by this message, in emission order.
    #[must_use]
    pub fn tool_calls(&self) -> Vec<&ToolCall> {
        self.content
            .iter()
            .filter_map(|item| match item {
                MessageContent::ToolCall(call) => Some(call),
                _ => None,
            })
            .collect()
    }
}

/// A requested tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// Optional speech channel parsed from structured assistant text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceHint {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tone: Option<String>,
}

/// One item of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResultItem {
    Text { text: String },
    Image { media_type: String, data: String },
}

/// One content item inside a [`ChatMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        voice: Option<VoiceHint>,
        /// Original bytes when structured parsing failed; kept for
        /// diagnostics, absent when the text parsed cleanly.
        #[serde(skip_serializing_if = "Option::is_none")]
        raw: Option<String>,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    ToolCall(ToolCall),
    ToolResult {
        tool_call_id: String,
        items: Vec<ResultItem>,
        #[serde(default)]
        is_error: bool,
    },
    Image {
        media_type: String,
        data: String,
    },
    /// Anything the translator could not classify, preserved verbatim.
    Unknown {
        raw: Value,
    },
}

impl MessageContent {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        MessageContent::Text {
            text: text.into(),
            voice: None,
            raw: None,
        }
    }

    #[must_use]
    pub fn tool_result_text(
        tool_call_id: impl Into<String>,
        text: impl Into<String>,
        is_error: bool,
    ) -> Self {
        MessageContent::ToolResult {
            tool_call_id: tool_call_id.into(),
            items: vec![ResultItem::Text { text: text.into() }],
            is_error,
        }
    }
}
