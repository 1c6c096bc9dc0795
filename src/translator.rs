//! Bidirectional translation between wire events and the domain model.
//!
//! Every function here is total: malformed or unexpected shapes degrade to
//! `Unknown` content instead of failing the stream. The translator holds no
//! state beyond its options.

use serde_json::Value;

use crate::message::{
    ChatMessage, MessageContent, MessageMeta, ResultItem, Role, ToolCall, VoiceHint,
};
use crate::protocol::{
    AssistantEvent, MediaSource, StreamEvent, ToolResultPayload, UserEvent, WireContentBlock,
    WireMessage,
};

// === Options ===

/// Alternate structured-text formats the assistant may be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlternateFormat {
    /// `<voice speech="..." tone="...">display text</voice>` markup.
    VoiceTagged,
}

/// Translation options, fixed per conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TranslatorOptions {
    /// When set, assistant text is expected to be structured and runs the
    /// parse fallback chain; plain prose otherwise passes through untouched.
    pub structured_text: bool,
    pub alternate: Option<AlternateFormat>,
}

/// Stateless wire <-> domain mapper.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolTranslator {
    options: TranslatorOptions,
}

impl ProtocolTranslator {
    #[must_use]
    pub fn new(options: TranslatorOptions) -> Self {
        Self { options }
    }

    // === Inbound: wire -> domain ===

    /// Parse one raw line of backend output. Never fails: non-JSON lines and
    /// shapes serde cannot place degrade to [`StreamEvent::Unknown`]
    /// carrying the original text.
    #[must_use]
    pub fn parse_line(&self, line: &str) -> StreamEvent {
        match serde_json::from_str::<Value>(line) {
            Ok(value) => match serde_json::from_value::<StreamEvent>(value.clone()) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(error = %err, "unplaceable wire event, degrading to unknown");
                    StreamEvent::Unknown(value)
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, "malformed wire line, degrading to unknown");
                StreamEvent::Unknown(Value::String(line.to_string()))
            }
        }
    }

    /// Map an `assistant` event to a transcript entry.
    #[must_use]
    pub fn assistant_message(&self, event: &AssistantEvent) -> ChatMessage {
        let content = event
            .message
            .content
            .iter()
            .map(|block| self.inbound_block(block))
            .collect();
        ChatMessage::new(Role::Assistant, content).with_meta(Self::meta_of(&event.message, event.session_id.as_deref()))
    }

    /// Map an echoed `user` event to a transcript entry.
    #[must_use]
    pub fn user_message(&self, event: &UserEvent) -> ChatMessage {
        let content = event
            .message
            .content
            .iter()
            .map(|block| self.inbound_block(block))
            .collect();
        ChatMessage::new(Role::User, content).with_meta(Self::meta_of(&event.message, event.session_id.as_deref()))
    }

    fn meta_of(message: &WireMessage, session_id: Option<&str>) -> MessageMeta {
        MessageMeta {
            session_id: session_id.map(str::to_string),
            model: message.model.clone(),
            usage: message.usage,
            stop_reason: message.stop_reason.clone(),
        }
    }

    fn inbound_block(&self, block: &WireContentBlock) -> MessageContent {
        match block {
            WireContentBlock::Text { text } => self.parse_assistant_text(text),
            WireContentBlock::Thinking { thinking, signature } => MessageContent::Thinking {
                thinking: thinking.clone(),
                signature: signature.clone(),
            },
            WireContentBlock::ToolUse { id, name, input } => MessageContent::ToolCall(ToolCall {
                id: id.clone(),
                name: name.clone(),
                arguments: input.clone(),
            }),
            WireContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => MessageContent::ToolResult {
                tool_call_id: tool_use_id.clone(),
                items: Self::result_items(content.as_ref()),
                is_error: *is_error,
            },
            WireContentBlock::Image { source } => MessageContent::Image {
                media_type: source.media_type.clone(),
                data: source.data.clone(),
            },
            WireContentBlock::RedactedThinking { .. }
            | WireContentBlock::Document { .. }
            | WireContentBlock::Unknown(_) => MessageContent::Unknown {
                raw: serde_json::to_value(block).unwrap_or(Value::Null),
            },
        }
    }

    fn result_items(payload: Option<&ToolResultPayload>) -> Vec<ResultItem> {
        match payload {
            None => Vec::new(),
            Some(ToolResultPayload::Text(text)) => vec![ResultItem::Text { text: text.clone() }],
            Some(ToolResultPayload::Blocks(blocks)) => blocks
                .iter()
                .filter_map(|block| match block {
                    WireContentBlock::Text { text } => {
                        Some(ResultItem::Text { text: text.clone() })
                    }
                    WireContentBlock::Image { source } => Some(ResultItem::Image {
                        media_type: source.media_type.clone(),
                        data: source.data.clone(),
                    }),
                    other => {
                        tracing::debug!(?other, "ignoring non-displayable tool result block");
                        None
                    }
                })
                .collect(),
        }
    }

    /// Structured assistant-text fallback chain: native JSON object ->
    /// configured alternate markup -> raw text flagged unparsed. Original
    /// bytes are preserved whenever the structured parse fails.
    #[must_use]
    pub fn parse_assistant_text(&self, raw: &str) -> MessageContent {
        if !self.options.structured_text {
            return MessageContent::text(raw);
        }

        if let Some(parsed) = parse_native_text(raw) {
            return parsed;
        }
        if let Some(AlternateFormat::VoiceTagged) = self.options.alternate
            && let Some(parsed) = parse_voice_tagged(raw)
        {
            return parsed;
        }

        tracing::debug!("assistant text did not match any structured format");
        MessageContent::Text {
            text: raw.to_string(),
            voice: None,
            raw: Some(raw.to_string()),
        }
    }

    // === Outbound: domain -> wire ===

    /// Assemble the single `user`-shaped object for one round from the
    /// round's pending messages. Content the backend cannot carry is dropped
    /// with a warning rather than failing the turn.
    #[must_use]
    pub fn build_user_event(
        &self,
        messages: &[&ChatMessage],
        session_id: Option<&str>,
    ) -> UserEvent {
        let mut blocks = Vec::new();
        for message in messages {
            for item in &message.content {
                if let Some(block) = Self::outbound_block(item) {
                    blocks.push(block);
                }
            }
        }
        UserEvent {
            message: WireMessage::user(blocks),
            parent_tool_use_id: None,
            session_id: session_id.map(str::to_string),
        }
    }

    fn outbound_block(item: &MessageContent) -> Option<WireContentBlock> {
        match item {
            MessageContent::Text { text, .. } => Some(WireContentBlock::Text { text: text.clone() }),
            MessageContent::ToolResult {
                tool_call_id,
                items,
                is_error,
            } => Some(WireContentBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                content: Some(Self::outbound_result_payload(items)),
                is_error: *is_error,
            }),
            MessageContent::Image { media_type, data } => Some(WireContentBlock::Image {
                source: MediaSource::base64(media_type.clone(), data.clone()),
            }),
            MessageContent::Thinking { .. }
            | MessageContent::ToolCall(_)
            | MessageContent::Unknown { .. } => {
                tracing::warn!(
                    "dropping content item the backend cannot carry in a user turn: {}",
                    content_kind(item)
                );
                None
            }
        }
    }

    fn outbound_result_payload(items: &[ResultItem]) -> ToolResultPayload {
        if let [ResultItem::Text { text }] = items {
            return ToolResultPayload::Text(text.clone());
        }
        ToolResultPayload::Blocks(
            items
                .iter()
                .map(|item| match item {
                    ResultItem::Text { text } => WireContentBlock::Text { text: text.clone() },
                    ResultItem::Image { media_type, data } => WireContentBlock::Image {
                        source: MediaSource::base64(media_type.clone(), data.clone()),
                    },
                })
                .collect(),
        )
    }

    /// Concatenate the text of all system-role messages into the backend's
    /// instruction string.
    #[must_use]
    pub fn extract_instructions(&self, history: &[ChatMessage]) -> Option<String> {
        let mut out = String::new();
        for message in history {
            if message.role != Role::System {
                continue;
            }
            let text = message.joined_text();
            if text.is_empty() {
                continue;
            }
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            out.push_str(&text);
        }
        if out.is_empty() { None } else { Some(out) }
    }
}

fn content_kind(item: &MessageContent) -> &'static str {
    match item {
        MessageContent::Text { .. } => "text",
        MessageContent::Thinking { .. } => "thinking",
        MessageContent::ToolCall(_) => "tool_call",
        MessageContent::ToolResult { .. } => "tool_result",
        MessageContent::Image { .. } => "image",
        MessageContent::Unknown { .. } => "unknown",
    }
}

fn parse_native_text(raw: &str) -> Option<MessageContent> {
    let trimmed = raw.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    let value: Value = serde_json::from_str(trimmed).ok()?;
    let object = value.as_object()?;
    let text = object.get("text")?.as_str()?.to_string();
    let speech = object.get("speech").and_then(Value::as_str).map(str::to_string);
    let tone = object.get("tone").and_then(Value::as_str).map(str::to_string);
    let voice = if speech.is_some() || tone.is_some() {
        Some(VoiceHint { speech, tone })
    } else {
        None
    };
    Some(MessageContent::Text {
        text,
        voice,
        raw: None,
    })
}

fn parse_voice_tagged(raw: &str) -> Option<MessageContent> {
    use std::sync::LazyLock;

    static VOICE_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
        regex::Regex::new(
            r#"(?is)^\s*<voice(?:\s+speech="([^"]*)")?(?:\s+tone="([^"]*)")?\s*>([\s\S]*?)</voice>\s*$"#,
        )
        .expect("voice pattern is valid")
    });

    let captures = VOICE_PATTERN.captures(raw)?;
    let speech = captures.get(1).map(|m| m.as_str().to_string());
    let tone = captures.get(2).map(|m| m.as_str().to_string());
    let text = captures[3].trim().to_string();
    let voice = if speech.is_some() || tone.is_some() {
        Some(VoiceHint { speech, tone })
    } else {
        None
    };
    Some(MessageContent::Text {
        text,
        voice,
        raw: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Usage;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn structured() -> ProtocolTranslator {
        ProtocolTranslator::new(TranslatorOptions {
            structured_text: true,
            alternate: Some(AlternateFormat::VoiceTagged),
        })
    }

    #[test]
    fn parse_line_never_fails_on_garbage() {
        let translator = ProtocolTranslator::default();
        for line in [
            "not json at all",
            "{\"type\": 42}",
            "{\"no_type\": \"here\"}",
            "[1, 2, 3]",
            "\"just a string\"",
            "{\"type\": \"assistant\"}",
        ] {
            let event = translator.parse_line(line);
            assert!(
                matches!(event, StreamEvent::Unknown(_)),
                "expected unknown for {line:?}"
            );
        }
    }

    #[test]
    fn parse_line_accepts_known_tags() {
        let translator = ProtocolTranslator::default();
        let event = translator.parse_line(
            r#"{"type":"result","subtype":"success","is_error":false,"num_turns":1}"#,
        );
        assert!(matches!(event, StreamEvent::Result(_)));
    }

    #[test]
    fn assistant_message_carries_meta_and_order() {
        let translator = ProtocolTranslator::default();
        let event: AssistantEvent = serde_json::from_value(json!({
            "message": {
                "id": "msg_1",
                "role": "assistant",
                "content": [
                    {"type": "text", "text": "hi"},
                    {"type": "tool_use", "id": "toolu_9", "name": "ListFiles", "input": {}}
                ],
                "model": "sonnet",
                "stop_reason": "tool_use",
                "usage": {"input_tokens": 3, "output_tokens": 5}
            },
            "session_id": "sess-7"
        }))
        .unwrap();
        let message = translator.assistant_message(&event);
        assert_eq!(message.role, Role::Assistant);
        assert_eq!(message.meta.session_id.as_deref(), Some("sess-7"));
        assert_eq!(message.meta.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(
            message.meta.usage,
            Some(Usage {
                input_tokens: 3,
                output_tokens: 5,
                ..Usage::default()
            })
        );
        assert!(matches!(message.content[0], MessageContent::Text { .. }));
        assert!(matches!(message.content[1], MessageContent::ToolCall(_)));
    }

    #[test]
    fn unrecognized_block_degrades_to_unknown_content() {
        let translator = ProtocolTranslator::default();
        let event: AssistantEvent = serde_json::from_value(json!({
            "message": {
                "role": "assistant",
                "content": [{"type": "hologram", "frames": 3}]
            }
        }))
        .unwrap();
        let message = translator.assistant_message(&event);
        assert!(matches!(message.content[0], MessageContent::Unknown { .. }));
    }

    #[test]
    fn native_structured_text_parses_speech_and_tone() {
        let content = structured()
            .parse_assistant_text(r#"{"text": "Hello!", "speech": "Hello there", "tone": "warm"}"#);
        let MessageContent::Text { text, voice, raw } = content else {
            panic!("expected text");
        };
        assert_eq!(text, "Hello!");
        let voice = voice.unwrap();
        assert_eq!(voice.speech.as_deref(), Some("Hello there"));
        assert_eq!(voice.tone.as_deref(), Some("warm"));
        assert_eq!(raw, None);
    }

    #[test]
    fn alternate_voice_markup_is_second_in_the_chain() {
        let content =
            structured().parse_assistant_text(r#"<voice speech="hey" tone="calm">Hey.</voice>"#);
        let MessageContent::Text { text, voice, raw } = content else {
            panic!("expected text");
        };
        assert_eq!(text, "Hey.");
        assert_eq!(voice.unwrap().tone.as_deref(), Some("calm"));
        assert_eq!(raw, None);
    }

    #[test]
    fn unparsed_structured_text_keeps_original_bytes() {
        let input = "{broken json";
        let content = structured().parse_assistant_text(input);
        let MessageContent::Text { text, voice, raw } = content else {
            panic!("expected text");
        };
        assert_eq!(text, input);
        assert_eq!(voice, None);
        assert_eq!(raw.as_deref(), Some(input));
    }

    #[test]
    fn plain_mode_skips_the_chain_entirely() {
        let translator = ProtocolTranslator::default();
        let content = translator.parse_assistant_text(r#"{"text": "looks structured"}"#);
        let MessageContent::Text { text, raw, .. } = content else {
            panic!("expected text");
        };
        assert_eq!(text, r#"{"text": "looks structured"}"#);
        assert_eq!(raw, None);
    }

    #[test]
    fn outbound_turn_drops_uncarryable_content_keeps_the_rest() {
        let translator = ProtocolTranslator::default();
        let message = ChatMessage::new(
            Role::User,
            vec![
                MessageContent::text("run it"),
                MessageContent::Thinking {
                    thinking: "private".to_string(),
                    signature: None,
                },
                MessageContent::tool_result_text("toolu_1", "done", false),
                MessageContent::Unknown { raw: json!({"x": 1}) },
            ],
        );
        let event = translator.build_user_event(&[&message], Some("sess-1"));
        assert_eq!(event.message.content.len(), 2);
        assert!(matches!(
            event.message.content[0],
            WireContentBlock::Text { .. }
        ));
        assert!(matches!(
            event.message.content[1],
            WireContentBlock::ToolResult { .. }
        ));
        assert_eq!(event.session_id.as_deref(), Some("sess-1"));
    }

    #[test]
    fn single_text_tool_result_serializes_as_bare_string() {
        let payload = ProtocolTranslator::outbound_result_payload(&[ResultItem::Text {
            text: "3 files".to_string(),
        }]);
        assert_eq!(payload, ToolResultPayload::Text("3 files".to_string()));
    }

    #[test]
    fn instructions_concatenate_system_messages_in_order() {
        let translator = ProtocolTranslator::default();
        let history = vec![
            ChatMessage::system_text("Be terse."),
            ChatMessage::user_text("hi"),
            ChatMessage::system_text("Answer in English."),
        ];
        assert_eq!(
            translator.extract_instructions(&history).as_deref(),
            Some("Be terse.\n\nAnswer in English.")
        );
        assert_eq!(
            translator.extract_instructions(&[ChatMessage::user_text("x")]),
            None
        );
    }
}
