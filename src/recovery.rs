//! Recovery of tool calls embedded in plain assistant text.
//!
//! Some backends announce tool use with a `tool_use` finish reason but emit
//! the invocation as tagged markup inside the text block instead of a
//! structured `tool_use` block. This scanner extracts those fragments and
//! strips them from the visible text. Malformed fragments are skipped and
//! left in place so nothing is lost silently.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::message::ToolCall;

static TOOL_USE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<tool_use>\s*<name>([^<]+)</name>\s*<parameters>\s*([\s\S]*?)\s*</parameters>\s*</tool_use>",
    )
    .expect("tool-use pattern is valid")
});

/// Outcome of one scan: extracted calls plus the residual visible text.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredCalls {
    pub calls: Vec<ToolCall>,
    pub residual_text: String,
}

/// Cheap pre-check before paying for a full scan.
#[must_use]
pub fn has_embedded_tool_calls(text: &str) -> bool {
    contains_open_tag(text) && TOOL_USE_PATTERN.is_match(text)
}

fn contains_open_tag(text: &str) -> bool {
    text.to_ascii_lowercase().contains("<tool_use>")
}

/// Scan `text` for embedded tool invocations.
///
/// Well-formed fragments become [`ToolCall`]s with synthesized ids and are
/// removed from the residual text. Fragments whose parameter block is not
/// valid JSON stay in the text untouched. Scanning already-clean text
/// returns it unchanged with zero calls.
#[must_use]
pub fn extract_tool_calls(text: &str) -> RecoveredCalls {
    if text.is_empty() || !contains_open_tag(text) {
        return RecoveredCalls {
            calls: Vec::new(),
            residual_text: text.to_string(),
        };
    }

    let mut calls = Vec::new();
    let mut residual = String::with_capacity(text.len());
    let mut cursor = 0usize;

    for captures in TOOL_USE_PATTERN.captures_iter(text) {
        let whole = captures.get(0).expect("capture 0 always present");
        let name = captures[1].trim().to_string();
        let params = captures[2].trim();

        let Some(arguments) = normalize_arguments(params) else {
            tracing::warn!(
                tool = %name,
                "skipping embedded tool call with malformed parameter block"
            );
            continue;
        };

        residual.push_str(&text[cursor..whole.start()]);
        cursor = whole.end();

        calls.push(ToolCall {
            id: synthesize_call_id(),
            name,
            arguments,
        });
    }

    residual.push_str(&text[cursor..]);

    RecoveredCalls {
        calls,
        residual_text: residual.trim().to_string(),
    }
}

fn normalize_arguments(params: &str) -> Option<Value> {
    if params.is_empty() {
        return Some(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(params).ok()
}

fn synthesize_call_id() -> String {
    format!("toolu_{}", &uuid::Uuid::new_v4().simple().to_string()[..24])
}
