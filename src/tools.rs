//! Client-side tool execution.
//!
//! The backend decides *which* tools to call; this module runs the calls the
//! engine is responsible for. A round's calls execute concurrently, each
//! failure is contained to its own call, and results always come back in
//! request order so the follow-up message is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::message::{MessageContent, ResultItem, ToolCall};

// === Errors ===

/// Why a single tool call failed. Never aborts the round; the error text is
/// fed back to the model as an error-flagged result.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool '{0}' is not available")]
    NotAvailable(String),
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),
    #[error("tool timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

// === Handler and catalog ===

/// Output of one successful tool call.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolOutput {
    pub items: Vec<ResultItem>,
}

impl ToolOutput {
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            items: vec![ResultItem::Text { text: text.into() }],
        }
    }
}

/// Advertised shape of a tool, surfaced to the backend at connect time.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// One executable tool. Implementations must be safe to run concurrently
/// with other tools in the same round.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    async fn invoke(&self, arguments: Value) -> Result<ToolOutput, ToolError>;
}

/// Registry of the tools one conversation exposes.
#[derive(Default, Clone)]
pub struct ToolCatalog {
    handlers: HashMap<String, Arc<dyn ToolHandler>>,
}

impl ToolCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration under the same name wins.
    pub fn register(&mut self, handler: Arc<dyn ToolHandler>) {
        self.handlers
            .insert(handler.descriptor().name.clone(), handler);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.get(name).cloned()
    }

    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut out: Vec<ToolDescriptor> =
            self.handlers.values().map(|h| h.descriptor()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ToolCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCatalog")
            .field("tools", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

// === Round execution ===

/// Runs one round of tool calls for the engine.
#[derive(Debug, Clone)]
pub struct ToolExecutionCoordinator {
    catalog: ToolCatalog,
    /// Per-call wall-clock budget; `None` means unbounded.
    call_timeout: Option<Duration>,
}

impl ToolExecutionCoordinator {
    #[must_use]
    pub fn new(catalog: ToolCatalog, call_timeout: Option<Duration>) -> Self {
        Self {
            catalog,
            call_timeout,
        }
    }

    #[must_use]
    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Execute every call of one round concurrently and return one
    /// [`MessageContent::ToolResult`] per call, in request order.
    ///
    /// A failing, panicking, or unknown tool produces an error-flagged
    /// result for its own call only. Cancellation mid-round still yields a
    /// result for every call so the follow-up message stays well-formed.
    pub async fn execute_round(
        &self,
        calls: &[ToolCall],
        cancel: &CancellationToken,
    ) -> Vec<MessageContent> {
        let mut pending = FuturesUnordered::new();
        for (index, call) in calls.iter().enumerate() {
            let handle = tokio::spawn(self.clone().run_one(call.clone(), cancel.clone()));
            pending.push(async move { (index, handle.await) });
        }

        let mut slots: Vec<Option<MessageContent>> = (0..calls.len()).map(|_| None).collect();
        while let Some((index, joined)) = pending.next().await {
            let result = match joined {
                Ok(result) => result,
                Err(join_err) => {
                    tracing::error!(tool = %calls[index].name, error = %join_err, "tool task panicked");
                    error_result(
                        &calls[index].id,
                        &ToolError::ExecutionFailed(format!("tool task panicked: {join_err}")),
                    )
                }
            };
            slots[index] = Some(result);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| error_result(&calls[index].id, &ToolError::Cancelled))
            })
            .collect()
    }

    async fn run_one(self, call: ToolCall, cancel: CancellationToken) -> MessageContent {
        if cancel.is_cancelled() {
            return error_result(&call.id, &ToolError::Cancelled);
        }

        let Some(handler) = self.catalog.get(&call.name) else {
            tracing::warn!(tool = %call.name, "model requested an unregistered tool");
            return error_result(&call.id, &ToolError::NotAvailable(call.name.clone()));
        };

        tracing::debug!(tool = %call.name, id = %call.id, "running tool");
        let invocation = handler.invoke(call.arguments.clone());
        let outcome = tokio::select! {
            () = cancel.cancelled() => Err(ToolError::Cancelled),
            result = self.with_timeout(invocation) => result,
        };

        match outcome {
            Ok(output) => MessageContent::ToolResult {
                tool_call_id: call.id,
                items: output.items,
                is_error: false,
            },
            Err(err) => {
                tracing::warn!(tool = %call.name, error = %err, "tool call failed");
                error_result(&call.id, &err)
            }
        }
    }

    async fn with_timeout<F>(&self, invocation: F) -> Result<ToolOutput, ToolError>
    where
        F: std::future::Future<Output = Result<ToolOutput, ToolError>>,
    {
        match self.call_timeout {
            Some(budget) => match tokio::time::timeout(budget, invocation).await {
                Ok(result) => result,
                Err(_) => Err(ToolError::Timeout(budget)),
            },
            None => invocation.await,
        }
    }
}

fn error_result(tool_call_id: &str, err: &ToolError) -> MessageContent {
    MessageContent::tool_result_text(tool_call_id, err.to_string(), true)
}
