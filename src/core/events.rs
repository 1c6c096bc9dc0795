//! Events emitted by engines to observers.
//!
//! Observers subscribe through the supervisor's broadcast channel; every
//! event names its conversation so one subscription can watch them all.

use serde_json::Value;

use crate::message::{ChatMessage, ConversationId};
use crate::protocol::Usage;

/// Engine lifecycle state.
///
/// `Idle -> Streaming -> (ExecutingTools -> Streaming)* -> Idle`;
/// `Interrupting` is reachable from any non-idle state and returns to Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Streaming,
    ExecutingTools,
    Interrupting,
}

/// Final status for a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcomeStatus {
    Completed,
    Interrupted,
    Failed,
}

/// Events emitted by an engine as a turn progresses.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A new turn has started.
    TurnStarted {
        conversation: ConversationId,
        turn_id: String,
    },

    /// The engine moved to a new lifecycle state.
    StateChanged {
        conversation: ConversationId,
        state: EngineState,
    },

    /// A message was finalized into the transcript.
    MessageAppended {
        conversation: ConversationId,
        message: ChatMessage,
    },

    /// Tool call handed to its handler.
    ToolCallStarted {
        conversation: ConversationId,
        id: String,
        name: String,
        input: Value,
    },

    /// Tool call resolved, successfully or not.
    ToolCallCompleted {
        conversation: ConversationId,
        id: String,
        is_error: bool,
    },

    /// The turn is over; `usage` is the cumulative total across rounds.
    TurnCompleted {
        conversation: ConversationId,
        turn_id: String,
        status: TurnOutcomeStatus,
        usage: Usage,
        error: Option<String>,
    },

    /// The engine's actor task has exited.
    EngineStopped { conversation: ConversationId },
}
