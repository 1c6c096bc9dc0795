//! Per-turn accumulator state.
//!
//! One [`TurnContext`] lives for exactly one user turn. It tracks the round
//! counter against the iteration ceiling, accumulates usage, and separates
//! "finalized into the transcript" from "queued for the next round".

use crate::error::EngineError;
use crate::message::ChatMessage;
use crate::protocol::Usage;

#[derive(Debug)]
pub struct TurnContext {
    turn_id: String,
    round: u32,
    usage: Usage,
    /// Finalized messages in transcript order. Append-only.
    messages: Vec<ChatMessage>,
    /// Content to ship in the next user-shaped round.
    pending: Vec<ChatMessage>,
}

impl TurnContext {
    #[must_use]
    pub fn new() -> Self {
        Self {
            turn_id: uuid::Uuid::new_v4().to_string(),
            round: 0,
            usage: Usage::default(),
            messages: Vec::new(),
            pending: Vec::new(),
        }
    }

    #[must_use]
    pub fn turn_id(&self) -> &str {
        &self.turn_id
    }

    #[must_use]
    pub fn round(&self) -> u32 {
        self.round
    }

    #[must_use]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Advance the round counter, failing once the ceiling is crossed.
    pub fn begin_round(&mut self, max_iterations: u32) -> Result<u32, EngineError> {
        if self.round >= max_iterations {
            return Err(EngineError::MaxIterationsExceeded {
                limit: max_iterations,
            });
        }
        self.round += 1;
        Ok(self.round)
    }

    pub fn absorb_usage(&mut self, round_usage: &Usage) {
        self.usage.add(round_usage);
    }

    /// Record a message into the transcript portion of this turn.
    pub fn finalize(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Queue content for the next outbound round.
    pub fn queue(&mut self, message: ChatMessage) {
        self.pending.push(message);
    }

    #[must_use]
    pub fn take_pending(&mut self) -> Vec<ChatMessage> {
        std::mem::take(&mut self.pending)
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn into_messages(self) -> Vec<ChatMessage> {
        self.messages
    }
}

impl Default for TurnContext {
    fn default() -> Self {
        Self::new()
    }
}
