//! Transcript persistence seam.
//!
//! The engine appends finalized turn content here; what the host does with
//! it (database, files, nothing) is its own business. Sinks handle their
//! own failures; a broken transcript must never fail a turn.

use async_trait::async_trait;

use crate::message::{ChatMessage, ConversationId};

#[async_trait]
pub trait TranscriptSink: Send + Sync {
    /// Append the messages finalized by one turn, in transcript order.
    async fn append(&self, conversation: &ConversationId, messages: &[ChatMessage]);
}

/// Default sink: discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTranscript;

#[async_trait]
impl TranscriptSink for NullTranscript {
    async fn append(&self, _conversation: &ConversationId, _messages: &[ChatMessage]) {}
}
