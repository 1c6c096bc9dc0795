//! Engine-level error taxonomy.

use std::time::Duration;

use crate::message::ConversationId;

/// Why a turn (or the engine itself) failed. Tool-call failures never show
/// up here; those are folded into the transcript as error-flagged results.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The backend process could not be started or its stream closed early.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The turn loop hit its round ceiling without the model finishing.
    #[error("turn exceeded {limit} rounds without completing")]
    MaxIterationsExceeded { limit: u32 },

    /// The engine's op queue is full; the command was rejected, not queued.
    #[error("conversation '{0}' has too many queued commands")]
    QueueFull(ConversationId),

    /// The backend never acknowledged a control request in time.
    #[error("backend did not acknowledge {subtype} within {timeout:?}")]
    ControlTimeout { subtype: String, timeout: Duration },

    /// The engine's command channel is gone; the engine is shut down.
    #[error("engine for conversation '{0}' is no longer running")]
    EngineGone(ConversationId),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the conversation can keep going after this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, EngineError::EngineGone(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages_are_user_presentable() {
        let err = EngineError::MaxIterationsExceeded { limit: 200 };
        assert_eq!(err.to_string(), "turn exceeded 200 rounds without completing");

        let err = EngineError::ControlTimeout {
            subtype: "interrupt".to_string(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.to_string().contains("interrupt"));
    }

    #[test]
    fn only_a_dead_engine_is_unrecoverable() {
        assert!(EngineError::QueueFull(ConversationId::new("c1")).is_recoverable());
        assert!(EngineError::BackendUnavailable("spawn failed".to_string()).is_recoverable());
        assert!(!EngineError::EngineGone(ConversationId::new("c1")).is_recoverable());
    }
}
