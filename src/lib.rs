//! Conversation engine for a desktop AI assistant.
//!
//! Drives long-lived conversations against an LLM backend reachable only
//! through a line-delimited JSON streaming protocol. One engine actor per
//! conversation, managed by a [`core::supervisor::Supervisor`]; each turn
//! is a bounded iterative loop of streamed rounds and client-side tool
//! execution.
//!
//! ```no_run
//! use std::sync::Arc;
//! use parley::backend::SubprocessConnector;
//! use parley::config::Settings;
//! use parley::core::supervisor::Supervisor;
//! use parley::message::ConversationId;
//! use parley::tools::ToolCatalog;
//! use parley::transcript::NullTranscript;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = Settings::load(None)?;
//! let connector = Arc::new(SubprocessConnector::new(settings.backend.clone()));
//! let supervisor = Supervisor::spawn(
//!     settings,
//!     connector,
//!     ToolCatalog::new(),
//!     Arc::new(NullTranscript),
//! );
//! let report = supervisor
//!     .start_turn(ConversationId::new("chat-1"), "hello")
//!     .await?;
//! println!("{:?}", report.status);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod message;
pub mod protocol;
pub mod recovery;
pub mod tools;
pub mod transcript;
pub mod translator;

pub use crate::core::engine::{EngineHandle, TurnOptions, TurnReport};
pub use crate::core::events::{EngineEvent, EngineState, TurnOutcomeStatus};
pub use crate::core::supervisor::{ConversationCommand, Supervisor, SupervisorHandle};
pub use crate::error::EngineError;
pub use crate::message::{ChatMessage, ConversationId, MessageContent, Role, ToolCall};
pub use crate::protocol::{StreamEvent, Usage};
