//! Conversation engine core: per-conversation actors and their supervisor.

pub mod engine;
pub mod events;
pub mod supervisor;
pub mod turn;
