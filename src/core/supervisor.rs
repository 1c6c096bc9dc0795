//! Conversation supervisor.
//!
//! Single ordered command loop that owns the engine registry. Engines are
//! created lazily per conversation id and each runs as its own tokio task,
//! so one engine dying never takes down its siblings or the loop: dead
//! entries are pruned and rebuilt on next use.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::backend::BackendConnector;
use crate::config::Settings;
use crate::core::engine::{ConversationEngine, EngineHandle, TurnOptions, TurnReport};
use crate::core::events::EngineEvent;
use crate::error::EngineError;
use crate::message::ConversationId;
use crate::tools::{ToolCatalog, ToolExecutionCoordinator};
use crate::transcript::TranscriptSink;
use crate::translator::ProtocolTranslator;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Commands addressed to one conversation.
pub enum ConversationCommand {
    StartTurn {
        text: String,
        options: TurnOptions,
        reply: oneshot::Sender<Result<TurnReport, EngineError>>,
    },
    Interrupt,
    Shutdown,
}

enum SupervisorMsg {
    Dispatch {
        conversation: ConversationId,
        command: ConversationCommand,
    },
    Conversations {
        reply: oneshot::Sender<Vec<ConversationId>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

struct EngineEntry {
    handle: EngineHandle,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    rx: mpsc::Receiver<SupervisorMsg>,
    engines: HashMap<ConversationId, EngineEntry>,
    settings: Settings,
    connector: Arc<dyn BackendConnector>,
    catalog: ToolCatalog,
    transcript: Arc<dyn TranscriptSink>,
    tx_event: broadcast::Sender<EngineEvent>,
}

impl Supervisor {
    /// Start the supervisor task and return its handle.
    pub fn spawn(
        settings: Settings,
        connector: Arc<dyn BackendConnector>,
        catalog: ToolCatalog,
        transcript: Arc<dyn TranscriptSink>,
    ) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (tx_event, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let supervisor = Self {
            rx,
            engines: HashMap::new(),
            settings,
            connector,
            catalog,
            transcript,
            tx_event: tx_event.clone(),
        };
        tokio::spawn(supervisor.run());
        SupervisorHandle { tx, tx_event }
    }

    async fn run(mut self) {
        while let Some(msg) = self.rx.recv().await {
            match msg {
                SupervisorMsg::Dispatch {
                    conversation,
                    command,
                } => self.dispatch(conversation, command).await,
                SupervisorMsg::Conversations { reply } => {
                    self.prune_dead();
                    let _ = reply.send(self.engines.keys().cloned().collect());
                }
                SupervisorMsg::Shutdown { done } => {
                    self.shutdown_all().await;
                    let _ = done.send(());
                    break;
                }
            }
        }
        tracing::info!("supervisor stopped");
    }

    async fn dispatch(&mut self, conversation: ConversationId, command: ConversationCommand) {
        match command {
            ConversationCommand::StartTurn {
                text,
                options,
                reply,
            } => {
                let handle = self.get_or_create(&conversation).handle.clone();
                // Non-blocking: one conversation's full queue must not stall
                // the command loop for its siblings. The reply channel was
                // already answered on rejection.
                match handle.try_submit_turn(text, options, reply) {
                    Ok(()) => {}
                    Err(EngineError::EngineGone(_)) => {
                        tracing::warn!(conversation = %conversation, "engine rejected turn; pruning");
                        self.engines.remove(&conversation);
                    }
                    Err(err) => {
                        tracing::warn!(conversation = %conversation, error = %err, "turn rejected");
                    }
                }
            }
            ConversationCommand::Interrupt => {
                if let Some(entry) = self.engines.get(&conversation) {
                    entry.handle.interrupt();
                } else {
                    tracing::info!(conversation = %conversation, "interrupt for unknown conversation, ignored");
                }
            }
            ConversationCommand::Shutdown => {
                if let Some(entry) = self.engines.remove(&conversation) {
                    // Queued after any in-flight op; sent off-loop so a full
                    // op queue cannot stall the other conversations.
                    tokio::spawn(async move { entry.handle.shutdown().await });
                }
            }
        }
    }

    /// Lazy, idempotent engine creation: at most one live engine per id.
    fn get_or_create(&mut self, conversation: &ConversationId) -> &EngineEntry {
        let dead = self
            .engines
            .get(conversation)
            .is_some_and(|entry| entry.task.is_finished());
        if dead {
            tracing::warn!(conversation = %conversation, "pruning dead engine");
            self.engines.remove(conversation);
        }

        self.engines
            .entry(conversation.clone())
            .or_insert_with(|| {
                tracing::info!(conversation = %conversation, "creating engine");
                let (engine, handle) = ConversationEngine::new(
                    conversation.clone(),
                    self.settings.engine,
                    ProtocolTranslator::new(self.settings.backend.translator),
                    Arc::clone(&self.connector),
                    ToolExecutionCoordinator::new(
                        self.catalog.clone(),
                        self.settings.engine.tool_timeout,
                    ),
                    Arc::clone(&self.transcript),
                    self.tx_event.clone(),
                );
                let task = tokio::spawn(engine.run());
                EngineEntry { handle, task }
            })
    }

    fn prune_dead(&mut self) {
        self.engines.retain(|conversation, entry| {
            let alive = !entry.task.is_finished();
            if !alive {
                tracing::warn!(conversation = %conversation, "pruning dead engine");
            }
            alive
        });
    }

    async fn shutdown_all(&mut self) {
        for (conversation, entry) in self.engines.drain() {
            tracing::debug!(conversation = %conversation, "shutting down engine");
            entry.handle.shutdown().await;
            if let Err(err) = entry.task.await {
                tracing::warn!(conversation = %conversation, error = %err, "engine task ended abnormally");
            }
        }
    }
}

/// Cheap clonable handle to the supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorMsg>,
    tx_event: broadcast::Sender<EngineEvent>,
}

impl SupervisorHandle {
    /// Route one command to one conversation. Engines are created on first
    /// `StartTurn`; `Interrupt` for an unknown id is a logged no-op.
    pub async fn dispatch(
        &self,
        conversation: ConversationId,
        command: ConversationCommand,
    ) -> Result<(), EngineError> {
        let gone = conversation.clone();
        self.tx
            .send(SupervisorMsg::Dispatch {
                conversation,
                command,
            })
            .await
            .map_err(|_| EngineError::EngineGone(gone))
    }

    /// Run one turn to completion.
    pub async fn start_turn(
        &self,
        conversation: ConversationId,
        text: impl Into<String>,
    ) -> Result<TurnReport, EngineError> {
        self.start_turn_with(conversation, text, TurnOptions::default())
            .await
    }

    pub async fn start_turn_with(
        &self,
        conversation: ConversationId,
        text: impl Into<String>,
        options: TurnOptions,
    ) -> Result<TurnReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.dispatch(
            conversation.clone(),
            ConversationCommand::StartTurn {
                text: text.into(),
                options,
                reply,
            },
        )
        .await?;
        rx.await
            .map_err(|_| EngineError::EngineGone(conversation))?
    }

    pub async fn interrupt(&self, conversation: ConversationId) -> Result<(), EngineError> {
        self.dispatch(conversation, ConversationCommand::Interrupt)
            .await
    }

    /// Retire one conversation's engine.
    pub async fn stop_conversation(
        &self,
        conversation: ConversationId,
    ) -> Result<(), EngineError> {
        self.dispatch(conversation, ConversationCommand::Shutdown)
            .await
    }

    /// Ids with a live engine right now.
    pub async fn conversations(&self) -> Vec<ConversationId> {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(SupervisorMsg::Conversations { reply })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Observe events from every engine.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx_event.subscribe()
    }

    /// Drain all engines and stop the supervisor.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.tx.send(SupervisorMsg::Shutdown { done }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendClient, SessionSpec};
    use crate::protocol::{ControlRequestEvent, StreamEvent, UserEvent};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    /// Connector whose backends never come up; engines still get created.
    struct DownConnector;

    #[async_trait]
    impl BackendConnector for DownConnector {
        async fn connect(
            &self,
            _session: &SessionSpec,
        ) -> Result<Box<dyn BackendClient>, EngineError> {
            Err(EngineError::BackendUnavailable("down for maintenance".to_string()))
        }
    }

    fn spawn_supervisor() -> SupervisorHandle {
        Supervisor::spawn(
            Settings::default(),
            Arc::new(DownConnector),
            ToolCatalog::new(),
            Arc::new(crate::transcript::NullTranscript),
        )
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent_per_conversation() {
        let handle = spawn_supervisor();
        let id = ConversationId::new("conv-1");

        for _ in 0..3 {
            let err = handle.start_turn(id.clone(), "hello").await.unwrap_err();
            assert!(matches!(err, EngineError::BackendUnavailable(_)));
        }
        let err = handle
            .start_turn(ConversationId::new("conv-2"), "hi")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::BackendUnavailable(_)));

        let mut conversations = handle.conversations().await;
        conversations.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        assert_eq!(
            conversations,
            vec![ConversationId::new("conv-1"), ConversationId::new("conv-2")]
        );
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn interrupt_for_unknown_conversation_is_a_no_op() {
        let handle = spawn_supervisor();
        handle
            .interrupt(ConversationId::new("nobody-home"))
            .await
            .unwrap();
        assert!(handle.conversations().await.is_empty());
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn stop_conversation_retires_only_that_engine() {
        let handle = spawn_supervisor();
        let keep = ConversationId::new("keep");
        let drop = ConversationId::new("drop");
        let _ = handle.start_turn(keep.clone(), "x").await;
        let _ = handle.start_turn(drop.clone(), "y").await;

        handle.stop_conversation(drop).await.unwrap();
        // The engine exits asynchronously; poll until pruned.
        let mut remaining = handle.conversations().await;
        for _ in 0..50 {
            if remaining.len() == 1 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            remaining = handle.conversations().await;
        }
        assert_eq!(remaining, vec![keep]);
        handle.shutdown().await;
    }

    /// Backend that accepts turns but never produces an event.
    struct StallingBackend;

    #[async_trait]
    impl BackendClient for StallingBackend {
        async fn send_turn(&mut self, _turn: &UserEvent) -> Result<(), EngineError> {
            Ok(())
        }

        async fn send_control(
            &mut self,
            _request: &ControlRequestEvent,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        async fn next_event(&mut self) -> Option<StreamEvent> {
            std::future::pending().await
        }

        async fn shutdown(&mut self) {}
    }

    struct StallingConnector;

    #[async_trait]
    impl BackendConnector for StallingConnector {
        async fn connect(
            &self,
            _session: &SessionSpec,
        ) -> Result<Box<dyn BackendClient>, EngineError> {
            Ok(Box::new(StallingBackend))
        }
    }

    #[tokio::test]
    async fn full_op_queue_rejects_instead_of_stalling_siblings() {
        let handle = Supervisor::spawn(
            Settings::default(),
            Arc::new(StallingConnector),
            ToolCatalog::new(),
            Arc::new(crate::transcript::NullTranscript),
        );
        let busy = ConversationId::new("busy");

        // First turn never finishes; the rest pile into the bounded op queue
        // until it overflows.
        let mut replies = Vec::new();
        for _ in 0..40 {
            let (reply, rx) = oneshot::channel();
            handle
                .dispatch(
                    busy.clone(),
                    ConversationCommand::StartTurn {
                        text: "go".to_string(),
                        options: TurnOptions::default(),
                        reply,
                    },
                )
                .await
                .unwrap();
            replies.push(rx);
        }

        // The command loop still answers for everyone else.
        let conversations =
            tokio::time::timeout(std::time::Duration::from_secs(1), handle.conversations())
                .await
                .expect("registry query must not stall behind a full op queue");
        assert_eq!(conversations, vec![busy]);

        // Overflow submissions were rejected immediately, not queued.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let mut rejected = 0;
        for rx in &mut replies {
            if matches!(rx.try_recv(), Ok(Err(EngineError::QueueFull(_)))) {
                rejected += 1;
            }
        }
        assert!(rejected >= 6, "expected overflow rejections, got {rejected}");
    }

    #[tokio::test]
    async fn commands_after_shutdown_report_engine_gone() {
        let handle = spawn_supervisor();
        handle.shutdown().await;
        let err = handle
            .start_turn(ConversationId::new("late"), "too late")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::EngineGone(_)));
    }
}
