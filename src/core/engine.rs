//! Per-conversation engine actor.
//!
//! Each engine runs in its own tokio task and owns its backend connection,
//! transcript history, and turn state. Commands arrive over an op channel
//! and execute strictly in order; interrupts bypass the queue through a
//! shared cancellation token so they can land mid-turn.
//!
//! A turn is an explicit iterative loop, bounded by `max_iterations`:
//! send one user-shaped round, stream events until the terminal result,
//! run any requested tools, feed their results back as the next round.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::{BackendClient, BackendConnector, SessionSpec};
use crate::config::EngineSettings;
use crate::core::events::{EngineEvent, EngineState, TurnOutcomeStatus};
use crate::core::turn::TurnContext;
use crate::error::EngineError;
use crate::message::{ChatMessage, ConversationId, MessageContent, Role, ToolCall};
use crate::protocol::{
    AssistantEvent, ControlRequestEvent, StreamEvent, UserEvent, WireMessage,
};
use crate::recovery;
use crate::tools::ToolExecutionCoordinator;
use crate::transcript::TranscriptSink;
use crate::translator::ProtocolTranslator;

const OP_CHANNEL_CAPACITY: usize = 32;

// === Commands and reports ===

/// Per-turn options supplied alongside the user message.
#[derive(Debug, Clone)]
pub struct TurnOptions {
    /// Extra system instructions, recorded before the turn runs. Applied to
    /// the backend launch only if the connection is not yet established.
    pub instructions: Option<String>,
    /// Whether tool calls requested this turn are executed. When off, a
    /// tool-use finish reason finalizes the turn with the calls recorded
    /// but unexecuted.
    pub tools_enabled: bool,
    /// Round ceiling for this turn; falls back to the configured default.
    pub max_iterations: Option<u32>,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            instructions: None,
            tools_enabled: true,
            max_iterations: None,
        }
    }
}

/// What a finished turn looked like.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: String,
    pub status: TurnOutcomeStatus,
    /// Cumulative usage across every round of the turn.
    pub usage: crate::protocol::Usage,
    /// Messages finalized by this turn, in transcript order.
    pub messages: Vec<ChatMessage>,
}

/// Operations accepted by the engine actor.
pub enum EngineOp {
    StartTurn {
        text: String,
        options: TurnOptions,
        reply: oneshot::Sender<Result<TurnReport, EngineError>>,
    },
    Shutdown,
}

// === Handle ===

/// Cheap clonable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    id: ConversationId,
    tx_op: mpsc::Sender<EngineOp>,
    cancel: Arc<StdMutex<CancellationToken>>,
}

impl EngineHandle {
    /// Run one user turn to completion.
    pub async fn start_turn(
        &self,
        text: impl Into<String>,
        options: TurnOptions,
    ) -> Result<TurnReport, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.submit_turn(text.into(), options, reply).await?;
        rx.await.map_err(|_| EngineError::EngineGone(self.id.clone()))?
    }

    /// Queue a turn without waiting for it. On a dead engine the reply
    /// channel is answered with `EngineGone` before this returns the error.
    pub async fn submit_turn(
        &self,
        text: String,
        options: TurnOptions,
        reply: oneshot::Sender<Result<TurnReport, EngineError>>,
    ) -> Result<(), EngineError> {
        self.tx_op
            .send(EngineOp::StartTurn {
                text,
                options,
                reply,
            })
            .await
            .map_err(|unsent| {
                if let EngineOp::StartTurn { reply, .. } = unsent.0 {
                    let _ = reply.send(Err(EngineError::EngineGone(self.id.clone())));
                }
                EngineError::EngineGone(self.id.clone())
            })
    }

    /// Queue a turn without waiting and without blocking: a full op queue
    /// rejects immediately. On rejection the reply channel is answered with
    /// the same error before it is returned.
    pub fn try_submit_turn(
        &self,
        text: String,
        options: TurnOptions,
        reply: oneshot::Sender<Result<TurnReport, EngineError>>,
    ) -> Result<(), EngineError> {
        match self.tx_op.try_send(EngineOp::StartTurn {
            text,
            options,
            reply,
        }) {
            Ok(()) => Ok(()),
            Err(err) => {
                let rejection = || match &err {
                    mpsc::error::TrySendError::Full(_) => {
                        EngineError::QueueFull(self.id.clone())
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        EngineError::EngineGone(self.id.clone())
                    }
                };
                let answer = rejection();
                let returned = rejection();
                if let EngineOp::StartTurn { reply, .. } = err.into_inner() {
                    let _ = reply.send(Err(answer));
                }
                Err(returned)
            }
        }
    }

    /// Cancel the active turn, if any. Synchronous so it can land while the
    /// engine is busy streaming.
    pub fn interrupt(&self) {
        if let Ok(token) = self.cancel.lock() {
            token.cancel();
        }
    }

    /// Ask the actor to exit after the current op.
    pub async fn shutdown(&self) {
        let _ = self.tx_op.send(EngineOp::Shutdown).await;
    }

    #[must_use]
    pub fn conversation_id(&self) -> &ConversationId {
        &self.id
    }
}

// === Engine ===

/// What one streamed round asked the engine to do next.
enum RoundOutcome {
    /// Terminal result, no outstanding tool calls.
    Finished,
    /// The model wants these tools run before it continues.
    ToolsRequested(Vec<ToolCall>),
    /// Interrupt acknowledged by the backend.
    Interrupted,
    /// The backend reported the round as failed.
    Failed(String),
}

pub struct ConversationEngine {
    id: ConversationId,
    settings: EngineSettings,
    translator: ProtocolTranslator,
    connector: Arc<dyn BackendConnector>,
    tools: ToolExecutionCoordinator,
    transcript: Arc<dyn TranscriptSink>,
    backend: Option<Box<dyn BackendClient>>,
    history: Vec<ChatMessage>,
    session_id: Option<String>,
    state: EngineState,
    rx_op: mpsc::Receiver<EngineOp>,
    tx_event: broadcast::Sender<EngineEvent>,
    shared_cancel: Arc<StdMutex<CancellationToken>>,
}

impl ConversationEngine {
    pub fn new(
        id: ConversationId,
        settings: EngineSettings,
        translator: ProtocolTranslator,
        connector: Arc<dyn BackendConnector>,
        tools: ToolExecutionCoordinator,
        transcript: Arc<dyn TranscriptSink>,
        tx_event: broadcast::Sender<EngineEvent>,
    ) -> (Self, EngineHandle) {
        let (tx_op, rx_op) = mpsc::channel(OP_CHANNEL_CAPACITY);
        let shared_cancel = Arc::new(StdMutex::new(CancellationToken::new()));
        let handle = EngineHandle {
            id: id.clone(),
            tx_op,
            cancel: Arc::clone(&shared_cancel),
        };
        let engine = Self {
            id,
            settings,
            translator,
            connector,
            tools,
            transcript,
            backend: None,
            history: Vec::new(),
            session_id: None,
            state: EngineState::Idle,
            rx_op,
            tx_event,
            shared_cancel,
        };
        (engine, handle)
    }

    /// Actor loop: ops execute strictly in order until shutdown.
    pub async fn run(mut self) {
        while let Some(op) = self.rx_op.recv().await {
            match op {
                EngineOp::StartTurn {
                    text,
                    options,
                    reply,
                } => {
                    let result = self.run_turn(text, options).await;
                    let _ = reply.send(result);
                }
                EngineOp::Shutdown => break,
            }
        }
        if let Some(mut backend) = self.backend.take() {
            backend.shutdown().await;
        }
        tracing::info!(conversation = %self.id, "engine stopped");
        self.emit(EngineEvent::EngineStopped {
            conversation: self.id.clone(),
        });
    }

    // === Turn driver ===

    async fn run_turn(
        &mut self,
        text: String,
        options: TurnOptions,
    ) -> Result<TurnReport, EngineError> {
        let cancel = self.fresh_cancel_token();
        let tools_enabled = options.tools_enabled;
        let max_iterations = options
            .max_iterations
            .unwrap_or(self.settings.max_iterations);
        let mut ctx = TurnContext::new();
        let turn_id = ctx.turn_id().to_string();
        tracing::info!(conversation = %self.id, turn = %turn_id, "turn started");
        self.emit(EngineEvent::TurnStarted {
            conversation: self.id.clone(),
            turn_id: turn_id.clone(),
        });

        if let Some(instructions) = options.instructions {
            let system = ChatMessage::system_text(instructions);
            if self.backend.is_some() {
                tracing::debug!(
                    conversation = %self.id,
                    "instructions recorded after connect; applied on next launch"
                );
            }
            self.emit(EngineEvent::MessageAppended {
                conversation: self.id.clone(),
                message: system.clone(),
            });
            ctx.finalize(system);
        }

        let user = ChatMessage::user_text(text);
        self.emit(EngineEvent::MessageAppended {
            conversation: self.id.clone(),
            message: user.clone(),
        });
        ctx.finalize(user.clone());
        ctx.queue(user);

        let result = self
            .drive_turn(&mut ctx, &cancel, tools_enabled, max_iterations)
            .await;

        let usage = ctx.usage();
        let rounds = ctx.round();
        let mut messages = ctx.into_messages();
        self.history.extend(messages.iter().cloned());
        if let Err(err) = &result {
            // Whatever streamed before the failure stays; the failure itself
            // closes out the transcript, without entering the model-visible
            // history.
            let notice = ChatMessage::system_text(format!("turn failed: {err}"));
            self.emit(EngineEvent::MessageAppended {
                conversation: self.id.clone(),
                message: notice.clone(),
            });
            messages.push(notice);
        }
        self.transcript.append(&self.id, &messages).await;

        let (status, error) = match &result {
            Ok(status) => (*status, None),
            Err(err) => (TurnOutcomeStatus::Failed, Some(err.to_string())),
        };
        self.set_state(EngineState::Idle);
        tracing::info!(
            conversation = %self.id,
            turn = %turn_id,
            ?status,
            rounds,
            total_tokens = usage.total_tokens(),
            "turn finished"
        );
        self.emit(EngineEvent::TurnCompleted {
            conversation: self.id.clone(),
            turn_id: turn_id.clone(),
            status,
            usage,
            error,
        });

        result.map(|status| TurnReport {
            turn_id,
            status,
            usage,
            messages,
        })
    }

    async fn drive_turn(
        &mut self,
        ctx: &mut TurnContext,
        cancel: &CancellationToken,
        tools_enabled: bool,
        max_iterations: u32,
    ) -> Result<TurnOutcomeStatus, EngineError> {
        let mut backend = match self.backend.take() {
            Some(backend) => backend,
            None => self.connect(ctx).await?,
        };

        let result = self
            .turn_loop(&mut *backend, ctx, cancel, tools_enabled, max_iterations)
            .await;

        match &result {
            Err(EngineError::BackendUnavailable(_)) | Err(EngineError::ControlTimeout { .. }) => {
                // Connection is suspect; rebuild it lazily on the next turn.
                backend.shutdown().await;
            }
            _ => self.backend = Some(backend),
        }
        result
    }

    async fn connect(&mut self, ctx: &TurnContext) -> Result<Box<dyn BackendClient>, EngineError> {
        // Instructions from earlier turns live in history; the current
        // turn's are only finalized into the context so far.
        let instructions = match (
            self.translator.extract_instructions(&self.history),
            self.translator.extract_instructions(ctx.messages()),
        ) {
            (Some(past), Some(current)) => Some(format!("{past}\n\n{current}")),
            (past, current) => past.or(current),
        };
        let session = SessionSpec {
            conversation_id: Some(self.id.clone()),
            instructions,
            resume_session_id: self.session_id.clone(),
        };
        self.connector.connect(&session).await
    }

    async fn turn_loop(
        &mut self,
        backend: &mut dyn BackendClient,
        ctx: &mut TurnContext,
        cancel: &CancellationToken,
        tools_enabled: bool,
        max_iterations: u32,
    ) -> Result<TurnOutcomeStatus, EngineError> {
        loop {
            if cancel.is_cancelled() {
                // Interrupt landed between rounds; nothing is in flight.
                return Ok(TurnOutcomeStatus::Interrupted);
            }
            let round = ctx.begin_round(max_iterations)?;
            tracing::debug!(conversation = %self.id, round, "submitting round");

            let pending = ctx.take_pending();
            let refs: Vec<&ChatMessage> = pending.iter().collect();
            let turn = self
                .translator
                .build_user_event(&refs, self.session_id.as_deref());
            backend.send_turn(&turn).await?;
            self.set_state(EngineState::Streaming);

            match self.stream_round(backend, ctx, cancel, tools_enabled).await? {
                RoundOutcome::Finished => return Ok(TurnOutcomeStatus::Completed),
                RoundOutcome::Interrupted => return Ok(TurnOutcomeStatus::Interrupted),
                RoundOutcome::Failed(text) => {
                    return Err(EngineError::Internal(anyhow::anyhow!(
                        "backend reported failure: {text}"
                    )));
                }
                RoundOutcome::ToolsRequested(calls) => {
                    self.run_tool_round(ctx, calls, cancel).await;
                    if cancel.is_cancelled() {
                        // Unexecuted calls were already resolved as
                        // cancelled; stop before submitting another round.
                        return Ok(TurnOutcomeStatus::Interrupted);
                    }
                }
            }
        }
    }

    // === Streaming phase ===

    async fn stream_round(
        &mut self,
        backend: &mut dyn BackendClient,
        ctx: &mut TurnContext,
        cancel: &CancellationToken,
        tools_enabled: bool,
    ) -> Result<RoundOutcome, EngineError> {
        let mut tool_calls: Vec<ToolCall> = Vec::new();
        let mut tool_use_stop = false;
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    return self.drain_interrupt(backend, ctx).await;
                }
                event = tokio::time::timeout(
                    self.settings.stream_stall_timeout,
                    backend.next_event(),
                ) => match event {
                    Ok(Some(event)) => event,
                    Ok(None) => {
                        return Err(EngineError::BackendUnavailable(
                            "event stream closed mid-turn".to_string(),
                        ));
                    }
                    Err(_) => {
                        return Err(EngineError::BackendUnavailable(format!(
                            "no backend event within {:?}",
                            self.settings.stream_stall_timeout
                        )));
                    }
                },
            };

            match event {
                StreamEvent::System(system) => {
                    if let Some(session) = &system.session_id
                        && self.session_id.is_none()
                    {
                        tracing::debug!(conversation = %self.id, %session, "session established");
                        self.session_id = Some(session.clone());
                    }
                }
                StreamEvent::Assistant(assistant) => {
                    if assistant.message.stop_reason.as_deref()
                        == Some(WireMessage::STOP_TOOL_USE)
                    {
                        tool_use_stop = true;
                    }
                    tool_calls.extend(self.absorb_assistant(ctx, &assistant));
                }
                StreamEvent::User(user) => {
                    // The backend echoes tool results it handled itself.
                    if user.parent_tool_use_id.is_some() {
                        self.absorb_echoed_user(ctx, &user);
                    } else {
                        tracing::trace!(conversation = %self.id, "ignoring echoed round input");
                    }
                }
                StreamEvent::Result(result) => {
                    if result.is_error {
                        let text = result
                            .result
                            .unwrap_or_else(|| result.subtype.clone());
                        return Ok(RoundOutcome::Failed(text));
                    }
                    // Another round happens only when the finish reason asked
                    // for tools, calls actually arrived, and this turn allows
                    // running them.
                    if tools_enabled && tool_use_stop && !tool_calls.is_empty() {
                        return Ok(RoundOutcome::ToolsRequested(tool_calls));
                    }
                    if !tool_calls.is_empty() {
                        tracing::debug!(
                            conversation = %self.id,
                            calls = tool_calls.len(),
                            "leaving requested tool calls unexecuted"
                        );
                    }
                    return Ok(RoundOutcome::Finished);
                }
                StreamEvent::ControlRequest(request) => {
                    tracing::debug!(
                        conversation = %self.id,
                        subtype = %request.request.subtype,
                        "ignoring backend-initiated control request"
                    );
                }
                StreamEvent::ControlResponse(response) => {
                    tracing::debug!(
                        conversation = %self.id,
                        request_id = %response.response.request_id,
                        "unsolicited control response"
                    );
                }
                StreamEvent::Unknown(value) => {
                    tracing::trace!(conversation = %self.id, %value, "unrecognized event");
                }
            }
        }
    }

    /// Map one assistant event into the transcript, running text-embedded
    /// tool-call recovery when the finish reason promises tool use but no
    /// structured blocks arrived.
    fn absorb_assistant(
        &mut self,
        ctx: &mut TurnContext,
        event: &AssistantEvent,
    ) -> Vec<ToolCall> {
        if self.session_id.is_none()
            && let Some(session) = &event.session_id
        {
            self.session_id = Some(session.clone());
        }

        let mut message = self.translator.assistant_message(event);
        if message.meta.stop_reason.as_deref() == Some(WireMessage::STOP_TOOL_USE)
            && message.tool_calls().is_empty()
        {
            message = recover_embedded_calls(message);
        }
        if let Some(usage) = &message.meta.usage {
            ctx.absorb_usage(usage);
        }

        let calls: Vec<ToolCall> = message.tool_calls().into_iter().cloned().collect();
        ctx.finalize(message.clone());
        self.emit(EngineEvent::MessageAppended {
            conversation: self.id.clone(),
            message,
        });
        calls
    }

    fn absorb_echoed_user(&mut self, ctx: &mut TurnContext, event: &UserEvent) {
        let message = self.translator.user_message(event);
        ctx.finalize(message.clone());
        self.emit(EngineEvent::MessageAppended {
            conversation: self.id.clone(),
            message,
        });
    }

    /// Cooperative interrupt: ask the backend to stop, keep recording what
    /// still arrives, and finish only on the matching acknowledgment.
    async fn drain_interrupt(
        &mut self,
        backend: &mut dyn BackendClient,
        ctx: &mut TurnContext,
    ) -> Result<RoundOutcome, EngineError> {
        self.set_state(EngineState::Interrupting);
        let request = ControlRequestEvent::interrupt();
        tracing::info!(
            conversation = %self.id,
            request_id = %request.request_id,
            "sending interrupt"
        );
        backend.send_control(&request).await?;

        let ack_timeout = self.settings.interrupt_ack_timeout;
        let drain = async {
            while let Some(event) = backend.next_event().await {
                match event {
                    StreamEvent::ControlResponse(response)
                        if response.response.request_id == request.request_id =>
                    {
                        if let Some(error) = &response.response.error {
                            tracing::warn!(conversation = %self.id, %error, "interrupt ack carried an error");
                        }
                        return true;
                    }
                    StreamEvent::Assistant(assistant) => {
                        // Content emitted before the stop lands is kept.
                        let _ = self.absorb_assistant(ctx, &assistant);
                    }
                    other => {
                        tracing::trace!(conversation = %self.id, ?other, "draining event during interrupt");
                    }
                }
            }
            false
        };

        match tokio::time::timeout(ack_timeout, drain).await {
            Ok(true) => Ok(RoundOutcome::Interrupted),
            Ok(false) => Err(EngineError::BackendUnavailable(
                "event stream closed during interrupt".to_string(),
            )),
            Err(_) => Err(EngineError::ControlTimeout {
                subtype: ControlRequestEvent::SUBTYPE_INTERRUPT.to_string(),
                timeout: ack_timeout,
            }),
        }
    }

    // === Tool phase ===

    async fn run_tool_round(
        &mut self,
        ctx: &mut TurnContext,
        calls: Vec<ToolCall>,
        cancel: &CancellationToken,
    ) {
        self.set_state(EngineState::ExecutingTools);
        for call in &calls {
            self.emit(EngineEvent::ToolCallStarted {
                conversation: self.id.clone(),
                id: call.id.clone(),
                name: call.name.clone(),
                input: call.arguments.clone(),
            });
        }

        let results = self.tools.execute_round(&calls, cancel).await;

        for result in &results {
            if let MessageContent::ToolResult {
                tool_call_id,
                is_error,
                ..
            } = result
            {
                self.emit(EngineEvent::ToolCallCompleted {
                    conversation: self.id.clone(),
                    id: tool_call_id.clone(),
                    is_error: *is_error,
                });
            }
        }

        let message = ChatMessage::new(Role::User, results);
        ctx.finalize(message.clone());
        self.emit(EngineEvent::MessageAppended {
            conversation: self.id.clone(),
            message: message.clone(),
        });
        ctx.queue(message);
    }

    // === Plumbing ===

    fn fresh_cancel_token(&mut self) -> CancellationToken {
        let token = CancellationToken::new();
        if let Ok(mut shared) = self.shared_cancel.lock() {
            *shared = token.clone();
        }
        token
    }

    fn set_state(&mut self, state: EngineState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.emit(EngineEvent::StateChanged {
            conversation: self.id.clone(),
            state,
        });
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is fine.
        let _ = self.tx_event.send(event);
    }
}

/// Rewrite text items carrying embedded tool markup into residual text
/// plus structured tool calls, preserving block order.
fn recover_embedded_calls(message: ChatMessage) -> ChatMessage {
    let mut content = Vec::with_capacity(message.content.len());
    for item in message.content {
        match item {
            MessageContent::Text { text, voice, raw }
                if recovery::has_embedded_tool_calls(&text) =>
            {
                let recovered = recovery::extract_tool_calls(&text);
                if !recovered.residual_text.is_empty() {
                    content.push(MessageContent::Text {
                        text: recovered.residual_text,
                        voice,
                        raw,
                    });
                }
                for call in recovered.calls {
                    tracing::info!(tool = %call.name, "recovered tool call embedded in text");
                    content.push(MessageContent::ToolCall(call));
                }
            }
            other => content.push(other),
        }
    }
    ChatMessage { content, ..message }
}
