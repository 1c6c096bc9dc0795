//! Backend process transport.
//!
//! The backend is a CLI speaking NDJSON on stdin/stdout. Each conversation
//! engine exclusively owns one connection; the reader task feeds parsed
//! events through an mpsc channel so a slow consumer backpressures the
//! pipe instead of buffering unboundedly.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::BackendProfile;
use crate::error::EngineError;
use crate::message::ConversationId;
use crate::protocol::{ControlRequestEvent, StreamEvent, UserEvent};
use crate::translator::ProtocolTranslator;

const EVENT_CHANNEL_CAPACITY: usize = 256;

const ENV_MAX_OUTPUT_TOKENS: &str = "CLAUDE_CODE_MAX_OUTPUT_TOKENS";
const ENV_MAX_THINKING_TOKENS: &str = "MAX_THINKING_TOKENS";

/// Everything conversation-specific the connector needs at launch.
#[derive(Debug, Clone, Default)]
pub struct SessionSpec {
    pub conversation_id: Option<ConversationId>,
    /// Concatenated system-role instructions, appended to the backend's
    /// own system prompt.
    pub instructions: Option<String>,
    /// Backend session to resume, when one is known.
    pub resume_session_id: Option<String>,
}

// === Contracts ===

/// One live NDJSON connection to the backend.
#[async_trait]
pub trait BackendClient: Send {
    /// Submit the single user-shaped object for one round.
    async fn send_turn(&mut self, turn: &UserEvent) -> Result<(), EngineError>;

    /// Submit an out-of-band control request (interrupt et al.).
    async fn send_control(&mut self, request: &ControlRequestEvent) -> Result<(), EngineError>;

    /// Next parsed event; `None` once the stream has closed.
    async fn next_event(&mut self) -> Option<StreamEvent>;

    async fn shutdown(&mut self);
}

/// Resolves and connects a backend for one conversation.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, session: &SessionSpec) -> Result<Box<dyn BackendClient>, EngineError>;
}

// === Subprocess implementation ===

/// Launches the backend CLI per conversation.
#[derive(Debug, Clone)]
pub struct SubprocessConnector {
    profile: BackendProfile,
}

impl SubprocessConnector {
    #[must_use]
    pub fn new(profile: BackendProfile) -> Self {
        Self { profile }
    }

    fn command(&self, session: &SessionSpec) -> Command {
        let mut cmd = Command::new(&self.profile.command);
        cmd.args(launch_args(&self.profile, session));
        if let Some(dir) = &self.profile.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(cap) = self.profile.max_output_tokens {
            cmd.env(ENV_MAX_OUTPUT_TOKENS, cap.to_string());
        }
        if let Some(budget) = self.profile.max_thinking_tokens {
            cmd.env(ENV_MAX_THINKING_TOKENS, budget.to_string());
        }
        cmd
    }
}

/// Argument list for one launch; kept separate so it stays testable
/// without spawning anything.
fn launch_args(profile: &BackendProfile, session: &SessionSpec) -> Vec<String> {
    let mut args = vec![
        "--input-format".to_string(),
        "stream-json".to_string(),
        "--output-format".to_string(),
        "stream-json".to_string(),
        "--verbose".to_string(),
    ];
    args.extend(profile.args.iter().cloned());
    if let Some(model) = &profile.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(mode) = &profile.permission_mode {
        args.push("--permission-mode".to_string());
        args.push(mode.clone());
    }
    if !profile.disallowed_tools.is_empty() {
        args.push("--disallowed-tools".to_string());
        args.push(profile.disallowed_tools.join(","));
    }
    if let Some(instructions) = &session.instructions {
        args.push("--append-system-prompt".to_string());
        args.push(instructions.clone());
    }
    if let Some(session_id) = &session.resume_session_id {
        args.push("--resume".to_string());
        args.push(session_id.clone());
    }
    args
}

#[async_trait]
impl BackendConnector for SubprocessConnector {
    async fn connect(&self, session: &SessionSpec) -> Result<Box<dyn BackendClient>, EngineError> {
        let conversation = session
            .conversation_id
            .as_ref()
            .map(ConversationId::as_str)
            .unwrap_or("-");
        tracing::info!(
            command = %self.profile.command,
            conversation,
            "launching backend process"
        );
        let backend = SubprocessBackend::spawn(
            self.command(session),
            ProtocolTranslator::new(self.profile.translator),
        )?;
        Ok(Box::new(backend))
    }
}

/// A live backend child process.
pub struct SubprocessBackend {
    child: Child,
    stdin: ChildStdin,
    events: mpsc::Receiver<StreamEvent>,
    reader: JoinHandle<()>,
    stderr_drain: Option<JoinHandle<()>>,
}

impl SubprocessBackend {
    /// Spawn `cmd` with piped stdio and start the reader and stderr-drain
    /// tasks. Public so harnesses can point it at stand-in processes.
    pub fn spawn(mut cmd: Command, translator: ProtocolTranslator) -> Result<Self, EngineError> {
        cmd.stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|err| EngineError::BackendUnavailable(format!("spawn failed: {err}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::BackendUnavailable("stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::BackendUnavailable("stdout not piped".to_string()))?;
        let stderr = child.stderr.take();

        let (tx, events) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        tracing::trace!(len = line.len(), "backend line");
                        if tx.send(translator.parse_line(line)).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "backend stdout read failed");
                        break;
                    }
                }
            }
        });

        let stderr_drain = stderr.map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "parley::backend::stderr", "{line}");
                }
            })
        });

        Ok(Self {
            child,
            stdin,
            events,
            reader,
            stderr_drain,
        })
    }

    async fn write_line(&mut self, event: &StreamEvent) -> Result<(), EngineError> {
        let mut line = serde_json::to_vec(event).map_err(|err| {
            EngineError::Internal(anyhow::anyhow!("failed to encode wire event: {err}"))
        })?;
        line.push(b'\n');
        self.stdin
            .write_all(&line)
            .await
            .map_err(|err| EngineError::BackendUnavailable(format!("stdin write failed: {err}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| EngineError::BackendUnavailable(format!("stdin flush failed: {err}")))
    }
}

#[async_trait]
impl BackendClient for SubprocessBackend {
    async fn send_turn(&mut self, turn: &UserEvent) -> Result<(), EngineError> {
        self.write_line(&StreamEvent::User(turn.clone())).await
    }

    async fn send_control(&mut self, request: &ControlRequestEvent) -> Result<(), EngineError> {
        self.write_line(&StreamEvent::ControlRequest(request.clone()))
            .await
    }

    async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    async fn shutdown(&mut self) {
        if let Err(err) = self.stdin.shutdown().await {
            tracing::debug!(error = %err, "backend stdin close failed");
        }
        if let Err(err) = self.child.kill().await {
            tracing::debug!(error = %err, "backend kill failed");
        }
        self.reader.abort();
        if let Some(drain) = self.stderr_drain.take() {
            drain.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::WireContentBlock;
    use crate::translator::TranslatorOptions;
    use pretty_assertions::assert_eq;

    fn profile() -> BackendProfile {
        BackendProfile {
            model: Some("sonnet".to_string()),
            permission_mode: Some("acceptEdits".to_string()),
            disallowed_tools: vec!["Bash".to_string(), "WebFetch".to_string()],
            ..BackendProfile::default()
        }
    }

    #[test]
    fn launch_args_carry_profile_and_session() {
        let session = SessionSpec {
            instructions: Some("Be brief.".to_string()),
            resume_session_id: Some("sess-9".to_string()),
            ..SessionSpec::default()
        };
        let args = launch_args(&profile(), &session);
        let joined = args.join(" ");
        assert!(joined.starts_with(
            "--input-format stream-json --output-format stream-json --verbose"
        ));
        assert!(joined.contains("--model sonnet"));
        assert!(joined.contains("--permission-mode acceptEdits"));
        assert!(joined.contains("--disallowed-tools Bash,WebFetch"));
        assert!(joined.contains("--append-system-prompt Be brief."));
        assert!(joined.contains("--resume sess-9"));
    }

    #[test]
    fn launch_args_omit_absent_options() {
        let args = launch_args(&BackendProfile::default(), &SessionSpec::default());
        assert_eq!(
            args,
            vec![
                "--input-format",
                "stream-json",
                "--output-format",
                "stream-json",
                "--verbose",
            ]
        );
    }

    // `cat` echoes what we write, which exercises the full pipe loop:
    // serialize, write, read back, parse.
    #[tokio::test]
    async fn subprocess_round_trips_ndjson_through_cat() {
        let translator = ProtocolTranslator::new(TranslatorOptions::default());
        let mut backend =
            SubprocessBackend::spawn(Command::new("cat"), translator).unwrap();

        let turn = UserEvent {
            message: crate::protocol::WireMessage::user(vec![WireContentBlock::Text {
                text: "hello".to_string(),
            }]),
            parent_tool_use_id: None,
            session_id: Some("sess-1".to_string()),
        };
        backend.send_turn(&turn).await.unwrap();

        let Some(StreamEvent::User(echoed)) = backend.next_event().await else {
            panic!("expected echoed user event");
        };
        assert_eq!(echoed, turn);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn closed_stream_yields_none() {
        let translator = ProtocolTranslator::new(TranslatorOptions::default());
        let mut backend =
            SubprocessBackend::spawn(Command::new("true"), translator).unwrap();
        assert_eq!(backend.next_event().await, None);
        backend.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_backend_unavailable() {
        let translator = ProtocolTranslator::new(TranslatorOptions::default());
        let err = SubprocessBackend::spawn(
            Command::new("/definitely/not/a/real/binary"),
            translator,
        )
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::BackendUnavailable(_)));
    }
}
