//! Configuration loading and defaults.
//!
//! Settings come from a TOML file (`~/.parley/config.toml` unless
//! overridden), with environment variables taking precedence over the file.
//! A missing file is not an error; every field has a default.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::translator::{AlternateFormat, TranslatorOptions};

pub const DEFAULT_BACKEND_COMMAND: &str = "claude";
pub const DEFAULT_MAX_ITERATIONS: u32 = 200;
pub const DEFAULT_INTERRUPT_ACK_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_STREAM_STALL_TIMEOUT_SECS: u64 = 300;

const ENV_CONFIG_PATH: &str = "PARLEY_CONFIG";
const ENV_BACKEND_COMMAND: &str = "PARLEY_BACKEND_COMMAND";
const ENV_MODEL: &str = "PARLEY_MODEL";

// === File shapes ===

#[derive(Debug, Clone, Deserialize, Default)]
struct SettingsFile {
    backend: Option<BackendFile>,
    engine: Option<EngineFile>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct BackendFile {
    command: Option<String>,
    args: Option<Vec<String>>,
    model: Option<String>,
    permission_mode: Option<String>,
    working_dir: Option<PathBuf>,
    structured_text: Option<bool>,
    text_format: Option<String>,
    max_output_tokens: Option<u32>,
    max_thinking_tokens: Option<u32>,
    disallowed_tools: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct EngineFile {
    max_iterations: Option<u32>,
    interrupt_ack_timeout_secs: Option<u64>,
    stream_stall_timeout_secs: Option<u64>,
    tool_timeout_secs: Option<u64>,
}

// === Resolved settings ===

/// How to launch and talk to the backend process.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendProfile {
    pub command: String,
    pub args: Vec<String>,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub working_dir: Option<PathBuf>,
    pub translator: TranslatorOptions,
    /// Response cap exported to the backend process environment.
    pub max_output_tokens: Option<u32>,
    /// Thinking budget exported to the backend process environment.
    pub max_thinking_tokens: Option<u32>,
    /// Built-in backend tools to disable at launch.
    pub disallowed_tools: Vec<String>,
}

impl Default for BackendProfile {
    fn default() -> Self {
        Self {
            command: DEFAULT_BACKEND_COMMAND.to_string(),
            args: Vec::new(),
            model: None,
            permission_mode: None,
            working_dir: None,
            translator: TranslatorOptions::default(),
            max_output_tokens: None,
            max_thinking_tokens: None,
            disallowed_tools: Vec::new(),
        }
    }
}

/// Turn-loop limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    /// Ceiling on streaming rounds within one user turn.
    pub max_iterations: u32,
    /// How long to wait for the backend to acknowledge an interrupt.
    pub interrupt_ack_timeout: Duration,
    /// A turn fails if the backend goes silent for this long mid-stream.
    pub stream_stall_timeout: Duration,
    /// Per-tool-call budget; `None` means unbounded.
    pub tool_timeout: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            interrupt_ack_timeout: Duration::from_secs(DEFAULT_INTERRUPT_ACK_TIMEOUT_SECS),
            stream_stall_timeout: Duration::from_secs(DEFAULT_STREAM_STALL_TIMEOUT_SECS),
            tool_timeout: None,
        }
    }
}

/// Everything the supervisor needs to build engines.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Settings {
    pub backend: BackendProfile,
    pub engine: EngineSettings,
}

impl Settings {
    /// Load from `path`, falling back to `$PARLEY_CONFIG`, then
    /// `~/.parley/config.toml`, then pure defaults.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(env_config_path).or_else(home_config_path);
        let file = match path {
            Some(ref path) if path.exists() => {
                let contents = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file: {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("failed to parse config file: {}", path.display()))?
            }
            _ => SettingsFile::default(),
        };

        let mut settings = Self::from_file(file)?;
        apply_env_overrides(&mut settings);
        settings.validate()?;
        Ok(settings)
    }

    fn from_file(file: SettingsFile) -> Result<Self> {
        let backend_file = file.backend.unwrap_or_default();
        let engine_file = file.engine.unwrap_or_default();

        let alternate = match backend_file.text_format.as_deref() {
            None | Some("native") => None,
            Some("voice_tagged") => Some(AlternateFormat::VoiceTagged),
            Some(other) => {
                anyhow::bail!("unknown text_format '{other}': expected native or voice_tagged")
            }
        };

        let defaults = BackendProfile::default();
        let backend = BackendProfile {
            command: backend_file.command.unwrap_or(defaults.command),
            args: backend_file.args.unwrap_or_default(),
            model: backend_file.model,
            permission_mode: backend_file.permission_mode,
            working_dir: backend_file.working_dir,
            translator: TranslatorOptions {
                structured_text: backend_file.structured_text.unwrap_or(false),
                alternate,
            },
            max_output_tokens: backend_file.max_output_tokens,
            max_thinking_tokens: backend_file.max_thinking_tokens,
            disallowed_tools: backend_file.disallowed_tools.unwrap_or_default(),
        };

        let engine = EngineSettings {
            max_iterations: engine_file
                .max_iterations
                .unwrap_or(DEFAULT_MAX_ITERATIONS),
            interrupt_ack_timeout: Duration::from_secs(
                engine_file
                    .interrupt_ack_timeout_secs
                    .unwrap_or(DEFAULT_INTERRUPT_ACK_TIMEOUT_SECS),
            ),
            stream_stall_timeout: Duration::from_secs(
                engine_file
                    .stream_stall_timeout_secs
                    .unwrap_or(DEFAULT_STREAM_STALL_TIMEOUT_SECS),
            ),
            tool_timeout: engine_file.tool_timeout_secs.map(Duration::from_secs),
        };

        Ok(Self { backend, engine })
    }

    fn validate(&self) -> Result<()> {
        if self.backend.command.trim().is_empty() {
            anyhow::bail!("backend command cannot be empty");
        }
        if self.engine.max_iterations == 0 {
            anyhow::bail!("max_iterations must be at least 1");
        }
        if self.engine.interrupt_ack_timeout.is_zero() {
            anyhow::bail!("interrupt_ack_timeout_secs must be at least 1");
        }
        if self.engine.stream_stall_timeout.is_zero() {
            anyhow::bail!("stream_stall_timeout_secs must be at least 1");
        }
        Ok(())
    }
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(command) = std::env::var(ENV_BACKEND_COMMAND)
        && !command.trim().is_empty()
    {
        settings.backend.command = command;
    }
    if let Ok(model) = std::env::var(ENV_MODEL)
        && !model.trim().is_empty()
    {
        settings.backend.model = Some(model);
    }
}

fn env_config_path() -> Option<PathBuf> {
    std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from)
}

fn home_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".parley").join("config.toml"))
}
