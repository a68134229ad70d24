//! Error types for the speech-to-speech orchestration core.

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error taxonomy.
///
/// Most variants are non-fatal from the orchestrator's point of view: see
/// the propagation rules in `pipeline` and `llm` for which ones abort a
/// turn versus which are downgraded to a logged event.
#[derive(Debug, Error)]
pub enum Error {
    /// No text, no audio, and no files were present on the request.
    #[error("request carried no text, audio, or files")]
    InputEmpty,

    /// The STT collaborator failed or is unreachable.
    #[error("speech-to-text unavailable: {0}")]
    SttUnavailable(String),

    /// The STT collaborator returned no recognizable speech.
    #[error("speech-to-text returned empty transcription")]
    SttEmpty,

    /// The LLM stream failed mid-turn.
    #[error("LLM stream error: {0}")]
    LlmStreamError(String),

    /// A tool function raised while handling a tool call.
    #[error("tool '{name}' execution failed: {message}")]
    ToolExecutionError {
        /// Name of the tool that failed.
        name: String,
        /// Error message, also serialized back to the model as the tool result.
        message: String,
    },

    /// TTS synthesis failed for one chunk.
    #[error("TTS synthesis failed: {0}")]
    TtsError(String),

    /// A downstream transport adapter failed to deliver a response.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Malformed PCM was handed to the VAD (odd-length chunk).
    #[error("VAD input error: {0}")]
    VadInputError(String),

    /// The session referenced by this operation does not exist.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialization error, e.g. while parsing accumulated tool-call arguments.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing error when loading configuration from a file/string.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error, e.g. while reading a configuration file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
