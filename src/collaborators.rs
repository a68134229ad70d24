//! External collaborator seams: STT, LLM, TTS, history storage, and metrics.
//!
//! These are the interfaces a transport/deployment shell implements and
//! wires in; this crate never talks to a concrete provider directly. See
//! SPEC_FULL.md §6.

use crate::data::{LlmMessage, PerformanceRecord};
use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

/// Transcribes raw audio into text. An empty return means "no speech detected".
#[async_trait]
pub trait Stt: Send + Sync {
    /// `audio` is 16-bit little-endian PCM, mono, at the configured sample rate.
    async fn transcribe(&self, audio: &[u8]) -> Result<String>;
}

/// One fragment of a streamed tool-call argument, keyed the way OpenAI-style
/// clients key them: by `(choice_index, tool_call_index)`.
#[derive(Debug, Clone, Default)]
pub struct ToolCallFragment {
    /// `(choice_index, tool_call_index)`.
    pub index: (u32, u32),
    /// Present on the header fragment that opens a new call.
    pub id: Option<String>,
    /// Present on the header fragment that opens a new call.
    pub name: Option<String>,
    /// Present on argument-streaming fragments; appended, never replaced.
    pub arguments_fragment: Option<String>,
}

/// One decoded unit of a raw provider stream: plain content, a tool-call
/// fragment, or both (providers may interleave them within one delta).
#[derive(Debug, Clone, Default)]
pub struct LlmDelta {
    /// Content text appended to the running segmentation buffer.
    pub content: Option<String>,
    /// Zero or more tool-call fragments carried by this delta.
    pub tool_call_fragments: Vec<ToolCallFragment>,
}

/// A tool definition advertised to the provider alongside the message list.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    /// Function name, matched against `ToolCall::name` on dispatch.
    pub name: String,
    /// Human-readable description forwarded to the provider.
    pub description: String,
    /// JSON Schema describing the function's arguments.
    pub parameters: serde_json::Value,
}

/// Streaming chat completion provider.
#[async_trait]
pub trait Llm: Send + Sync {
    /// Open a streaming completion over `messages`, optionally advertising `tools`.
    async fn get_llm_stream_response(
        &self,
        context_id: &str,
        messages: Vec<LlmMessage>,
        tools: Option<Vec<ToolSpec>>,
    ) -> Result<BoxStream<'static, Result<LlmDelta>>>;
}

/// Per-turn style hint passed to `Tts::synthesize`.
#[derive(Debug, Clone, Default)]
pub struct StyleInfo {
    /// The full display text this chunk's voice_text was derived from,
    /// inspected by style-mapping TTS implementations against substrings.
    pub styled_text: String,
}

/// Text-to-speech synthesis provider.
#[async_trait]
pub trait Tts: Send + Sync {
    /// Synthesize `text`. An empty return is valid (e.g. silence/failure).
    async fn synthesize(
        &self,
        text: &str,
        style_info: Option<StyleInfo>,
        language: Option<&str>,
    ) -> Result<Vec<u8>>;
}

/// Conversation history storage, keyed by session/context id.
#[async_trait]
pub trait ContextManager: Send + Sync {
    /// Oldest-first history, already excluding entries older than this
    /// store's configured retention window.
    async fn get_histories(&self, context_id: &str, limit: usize) -> Result<Vec<LlmMessage>>;
    /// Append `messages` to the stored history for `context_id`.
    async fn add_histories(
        &self,
        context_id: &str,
        messages: Vec<LlmMessage>,
        schema_tag: &str,
    ) -> Result<()>;
}

/// Per-turn metrics sink.
#[async_trait]
pub trait MetricsSink: Send + Sync {
    /// Persist one turn's `PerformanceRecord`. Best-effort: failures are
    /// logged by the orchestrator, never propagated to the caller.
    async fn record(&self, record: PerformanceRecord) -> Result<()>;
}

/// A registered tool function: parsed JSON arguments in, JSON result (or
/// error) out. Errors are serialized back to the model rather than aborting
/// the turn (see `Error::ToolExecutionError`).
pub type ToolFn = Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value>> + Send + Sync>;

/// Name-keyed registry of tool functions and their advertised specs.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    pub(crate) specs: HashMap<String, ToolSpec>,
    pub(crate) functions: HashMap<String, ToolFn>,
}

impl ToolRegistry {
    /// Register a tool under `spec.name`, replacing any existing registration.
    pub fn register(&mut self, spec: ToolSpec, function: ToolFn) {
        self.functions.insert(spec.name.clone(), function);
        self.specs.insert(spec.name.clone(), spec);
    }

    /// Specs for every registered tool, in registration order is not
    /// guaranteed; callers needing a stable order should sort by name.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.specs.values().cloned().collect()
    }

    pub(crate) fn get(&self, name: &str) -> Option<ToolFn> {
        self.functions.get(name).cloned()
    }

    /// True if no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}
