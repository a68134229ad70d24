//! Core data types shared by the VAD, the LLM adapter, and the orchestrator.
//!
//! These types are transport-agnostic: encoding to a wire format (JSON over
//! WebSocket, protobuf over gRPC, ...) is a transport concern out of this
//! crate's scope.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single detected utterance: PCM bytes plus the trimmed speaking duration.
///
/// Immutable once constructed. `duration_seconds` is `record_duration -
/// silence_duration`: trailing silence is trimmed from the reported
/// duration, not from `bytes`.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Raw 16-bit little-endian PCM bytes, including pre-roll.
    pub bytes: Vec<u8>,
    /// Trimmed speaking duration in seconds.
    pub duration_seconds: f32,
    /// Session the utterance belongs to.
    pub session_id: String,
}

/// One inbound request for a conversational turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StsRequest {
    /// Session / conversation identifier.
    pub context_id: String,
    /// Opaque caller identity, forwarded to metrics.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Pre-recognized text. When present, STT is skipped.
    #[serde(default)]
    pub text: Option<String>,
    /// Raw PCM audio to transcribe. Mutually exclusive with `text` in practice.
    #[serde(default)]
    pub audio_data: Option<Vec<u8>>,
    /// Caller-reported audio duration in seconds, informational only.
    #[serde(default)]
    pub audio_duration: Option<f32>,
    /// Attached file references (names/urls/opaque ids - never interpreted here).
    #[serde(default)]
    pub files: Vec<String>,
}

/// A tool call surfaced by the LLM, or invoked by the adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, when known.
    #[serde(default)]
    pub id: Option<String>,
    /// Function name.
    pub name: String,
    /// Raw JSON-encoded arguments, accumulated during streaming.
    pub arguments: String,
}

/// One outbound event of a turn, in emission order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StsResponse {
    /// A turn has begun.
    Start {
        /// Session the turn belongs to.
        session_id: String,
    },
    /// Carries display text, spoken text, and/or synthesized audio.
    Chunk {
        /// Session the turn belongs to.
        session_id: String,
        /// Text suitable for display.
        text: String,
        /// Subset of `text` intended for speech, after tag filtering.
        voice_text: String,
        /// Synthesized audio for `voice_text`. Empty if this chunk carried no spoken text,
        /// or if TTS synthesis failed for this chunk.
        #[serde(with = "base64_bytes")]
        audio_data: Vec<u8>,
    },
    /// A structured tool invocation the model requested.
    ToolCall {
        /// Session the turn belongs to.
        session_id: String,
        /// The tool call.
        tool_call: ToolCall,
    },
    /// Terminal marker for the turn.
    Final {
        /// Session the turn belongs to.
        session_id: String,
        /// Concatenation of every `Chunk.text` emitted this turn.
        text: String,
        /// Concatenation of every `Chunk.voice_text` emitted this turn.
        voice_text: String,
    },
    /// Externally signalled cancellation of an in-flight turn.
    Stop {
        /// Session the turn belongs to.
        session_id: String,
    },
}

impl StsResponse {
    /// The session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            StsResponse::Start { session_id }
            | StsResponse::Chunk { session_id, .. }
            | StsResponse::ToolCall { session_id, .. }
            | StsResponse::Final { session_id, .. }
            | StsResponse::Stop { session_id } => session_id,
        }
    }
}

mod base64_bytes {
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

/// A single entry in a conversation history.
///
/// Represented as a typed enum rather than an opaque blob specifically so
/// that "is this a user message" never degenerates into inspecting a
/// loosely-typed map by convention (see SPEC_FULL.md §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum LlmMessage {
    /// System prompt / instructions.
    System {
        /// Message content.
        content: String,
    },
    /// A message from the human user.
    User {
        /// Message content.
        content: String,
    },
    /// A message produced by the assistant, optionally requesting tool calls.
    Assistant {
        /// Display text the assistant produced, if any.
        #[serde(default)]
        content: String,
        /// Tool calls requested alongside (or instead of) content.
        #[serde(default)]
        tool_calls: Vec<ToolCall>,
    },
    /// The result of executing a tool call.
    Tool {
        /// Id of the tool call this result answers.
        tool_call_id: String,
        /// Serialized result (or serialized error) content.
        content: String,
    },
}

impl LlmMessage {
    /// True for `LlmMessage::User`.
    pub fn is_user(&self) -> bool {
        matches!(self, LlmMessage::User { .. })
    }
}

/// One decoded fragment of a streamed LLM reply.
///
/// `text` and `voice_text` are independently optional: a fragment may carry
/// one, both, or neither (e.g. a bare tool-call fragment carries neither).
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    /// Session / conversation this fragment belongs to.
    pub context_id: String,
    /// Display-text segment, when this fragment completed a sentence.
    pub text: Option<String>,
    /// Speech-intended subset of `text`, after tag filtering.
    pub voice_text: Option<String>,
    /// A fully-aggregated tool call, surfaced once streaming completes.
    pub tool_call: Option<ToolCall>,
}

/// Per-turn latency and identity metrics, persisted best-effort even for
/// aborted turns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceRecord {
    /// UUIDv4 allocated at the start of the turn.
    pub transaction_id: String,
    /// Session / conversation id.
    pub context_id: String,
    /// Caller identity, if known.
    pub user_id: Option<String>,
    /// Caller-reported input audio duration in seconds.
    pub voice_length: f32,
    /// Seconds spent in STT, if audio was transcribed.
    pub stt_time: Option<f32>,
    /// Seconds spent invoking `stop_response`.
    pub stop_response_time: Option<f32>,
    /// Seconds from turn start to the first LLM fragment of any kind.
    pub llm_first_chunk_time: Option<f32>,
    /// Seconds from turn start to the first fragment carrying `voice_text`.
    pub llm_first_voice_chunk_time: Option<f32>,
    /// Total seconds spent streaming the LLM reply.
    pub llm_time: Option<f32>,
    /// Seconds from turn start to the first non-empty synthesized chunk.
    pub tts_first_chunk_time: Option<f32>,
    /// Total seconds spent across all TTS calls this turn.
    pub tts_time: Option<f32>,
    /// Total wall-clock seconds for the turn.
    pub total_time: f32,
    /// Name of the STT collaborator used, if any.
    pub stt_name: Option<String>,
    /// Name of the LLM collaborator used.
    pub llm_name: Option<String>,
    /// Name of the TTS collaborator used.
    pub tts_name: Option<String>,
    /// The resolved request text (verbatim or transcribed).
    pub request_text: String,
    /// Concatenated display text of the response.
    pub response_text: String,
    /// Concatenated voice text of the response.
    pub response_voice_text: String,
    /// File references attached to the request.
    pub request_files: Vec<String>,
}

/// Opaque, caller-defined per-session key/value data.
///
/// The core never interprets these; they exist so a transport adapter can
/// stash things like client connection metadata alongside VAD state without
/// a separate side-table.
pub type SessionData = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sts_response_chunk_roundtrips_through_json() {
        let resp = StsResponse::Chunk {
            session_id: "s1".into(),
            text: "hello".into(),
            voice_text: "hello".into(),
            audio_data: vec![1, 2, 3, 4],
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"type\":\"chunk\""));
        let back: StsResponse = serde_json::from_str(&json).unwrap();
        match back {
            StsResponse::Chunk { audio_data, .. } => assert_eq!(audio_data, vec![1, 2, 3, 4]),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn session_id_accessor_covers_every_variant() {
        let variants = vec![
            StsResponse::Start { session_id: "a".into() },
            StsResponse::Final { session_id: "a".into(), text: "".into(), voice_text: "".into() },
            StsResponse::Stop { session_id: "a".into() },
        ];
        for v in variants {
            assert_eq!(v.session_id(), "a");
        }
    }

    #[test]
    fn leading_history_trim_uses_typed_role() {
        let history = vec![
            LlmMessage::Assistant { content: "stale".into(), tool_calls: vec![] },
            LlmMessage::Tool { tool_call_id: "x".into(), content: "stale".into() },
            LlmMessage::User { content: "hi".into() },
        ];
        let trimmed: Vec<_> = history
            .into_iter()
            .skip_while(|m| !m.is_user())
            .collect();
        assert_eq!(trimmed.len(), 1);
        assert!(trimmed[0].is_user());
    }
}
