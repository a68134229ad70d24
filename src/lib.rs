//! Real-time speech-to-speech orchestration: voice activity detection, a
//! streaming LLM adapter with sentence segmentation and tool-call
//! continuation, and a turn orchestrator that fans synthesized audio back
//! out to the caller.
//!
//! This crate is transport-agnostic: it has no opinion on WebSocket, gRPC,
//! or HTTP framing. A deployment wires in concrete [`collaborators::Stt`],
//! [`collaborators::Llm`], [`collaborators::Tts`], [`collaborators::ContextManager`],
//! and [`collaborators::MetricsSink`] implementations and drives
//! [`pipeline::Pipeline::invoke`] from its own transport loop.

pub mod collaborators;
pub mod config;
pub mod data;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod vad;

pub use config::Config;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use vad::VoiceActivityDetector;
