//! Integration coverage wiring the VAD and the orchestrator together through
//! the crate's public surface only, the way a transport adapter would.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use sts_pipeline::collaborators::{ContextManager, Llm, LlmDelta, ToolSpec};
use sts_pipeline::data::{LlmMessage, StsRequest, StsResponse};
use sts_pipeline::error::Result;
use sts_pipeline::llm::LlmAdapter;
use sts_pipeline::vad::{VadConfig, VoiceActivityDetector};
use sts_pipeline::Pipeline;

struct EchoLlm;

#[async_trait]
impl Llm for EchoLlm {
    async fn get_llm_stream_response(
        &self,
        _context_id: &str,
        messages: Vec<LlmMessage>,
        _tools: Option<Vec<ToolSpec>>,
    ) -> Result<BoxStream<'static, Result<LlmDelta>>> {
        let last_user = messages
            .iter()
            .rev()
            .find_map(|m| match m {
                LlmMessage::User { content } => Some(content.clone()),
                _ => None,
            })
            .unwrap_or_default();
        let reply = format!("you said {last_user}. ");
        Ok(Box::pin(stream::iter(vec![Ok(LlmDelta {
            content: Some(reply),
            ..Default::default()
        })])))
    }
}

struct NoHistory;

#[async_trait]
impl ContextManager for NoHistory {
    async fn get_histories(&self, _context_id: &str, _limit: usize) -> Result<Vec<LlmMessage>> {
        Ok(Vec::new())
    }
    async fn add_histories(
        &self,
        _context_id: &str,
        _messages: Vec<LlmMessage>,
        _schema_tag: &str,
    ) -> Result<()> {
        Ok(())
    }
}

fn loud_chunk(samples: usize, amplitude: i16) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples * 2);
    for _ in 0..samples {
        out.extend_from_slice(&amplitude.to_le_bytes());
    }
    out
}

fn silent_chunk(samples: usize) -> Vec<u8> {
    vec![0u8; samples * 2]
}

/// A detected utterance's (fake) transcription is handed straight to the
/// orchestrator, end to end: audio in, `start`/`chunk`/`final` out.
#[tokio::test]
async fn utterance_to_turn_round_trip() {
    let transcribed_marker = Arc::new(AtomicBool::new(false));
    let marker = transcribed_marker.clone();

    let adapter = LlmAdapter::new(Arc::new(EchoLlm), Arc::new(NoHistory));
    let pipeline = Arc::new(Pipeline::new(adapter));
    let pipeline_for_handler = pipeline.clone();

    let vad = VoiceActivityDetector::new(VadConfig::default()).with_emit_handler(Arc::new(
        move |utterance| {
            let pipeline = pipeline_for_handler.clone();
            let marker = marker.clone();
            Box::pin(async move {
                marker.store(true, Ordering::SeqCst);
                let request = StsRequest {
                    context_id: utterance.session_id,
                    text: Some("hello there".to_string()),
                    audio_duration: Some(utterance.duration_seconds),
                    ..Default::default()
                };
                let stream = pipeline.invoke(request).await?;
                let _: Vec<_> = stream.collect().await;
                Ok(())
            })
        },
    ));

    vad.process_samples("session-a", &loud_chunk(8_000, 1_500)).await.unwrap();
    vad.process_samples("session-a", &silent_chunk(16_000)).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(transcribed_marker.load(Ordering::SeqCst));
}

/// Invariant 1 (SPEC_FULL.md §8): pre-roll never exceeds its configured cap,
/// observed purely through the public API across many chunks.
#[tokio::test]
async fn preroll_bound_holds_under_sustained_silence() {
    let config = VadConfig { preroll_buffer_count: 4, ..VadConfig::default() };
    let vad = VoiceActivityDetector::new(config);
    for _ in 0..50 {
        vad.process_samples("session-b", &silent_chunk(160)).await.unwrap();
    }
    assert_eq!(vad.preroll_len("session-b").await, 4);
}

/// Each turn for a session invokes `stop_response` before its own `start`,
/// and still terminates with its own `final` — the preemption hook every
/// subsequent turn is expected to fire.
#[tokio::test]
async fn each_turn_observes_stop_response_before_its_own_start() {
    let preemption_log = Arc::new(Mutex::new(Vec::new()));
    let log_for_hook = preemption_log.clone();

    let adapter = LlmAdapter::new(Arc::new(EchoLlm), Arc::new(NoHistory));
    let pipeline = Pipeline::new(adapter).with_stop_response(Arc::new(move |context_id| {
        let log = log_for_hook.clone();
        Box::pin(async move {
            log.lock().unwrap().push(format!("stop:{context_id}"));
        })
    }));

    for turn in 0..2 {
        let request = StsRequest {
            context_id: "session-c".to_string(),
            text: Some(format!("turn {turn}")),
            ..Default::default()
        };
        let stream = pipeline.invoke(request).await.unwrap();
        let events: Vec<StsResponse> = stream.map(|r| r.unwrap()).collect().await;
        assert!(matches!(events.first(), Some(StsResponse::Start { .. })));
        assert!(matches!(events.last(), Some(StsResponse::Final { .. })));
    }

    let log = preemption_log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert!(log.iter().all(|entry| entry == "stop:session-c"));
}
