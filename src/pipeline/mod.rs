//! Turn orchestration: STT → LLM stream → TTS fan-out, with caller-installed
//! lifecycle hooks. See SPEC_FULL.md §4.3.

use crate::collaborators::{MetricsSink, StyleInfo, Stt, Tts};
use crate::data::{LlmResponse, PerformanceRecord, StsRequest, StsResponse};
use crate::error::{Error, Result};
use crate::llm::LlmAdapter;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;
use uuid::Uuid;

/// Result of the caller-installed `process_llm_chunk` hook: the only thing
/// it can influence is the TTS language, sticky across subsequent chunks.
#[derive(Debug, Clone, Default)]
pub struct ProcessedChunk {
    /// When set, becomes the language passed to `Tts::synthesize` from this
    /// chunk onward, until overridden again.
    pub language: Option<String>,
}

type OnBeforeLlm = Arc<dyn Fn(String, String, Vec<String>) -> BoxFuture<'static, ()> + Send + Sync>;
type OnBeforeTts = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
type OnFinish = Arc<dyn Fn(StsRequest, StsResponse) -> BoxFuture<'static, ()> + Send + Sync>;
type ProcessLlmChunk = Arc<dyn Fn(LlmResponse) -> BoxFuture<'static, ProcessedChunk> + Send + Sync>;
type StopResponse = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;
type ShouldMute = Arc<dyn Fn() -> bool + Send + Sync>;

fn noop_on_before_llm() -> OnBeforeLlm {
    Arc::new(|_ctx, _text, _files| Box::pin(async {}))
}
fn noop_on_before_tts() -> OnBeforeTts {
    Arc::new(|_ctx| Box::pin(async {}))
}
fn noop_on_finish() -> OnFinish {
    Arc::new(|_req, _resp| Box::pin(async {}))
}
fn identity_process_llm_chunk() -> ProcessLlmChunk {
    Arc::new(|_chunk| Box::pin(async { ProcessedChunk::default() }))
}
fn noop_stop_response() -> StopResponse {
    Arc::new(|_ctx| Box::pin(async {}))
}
fn never_mute() -> ShouldMute {
    Arc::new(|| false)
}

/// Executes one conversational turn end-to-end, emitting an ordered stream
/// of [`StsResponse`] events per SPEC_FULL.md §4.3's turn protocol.
pub struct Pipeline {
    stt: Option<Arc<dyn Stt>>,
    llm_adapter: Arc<LlmAdapter>,
    tts: Option<Arc<dyn Tts>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    on_before_llm: OnBeforeLlm,
    on_before_tts: OnBeforeTts,
    on_finish: OnFinish,
    process_llm_chunk: ProcessLlmChunk,
    stop_response: StopResponse,
    should_mute: ShouldMute,
}

impl Pipeline {
    /// Build an orchestrator around an [`LlmAdapter`]. STT, TTS, and the
    /// metrics sink are optional: omitting them degrades gracefully (a
    /// files-only or text-only turn needs no STT; a turn with no
    /// `voice_text` needs no TTS).
    pub fn new(llm_adapter: LlmAdapter) -> Self {
        Self {
            stt: None,
            llm_adapter: Arc::new(llm_adapter),
            tts: None,
            metrics: None,
            on_before_llm: noop_on_before_llm(),
            on_before_tts: noop_on_before_tts(),
            on_finish: noop_on_finish(),
            process_llm_chunk: identity_process_llm_chunk(),
            stop_response: noop_stop_response(),
            should_mute: never_mute(),
        }
    }

    /// Install the speech-to-text collaborator.
    pub fn with_stt(mut self, stt: Arc<dyn Stt>) -> Self {
        self.stt = Some(stt);
        self
    }

    /// Install the text-to-speech collaborator.
    pub fn with_tts(mut self, tts: Arc<dyn Tts>) -> Self {
        self.tts = Some(tts);
        self
    }

    /// Install the metrics sink performance records are persisted to.
    pub fn with_metrics_sink(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Hook fired after text resolution and preemption, before the LLM
    /// stream opens: `(context_id, text, files)`.
    pub fn with_on_before_llm(mut self, hook: OnBeforeLlm) -> Self {
        self.on_before_llm = hook;
        self
    }

    /// Hook fired exactly once per turn, the first time a chunk carries
    /// non-empty `voice_text`.
    pub fn with_on_before_tts(mut self, hook: OnBeforeTts) -> Self {
        self.on_before_tts = hook;
        self
    }

    /// Hook fired after the performance record is persisted, with the
    /// original request and the `final` response.
    pub fn with_on_finish(mut self, hook: OnFinish) -> Self {
        self.on_finish = hook;
        self
    }

    /// Hook run against every LLM chunk before TTS; its returned language
    /// (when set) is sticky for subsequent chunks.
    pub fn with_process_llm_chunk(mut self, hook: ProcessLlmChunk) -> Self {
        self.process_llm_chunk = hook;
        self
    }

    /// Hook invoked at the start of every turn to preempt any response still
    /// being produced for the same session. The transport adapter is
    /// responsible for actually cancelling downstream playback.
    pub fn with_stop_response(mut self, hook: StopResponse) -> Self {
        self.stop_response = hook;
        self
    }

    /// Predicate mirrored onto this orchestrator's configuration surface;
    /// callers installing a mute gate typically pass the same closure to
    /// [`crate::vad::VoiceActivityDetector::set_mute_predicate`].
    pub fn with_should_mute(mut self, predicate: ShouldMute) -> Self {
        self.should_mute = predicate;
        self
    }

    /// Current value of the installed mute predicate.
    pub fn should_mute(&self) -> bool {
        (self.should_mute)()
    }

    /// Run one turn, returning a stream of `start`/`chunk`/`tool_call`/`final`
    /// events in emission order. Returns `Err(Error::InputEmpty)` immediately,
    /// before any event is emitted, if the request carries nothing to act on.
    pub async fn invoke(
        &self,
        request: StsRequest,
    ) -> Result<impl Stream<Item = Result<StsResponse>>> {
        if request.text.is_none() && request.audio_data.is_none() && request.files.is_empty() {
            return Err(Error::InputEmpty);
        }

        let (tx, rx) = mpsc::channel(32);
        let transaction_id = Uuid::new_v4().to_string();
        let span = tracing::info_span!(
            "turn",
            context_id = %request.context_id,
            transaction_id = %transaction_id,
        );

        let stt = self.stt.clone();
        let tts = self.tts.clone();
        let metrics = self.metrics.clone();
        let llm_adapter = self.llm_adapter.clone();
        let on_before_llm = self.on_before_llm.clone();
        let on_before_tts = self.on_before_tts.clone();
        let on_finish = self.on_finish.clone();
        let process_llm_chunk = self.process_llm_chunk.clone();
        let stop_response = self.stop_response.clone();

        let tx_task = tx.clone();
        tokio::spawn(
            async move {
                let outcome = run_turn(
                    request,
                    transaction_id,
                    stt,
                    llm_adapter,
                    tts,
                    metrics,
                    on_before_llm,
                    on_before_tts,
                    on_finish,
                    process_llm_chunk,
                    stop_response,
                    tx_task.clone(),
                )
                .await;
                if let Err(err) = outcome {
                    let _ = tx_task.send(Err(err)).await;
                }
            }
            .instrument(span),
        );

        Ok(ReceiverStream::new(rx))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_turn(
    request: StsRequest,
    transaction_id: String,
    stt: Option<Arc<dyn Stt>>,
    llm_adapter: Arc<LlmAdapter>,
    tts: Option<Arc<dyn Tts>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    on_before_llm: OnBeforeLlm,
    on_before_tts: OnBeforeTts,
    on_finish: OnFinish,
    process_llm_chunk: ProcessLlmChunk,
    stop_response: StopResponse,
    tx: mpsc::Sender<Result<StsResponse>>,
) -> Result<()> {
    let turn_start = Instant::now();
    let context_id = request.context_id.clone();
    let mut perf = PerformanceRecord {
        transaction_id,
        context_id: context_id.clone(),
        user_id: request.user_id.clone(),
        voice_length: request.audio_duration.unwrap_or(0.0),
        request_files: request.files.clone(),
        ..Default::default()
    };

    let text = match (&request.text, &request.audio_data) {
        (Some(text), _) => text.clone(),
        (None, Some(audio)) => {
            let Some(stt) = stt.as_ref() else {
                return Err(Error::SttUnavailable("no STT collaborator configured".to_string()));
            };
            let t0 = Instant::now();
            let transcribed = stt.transcribe(audio).await;
            perf.stt_time = Some(t0.elapsed().as_secs_f32());
            match transcribed {
                Ok(text) if !text.is_empty() => text,
                Ok(_) => {
                    tracing::debug!("stt returned empty transcription, terminating turn silently");
                    return Ok(());
                }
                Err(err) => {
                    tracing::error!(error = %err, "stt unavailable, terminating turn silently");
                    return Ok(());
                }
            }
        }
        (None, None) => String::new(),
    };
    perf.request_text = text.clone();

    let t0 = Instant::now();
    stop_response(context_id.clone()).await;
    perf.stop_response_time = Some(t0.elapsed().as_secs_f32());

    if tx.send(Ok(StsResponse::Start { session_id: context_id.clone() })).await.is_err() {
        return Ok(());
    }

    on_before_llm(context_id.clone(), text.clone(), request.files.clone()).await;

    let mut llm_stream = llm_adapter.chat_stream(&context_id, &text, request.files.clone(), None).await?;

    let mut first_chunk_recorded = false;
    let mut first_voice_chunk_recorded = false;
    let mut before_tts_fired = false;
    let mut sticky_language: Option<String> = None;
    let mut concat_text = String::new();
    let mut concat_voice_text = String::new();
    let mut tts_first_chunk_recorded = false;
    let mut tts_time_total = 0f32;

    let mut stream_error: Option<Error> = None;
    while let Some(item) = llm_stream.next().await {
        let llm_response = match item {
            Ok(response) => response,
            Err(err) => {
                stream_error = Some(err);
                break;
            }
        };

        if !first_chunk_recorded {
            perf.llm_first_chunk_time = Some(turn_start.elapsed().as_secs_f32());
            first_chunk_recorded = true;
        }

        if let Some(tool_call) = llm_response.tool_call {
            if tx
                .send(Ok(StsResponse::ToolCall { session_id: context_id.clone(), tool_call }))
                .await
                .is_err()
            {
                return Ok(());
            }
            continue;
        }

        let text_part = llm_response.text.unwrap_or_default();
        let voice_text_part = llm_response.voice_text.filter(|v| !v.is_empty());

        if voice_text_part.is_some() {
            if !first_voice_chunk_recorded {
                perf.llm_first_voice_chunk_time = Some(turn_start.elapsed().as_secs_f32());
                first_voice_chunk_recorded = true;
            }
            if !before_tts_fired {
                on_before_tts(context_id.clone()).await;
                before_tts_fired = true;
            }
        }

        let processed = process_llm_chunk(LlmResponse {
            context_id: context_id.clone(),
            text: Some(text_part.clone()),
            voice_text: voice_text_part.clone(),
            tool_call: None,
        })
        .await;
        if processed.language.is_some() {
            sticky_language = processed.language;
        }

        let mut audio_data = Vec::new();
        if let Some(voice_text) = &voice_text_part {
            if let Some(tts) = &tts {
                let t0 = Instant::now();
                match tts
                    .synthesize(
                        voice_text,
                        Some(StyleInfo { styled_text: text_part.clone() }),
                        sticky_language.as_deref(),
                    )
                    .await
                {
                    Ok(bytes) => {
                        if !bytes.is_empty() && !tts_first_chunk_recorded {
                            perf.tts_first_chunk_time = Some(turn_start.elapsed().as_secs_f32());
                            tts_first_chunk_recorded = true;
                        }
                        tts_time_total += t0.elapsed().as_secs_f32();
                        audio_data = bytes;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "tts synthesis failed for this chunk");
                    }
                }
            }
        }

        concat_text.push_str(&text_part);
        concat_voice_text.push_str(voice_text_part.as_deref().unwrap_or(""));

        if tx
            .send(Ok(StsResponse::Chunk {
                session_id: context_id.clone(),
                text: text_part,
                voice_text: voice_text_part.unwrap_or_default(),
                audio_data,
            }))
            .await
            .is_err()
        {
            return Ok(());
        }
    }

    perf.llm_time = Some(turn_start.elapsed().as_secs_f32());
    perf.tts_time = Some(tts_time_total);
    perf.response_text = concat_text.clone();
    perf.response_voice_text = concat_voice_text.clone();
    perf.total_time = turn_start.elapsed().as_secs_f32();

    // SPEC_FULL.md §7: a per-turn failure aborts the turn and emits no
    // `final`, but the performance record is still persisted best-effort
    // with whatever fields were populated before the failure.
    if let Some(err) = stream_error {
        if let Some(metrics) = &metrics {
            if let Err(merr) = metrics.record(perf).await {
                tracing::error!(error = %merr, "failed to persist performance record for aborted turn");
            }
        }
        return Err(err);
    }

    let final_response = StsResponse::Final {
        session_id: context_id.clone(),
        text: concat_text,
        voice_text: concat_voice_text,
    };
    let _ = tx.send(Ok(final_response.clone())).await;

    if let Some(metrics) = &metrics {
        if let Err(err) = metrics.record(perf).await {
            tracing::error!(error = %err, "failed to persist performance record");
        }
    }

    on_finish(request, final_response).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ContextManager, Llm, LlmDelta, ToolSpec};
    use crate::data::LlmMessage;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};
    use tokio::sync::Mutex as AsyncMutex;

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
            let reply = format!("echo: {last_user}. ");
            Ok(Box::pin(stream::iter(vec![Ok(LlmDelta {
                content: Some(reply),
                ..Default::default()
            })])))
        }
    }

    struct InMemoryHistory;

    #[async_trait]
    impl ContextManager for InMemoryHistory {
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

    fn test_pipeline() -> Pipeline {
        let adapter = LlmAdapter::new(Arc::new(EchoLlm), Arc::new(InMemoryHistory));
        Pipeline::new(adapter)
    }

    #[tokio::test]
    async fn empty_request_is_rejected_before_any_event() {
        let pipeline = test_pipeline();
        let request = StsRequest { context_id: "s1".to_string(), ..Default::default() };
        let err = pipeline.invoke(request).await.unwrap_err();
        assert!(matches!(err, Error::InputEmpty));
    }

    #[tokio::test]
    async fn invariant_6_events_obey_start_chunk_star_final() {
        let pipeline = test_pipeline();
        let request = StsRequest {
            context_id: "s1".to_string(),
            text: Some("hello".to_string()),
            ..Default::default()
        };
        let stream = pipeline.invoke(request).await.unwrap();
        let events: Vec<StsResponse> = stream.map(|r| r.unwrap()).collect().await;

        assert!(matches!(events.first(), Some(StsResponse::Start { .. })));
        assert!(matches!(events.last(), Some(StsResponse::Final { .. })));
        for middle in &events[1..events.len() - 1] {
            assert!(matches!(middle, StsResponse::Chunk { .. } | StsResponse::ToolCall { .. }));
        }
    }

    #[tokio::test]
    async fn invariant_7_final_text_equals_sum_of_chunks() {
        let pipeline = test_pipeline();
        let request = StsRequest {
            context_id: "s1".to_string(),
            text: Some("hello".to_string()),
            ..Default::default()
        };
        let stream = pipeline.invoke(request).await.unwrap();
        let events: Vec<StsResponse> = stream.map(|r| r.unwrap()).collect().await;

        let mut concat = String::new();
        for event in &events {
            if let StsResponse::Chunk { text, .. } = event {
                concat.push_str(text);
            }
        }
        match events.last() {
            Some(StsResponse::Final { text, .. }) => assert_eq!(text, &concat),
            _ => panic!("expected a final event"),
        }
    }

    #[tokio::test]
    async fn on_finish_hook_observes_the_final_response() {
        let observed: Arc<AsyncMutex<Option<StsResponse>>> = Arc::new(AsyncMutex::new(None));
        let observed_clone = observed.clone();
        let adapter = LlmAdapter::new(Arc::new(EchoLlm), Arc::new(InMemoryHistory));
        let pipeline = Pipeline::new(adapter).with_on_finish(Arc::new(move |_req, resp| {
            let observed = observed_clone.clone();
            Box::pin(async move {
                *observed.lock().await = Some(resp);
            })
        }));

        let request = StsRequest {
            context_id: "s1".to_string(),
            text: Some("hi".to_string()),
            ..Default::default()
        };
        let stream = pipeline.invoke(request).await.unwrap();
        let _: Vec<_> = stream.collect().await;

        assert!(observed.lock().await.is_some());
    }

    #[tokio::test]
    async fn stt_unavailable_with_audio_and_no_stt_terminates_as_error() {
        let pipeline = test_pipeline();
        let request = StsRequest {
            context_id: "s1".to_string(),
            audio_data: Some(vec![0, 0, 0, 0]),
            ..Default::default()
        };
        let stream = pipeline.invoke(request).await.unwrap();
        let events: Vec<_> = stream.collect().await;
        assert!(events.iter().any(|e| matches!(e, Err(Error::SttUnavailable(_)))));
    }

    #[tokio::test]
    async fn no_stt_no_text_with_files_only_runs_with_empty_text() {
        let pipeline = test_pipeline();
        let request = StsRequest {
            context_id: "s1".to_string(),
            files: vec!["report.pdf".to_string()],
            ..Default::default()
        };
        let stream = pipeline.invoke(request).await.unwrap();
        let events: Vec<StsResponse> = stream.map(|r| r.unwrap()).collect().await;
        assert!(matches!(events.first(), Some(StsResponse::Start { .. })));
    }

    struct FlakyLlm;

    #[async_trait]
    impl Llm for FlakyLlm {
        async fn get_llm_stream_response(
            &self,
            _context_id: &str,
            _messages: Vec<LlmMessage>,
            _tools: Option<Vec<ToolSpec>>,
        ) -> Result<BoxStream<'static, Result<LlmDelta>>> {
            Ok(Box::pin(stream::iter(vec![
                Ok(LlmDelta { content: Some("partial. ".into()), ..Default::default() }),
                Err(Error::LlmStreamError("provider connection dropped".to_string())),
            ])))
        }
    }

    #[derive(Default)]
    struct RecordingMetrics {
        records: AsyncMutex<Vec<PerformanceRecord>>,
    }

    #[async_trait]
    impl MetricsSink for RecordingMetrics {
        async fn record(&self, record: PerformanceRecord) -> Result<()> {
            self.records.lock().await.push(record);
            Ok(())
        }
    }

    #[tokio::test]
    async fn mid_stream_llm_error_persists_metrics_best_effort_and_emits_no_final() {
        let metrics = Arc::new(RecordingMetrics::default());
        let adapter = LlmAdapter::new(Arc::new(FlakyLlm), Arc::new(InMemoryHistory));
        let pipeline = Pipeline::new(adapter).with_metrics_sink(metrics.clone());

        let request = StsRequest {
            context_id: "s1".to_string(),
            text: Some("hello".to_string()),
            ..Default::default()
        };
        let stream = pipeline.invoke(request).await.unwrap();
        let events: Vec<_> = stream.collect().await;

        assert!(!events.iter().any(|e| matches!(e, Ok(StsResponse::Final { .. }))));
        assert!(events.iter().any(|e| matches!(e, Err(Error::LlmStreamError(_)))));

        let records = metrics.records.lock().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].response_text, "partial. ");
    }
}
