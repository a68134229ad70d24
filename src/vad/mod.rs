//! Per-session voice activity detection.
//!
//! Segments a continuous stream of 16-bit little-endian PCM samples into
//! discrete utterances using an amplitude gate with pre-roll, silence
//! hang-over, and a maximum-duration guard. See SPEC_FULL.md §4.1.

use crate::data::{SessionData, Utterance};
use crate::error::{Error, Result};
use futures::future::BoxFuture;
use futures::Stream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;

/// Tunables for the voice activity detector. See SPEC_FULL.md §4.1 for defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Amplitude gate expressed in dBFS. Converted to a linear threshold via
    /// `T = 32767 * 10^(db/20)`.
    pub volume_db_threshold: f32,
    /// Trailing silence (seconds) needed to close a segment.
    pub silence_duration_threshold: f32,
    /// Segments shorter than this (seconds) are discarded without emission.
    pub min_duration: f32,
    /// Segments growing beyond this (seconds) are aborted without emission.
    pub max_duration: f32,
    /// Input sample rate in Hz.
    pub sample_rate: u32,
    /// Input channel count.
    pub channels: u32,
    /// Number of most-recent input chunks prepended to a new recording.
    pub preroll_buffer_count: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            volume_db_threshold: -40.0,
            silence_duration_threshold: 0.5,
            min_duration: 0.2,
            max_duration: 10.0,
            sample_rate: 16_000,
            channels: 1,
            preroll_buffer_count: 5,
        }
    }
}

/// Convert a dBFS amplitude gate into the linear 16-bit threshold it represents.
pub fn linear_threshold(volume_db_threshold: f32) -> f32 {
    32767.0 * 10f32.powf(volume_db_threshold / 20.0)
}

fn max_abs_amplitude(pcm16le: &[u8]) -> i32 {
    pcm16le
        .chunks_exact(2)
        .map(|s| (i16::from_le_bytes([s[0], s[1]]) as i32).abs())
        .max()
        .unwrap_or(0)
}

fn push_preroll(preroll: &mut VecDeque<Vec<u8>>, chunk: Vec<u8>, capacity: usize) {
    preroll.push_back(chunk);
    while preroll.len() > capacity {
        preroll.pop_front();
    }
}

/// Per-session recording state. Not `Clone`: owned exclusively by the
/// per-session `Mutex` in the detector's session map.
#[derive(Default)]
struct SessionState {
    is_recording: bool,
    buffer: Vec<u8>,
    record_duration: f32,
    silence_duration: f32,
    preroll: VecDeque<Vec<u8>>,
    mute_predicate: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    data: SessionData,
}

impl SessionState {
    fn reset_recording(&mut self) {
        self.is_recording = false;
        self.buffer.clear();
        self.record_duration = 0.0;
        self.silence_duration = 0.0;
    }

    fn reset_full(&mut self) {
        self.reset_recording();
        self.preroll.clear();
    }
}

/// A handler invoked fire-and-forget whenever a segment closes with enough
/// speaking duration to be emitted. The VAD never awaits this; failures are
/// logged and otherwise ignored.
pub type EmitHandler = Arc<dyn Fn(Utterance) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// An optional per-chunk transform applied before amplitude measurement and
/// buffering (e.g. resampling or format conversion into linear16).
pub type LinearTransform = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

fn default_emit_handler() -> EmitHandler {
    Arc::new(|utterance: Utterance| {
        Box::pin(async move {
            tracing::trace!(
                session_id = %utterance.session_id,
                duration = utterance.duration_seconds,
                "utterance emitted with no handler installed"
            );
            Ok(())
        })
    })
}

/// Streaming voice activity detector and session registry.
///
/// Owns one [`SessionState`] per `session_id`, created lazily on first use.
/// Different sessions are processed fully independently; within a session,
/// all mutation is serialized behind that session's lock (see SPEC_FULL.md §5).
pub struct VoiceActivityDetector {
    config: RwLock<VadConfig>,
    threshold_linear: AtomicU32,
    sessions: dashmap::DashMap<String, Arc<Mutex<SessionState>>>,
    to_linear16: Option<LinearTransform>,
    emit_handler: EmitHandler,
}

impl VoiceActivityDetector {
    /// Build a detector from the given configuration.
    pub fn new(config: VadConfig) -> Self {
        let threshold = linear_threshold(config.volume_db_threshold);
        Self {
            config: RwLock::new(config),
            threshold_linear: AtomicU32::new(threshold.to_bits()),
            sessions: dashmap::DashMap::new(),
            to_linear16: None,
            emit_handler: default_emit_handler(),
        }
    }

    /// Install the handler invoked when a segment is emitted.
    pub fn with_emit_handler(mut self, handler: EmitHandler) -> Self {
        self.emit_handler = handler;
        self
    }

    /// Install a transform applied to each chunk before measurement/buffering.
    pub fn with_to_linear16(mut self, transform: LinearTransform) -> Self {
        self.to_linear16 = Some(transform);
        self
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> VadConfig {
        self.config.read().expect("VAD config lock poisoned").clone()
    }

    /// Update `volume_db_threshold`, recomputing the linear amplitude
    /// threshold atomically (invariant 8 in SPEC_FULL.md §8).
    pub fn set_volume_db_threshold(&self, db: f32) {
        let mut cfg = self.config.write().expect("VAD config lock poisoned");
        cfg.volume_db_threshold = db;
        self.threshold_linear
            .store(linear_threshold(db).to_bits(), Ordering::Release);
    }

    /// The linear amplitude threshold currently in effect.
    pub fn amplitude_threshold(&self) -> f32 {
        f32::from_bits(self.threshold_linear.load(Ordering::Acquire))
    }

    fn session_handle(&self, session_id: &str) -> Arc<Mutex<SessionState>> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(SessionState::default())))
            .clone()
    }

    /// Install (or clear) the mute predicate for a session. While it returns
    /// true, `process_samples` drops every chunk and resets the session,
    /// including its pre-roll ring.
    pub async fn set_mute_predicate(
        &self,
        session_id: &str,
        predicate: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
    ) {
        let handle = self.session_handle(session_id);
        let mut state = handle.lock().await;
        state.mute_predicate = predicate;
    }

    /// Clear buffered recording state for a session but keep the entry (and
    /// its mute predicate) around.
    pub async fn reset_session(&self, session_id: &str) {
        if let Some(handle) = self.sessions.get(session_id) {
            let mut state = handle.lock().await;
            state.reset_full();
        }
    }

    /// Merge `entries` into the session's opaque per-session key/value data,
    /// creating the session if it does not already exist.
    pub async fn set_session_data(&self, session_id: &str, entries: SessionData) {
        let handle = self.session_handle(session_id);
        let mut state = handle.lock().await;
        state.data.extend(entries);
    }

    /// Snapshot of the session's opaque per-session key/value data. Empty for
    /// an unknown session.
    pub async fn session_data(&self, session_id: &str) -> SessionData {
        match self.sessions.get(session_id) {
            Some(handle) => handle.lock().await.data.clone(),
            None => SessionData::default(),
        }
    }

    /// Idempotent teardown: any partial recording is discarded, never emitted.
    pub fn finalize_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Idempotent teardown, identical to `finalize_session`.
    pub fn delete_session(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    /// Current pre-roll ring length for a session. Exposed mainly for tests
    /// asserting invariant 1 (SPEC_FULL.md §8).
    pub async fn preroll_len(&self, session_id: &str) -> usize {
        match self.sessions.get(session_id) {
            Some(handle) => handle.lock().await.preroll.len(),
            None => 0,
        }
    }

    /// Whether the session is currently mid-recording.
    pub async fn is_recording(&self, session_id: &str) -> bool {
        match self.sessions.get(session_id) {
            Some(handle) => handle.lock().await.is_recording,
            None => false,
        }
    }

    fn spawn_emit(&self, utterance: Utterance) {
        let handler = self.emit_handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handler(utterance).await {
                tracing::error!(error = %err, "VAD emission handler failed");
            }
        });
    }

    /// Process one chunk of 16-bit little-endian PCM for `session_id`.
    ///
    /// Suspends only to spawn the emission handler (fire-and-forget); it
    /// never awaits the handler's completion.
    pub async fn process_samples(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        if bytes.len() % 2 != 0 {
            return Err(Error::VadInputError(format!(
                "odd-length PCM16 chunk ({} bytes) for session '{session_id}'",
                bytes.len()
            )));
        }

        let handle = self.session_handle(session_id);
        let mut state = handle.lock().await;

        let muted = state.mute_predicate.as_ref().map(|p| p()).unwrap_or(false);
        if muted {
            state.reset_full();
            return Ok(());
        }

        let cfg = self.config();
        let transformed = match &self.to_linear16 {
            Some(f) => f(bytes),
            None => bytes.to_vec(),
        };

        if transformed.is_empty() {
            return Ok(());
        }

        let chunk_duration =
            transformed.len() as f32 / 2.0 / (cfg.sample_rate as f32 * cfg.channels as f32);
        let max_amp = max_abs_amplitude(&transformed) as f32;
        let is_loud = max_amp > self.amplitude_threshold();

        if !state.is_recording {
            if is_loud {
                state.is_recording = true;
                state.buffer.clear();
                for prerolled in &state.preroll {
                    state.buffer.extend_from_slice(prerolled);
                }
                state.buffer.extend_from_slice(&transformed);
                state.record_duration = chunk_duration;
                state.silence_duration = 0.0;
            }
            push_preroll(&mut state.preroll, transformed, cfg.preroll_buffer_count);
            return Ok(());
        }

        state.buffer.extend_from_slice(&transformed);
        state.record_duration += chunk_duration;
        if is_loud {
            state.silence_duration = 0.0;
        } else {
            state.silence_duration += chunk_duration;
        }
        push_preroll(&mut state.preroll, transformed, cfg.preroll_buffer_count);

        if state.silence_duration >= cfg.silence_duration_threshold {
            let duration = state.record_duration - state.silence_duration;
            let bytes_out = std::mem::take(&mut state.buffer);
            state.reset_recording();
            if duration >= cfg.min_duration {
                self.spawn_emit(Utterance {
                    bytes: bytes_out,
                    duration_seconds: duration,
                    session_id: session_id.to_string(),
                });
            }
        } else if state.record_duration >= cfg.max_duration {
            state.reset_recording();
        }

        Ok(())
    }

    /// Drive `process_samples` over an async stream of chunks until it is
    /// exhausted or an empty chunk is observed, then delete the session.
    pub async fn process_stream<S>(&self, session_id: &str, mut stream: S) -> Result<()>
    where
        S: Stream<Item = Vec<u8>> + Unpin,
    {
        while let Some(chunk) = stream.next().await {
            if chunk.is_empty() {
                break;
            }
            self.process_samples(session_id, &chunk).await?;
        }
        self.delete_session(session_id);
        Ok(())
    }
}
