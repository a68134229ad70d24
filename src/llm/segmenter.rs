//! Sentence-boundary segmentation and voice-tag filtering.
//!
//! The original adapter this lineage descends from marks cut points by
//! inserting a `|` sentinel into the running buffer and splitting on it.
//! This implementation tracks the same cut points as explicit byte offsets
//! instead, so the buffer never needs a placeholder character spliced into
//! model output (see SPEC_FULL.md §9).

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Tunables for sentence segmentation and voice-tag filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Hard sentence terminators. Every occurrence is a cut point.
    pub split_chars: Vec<String>,
    /// Soft terminators. Only the last occurrence in an over-threshold
    /// buffer becomes a cut point.
    pub option_split_chars: Vec<String>,
    /// Buffer length (characters) above which `option_split_chars` applies.
    pub option_split_threshold: usize,
    /// When set, voice_text is derived from the content of `<TAG>...</TAG>`
    /// instead of the whole segment with control tags stripped.
    pub voice_text_tag: Option<String>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            split_chars: ["。", "？", "！", ". ", "?", "!"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            option_split_chars: ["、", ", "].iter().map(|s| s.to_string()).collect(),
            option_split_threshold: 50,
            voice_text_tag: None,
        }
    }
}

/// One completed segment of model output: display text plus the speech-
/// intended subset, when present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Raw segment text, suitable for display.
    pub text: String,
    /// Speech-intended subset of `text`, after tag filtering.
    pub voice_text: Option<String>,
}

fn remove_control_tags(s: &str) -> String {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| regex::Regex::new(r"\[[A-Za-z0-9_]+:[^\]]*\]").unwrap());
    re.replace_all(s, "").into_owned()
}

fn find_all(buffer: &str, pattern: &str) -> Vec<usize> {
    if pattern.is_empty() {
        return Vec::new();
    }
    let mut hits = Vec::new();
    let mut start = 0;
    while let Some(pos) = buffer[start..].find(pattern) {
        let end = start + pos + pattern.len();
        hits.push(end);
        start = end;
    }
    hits
}

/// Cut points (byte offsets, each immediately after a terminator) currently
/// present in `buffer`, per the hard/soft rules in SPEC_FULL.md §4.2.
fn cut_points(buffer: &str, config: &SegmenterConfig) -> Vec<usize> {
    let mut cuts: Vec<usize> = config
        .split_chars
        .iter()
        .flat_map(|pat| find_all(buffer, pat))
        .collect();
    cuts.sort_unstable();
    cuts.dedup();

    if buffer.chars().count() > config.option_split_threshold {
        let last_soft = config
            .option_split_chars
            .iter()
            .flat_map(|pat| find_all(buffer, pat))
            .max();
        if let Some(cut) = last_soft {
            if !cuts.contains(&cut) {
                cuts.push(cut);
                cuts.sort_unstable();
            }
        }
    }
    cuts
}

/// Stateful, per-turn segmenter. Created once per `chat_stream` call.
pub struct Segmenter {
    config: SegmenterConfig,
    buffer: String,
    in_voice_tag: bool,
}

impl Segmenter {
    /// Build a segmenter for one turn.
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            buffer: String::new(),
            in_voice_tag: false,
        }
    }

    /// Append a provider content delta, returning every sentence boundary it
    /// completes. Incomplete trailing text is retained for the next call.
    pub fn push_delta(&mut self, delta: &str) -> Vec<Segment> {
        self.buffer.push_str(delta);
        let mut out = Vec::new();
        loop {
            let cuts = cut_points(&self.buffer, &self.config);
            let Some(&cut) = cuts.first() else { break };
            if cut == 0 || cut > self.buffer.len() {
                break;
            }
            let segment_text = self.buffer[..cut].to_string();
            self.buffer.replace_range(..cut, "");
            let voice_text = self.derive_voice_text(&segment_text);
            out.push(Segment { text: segment_text, voice_text });
        }
        out
    }

    /// Flush any trailing residue as a final segment once the upstream
    /// stream has closed. Idempotent: returns `None` once drained.
    pub fn flush(&mut self) -> Option<Segment> {
        if self.buffer.is_empty() {
            return None;
        }
        let segment_text = std::mem::take(&mut self.buffer);
        let voice_text = self.derive_voice_text(&segment_text);
        Some(Segment { text: segment_text, voice_text })
    }

    fn derive_voice_text(&mut self, segment: &str) -> Option<String> {
        let raw = match &self.config.voice_text_tag {
            None => Some(segment.to_string()),
            Some(tag) => {
                let open = format!("<{tag}>");
                let close = format!("</{tag}>");
                let has_open = segment.contains(&open);
                let has_close = segment.contains(&close);

                if has_open && has_close {
                    let start = segment.find(&open).unwrap() + open.len();
                    let end = segment.find(&close).unwrap();
                    self.in_voice_tag = false;
                    if end > start {
                        Some(segment[start..end].to_string())
                    } else {
                        Some(String::new())
                    }
                } else if has_open {
                    let start = segment.find(&open).unwrap() + open.len();
                    self.in_voice_tag = true;
                    Some(segment[start..].to_string())
                } else if has_close && self.in_voice_tag {
                    let end = segment.find(&close).unwrap();
                    self.in_voice_tag = false;
                    Some(segment[..end].to_string())
                } else if self.in_voice_tag {
                    Some(segment.to_string())
                } else {
                    None
                }
            }
        };
        raw.map(|s| remove_control_tags(&s))
    }
}
