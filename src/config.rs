//! Typed configuration for the VAD, segmenter, and pipeline, loadable from a
//! TOML document or built up directly by the caller.

use crate::error::{Error, Result};
use crate::llm::segmenter::SegmenterConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};

/// Tunables for the pipeline orchestrator itself (as opposed to its
/// component subsystems).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// How many most-recent history entries to request from the context manager.
    pub history_limit: usize,
    /// Entries older than this (seconds) are excluded when rehydrating context.
    pub context_timeout_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            history_limit: 100,
            context_timeout_seconds: 3600,
        }
    }
}

/// Aggregate, file-loadable configuration for the whole crate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Voice activity detector tunables.
    pub vad: VadConfig,
    /// Sentence segmenter tunables.
    pub segmenter: SegmenterConfig,
    /// Orchestrator tunables.
    pub pipeline: PipelineConfig,
}

impl Config {
    /// Parse a TOML document into a `Config`, then validate it.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file into a `Config`.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Reject nonsensical combinations before they reach a running pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.vad.min_duration > self.vad.max_duration {
            return Err(Error::InvalidConfig(format!(
                "vad.min_duration ({}) must not exceed vad.max_duration ({})",
                self.vad.min_duration, self.vad.max_duration
            )));
        }
        if self.vad.sample_rate == 0 {
            return Err(Error::InvalidConfig("vad.sample_rate must be nonzero".into()));
        }
        if self.vad.channels == 0 {
            return Err(Error::InvalidConfig("vad.channels must be nonzero".into()));
        }
        if self.segmenter.option_split_threshold == 0 {
            return Err(Error::InvalidConfig(
                "segmenter.option_split_threshold must be nonzero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn empty_toml_document_uses_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.vad.sample_rate, 16_000);
        assert_eq!(config.pipeline.history_limit, 100);
    }

    #[test]
    fn partial_override_keeps_remaining_defaults() {
        let toml = r#"
            [vad]
            volume_db_threshold = -30.0
        "#;
        let config = Config::from_toml_str(toml).unwrap();
        assert_eq!(config.vad.volume_db_threshold, -30.0);
        assert_eq!(config.vad.min_duration, 0.2);
    }

    #[test]
    fn min_duration_above_max_is_rejected() {
        let toml = r#"
            [vad]
            min_duration = 5.0
            max_duration = 1.0
        "#;
        let err = Config::from_toml_str(toml).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
