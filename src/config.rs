//! Pipeline configuration
//!
//! All knobs are validated before use: `PipelineOrchestrator` construction
//! calls `validate()` and refuses to build with a descriptive error rather
//! than failing mid-session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::vad::VadConfig;
use crate::{Result, TalkbackError};

/// Configuration for the complete pipeline
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Voice activity detector configuration
    pub vad: VadConfig,

    /// Capture sample rate in Hz, fixed for a session
    pub sample_rate: u32,

    /// Quiet period after synthesis before the microphone may reactivate
    pub cooldown: Duration,

    /// Per-call timeout for speech-to-text
    pub stt_timeout: Duration,

    /// Timeout for the complete language generation stream
    pub llm_timeout: Duration,

    /// Per-call timeout for text-to-speech
    pub tts_timeout: Duration,

    /// Overall timeout for one full turn; must cover all per-stage timeouts
    pub pipeline_timeout: Duration,

    /// Language model sampling temperature (0.0-2.0)
    pub llm_temperature: f32,

    /// Maximum tokens generated per response
    pub llm_max_tokens: u32,

    /// Text-to-speech speaking rate, 1.0 is normal (0.0-3.0]
    pub tts_speaking_rate: f32,

    /// Segments shorter than this many samples are discarded as noise
    pub min_segment_samples: usize,

    /// Event channel capacity per subscriber
    pub event_capacity: usize,

    /// Refuse out-of-table state transitions (permissive mode only warns)
    pub strict_transitions: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            sample_rate: 16000,
            cooldown: Duration::from_millis(800),
            stt_timeout: Duration::from_secs(10),
            llm_timeout: Duration::from_secs(30),
            tts_timeout: Duration::from_secs(10),
            pipeline_timeout: Duration::from_secs(60),
            llm_temperature: 0.7,
            llm_max_tokens: 256,
            tts_speaking_rate: 1.0,
            min_segment_samples: 12800,
            event_capacity: 256,
            strict_transitions: true,
        }
    }
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| TalkbackError::InvalidConfiguration(format!("bad JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_vad(mut self, vad: VadConfig) -> Self {
        self.vad = vad;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_stage_timeouts(mut self, stt: Duration, llm: Duration, tts: Duration) -> Self {
        self.stt_timeout = stt;
        self.llm_timeout = llm;
        self.tts_timeout = tts;
        self
    }

    pub fn with_pipeline_timeout(mut self, timeout: Duration) -> Self {
        self.pipeline_timeout = timeout;
        self
    }

    pub fn with_llm_temperature(mut self, temperature: f32) -> Self {
        self.llm_temperature = temperature;
        self
    }

    pub fn with_llm_max_tokens(mut self, max_tokens: u32) -> Self {
        self.llm_max_tokens = max_tokens;
        self
    }

    pub fn with_tts_speaking_rate(mut self, rate: f32) -> Self {
        self.tts_speaking_rate = rate;
        self
    }

    pub fn with_min_segment_samples(mut self, samples: usize) -> Self {
        self.min_segment_samples = samples;
        self
    }

    pub fn permissive_transitions(mut self) -> Self {
        self.strict_transitions = false;
        self
    }

    /// Validate the configuration, failing fast with a descriptive error.
    pub fn validate(&self) -> Result<()> {
        self.vad.validate()?;

        if self.sample_rate == 0 {
            return Err(TalkbackError::InvalidConfiguration(
                "sample rate must be positive".to_string(),
            ));
        }
        if self.stt_timeout.is_zero() || self.llm_timeout.is_zero() || self.tts_timeout.is_zero() {
            return Err(TalkbackError::InvalidConfiguration(
                "per-stage timeouts must be positive".to_string(),
            ));
        }
        let stage_sum = self.stt_timeout + self.llm_timeout + self.tts_timeout;
        if self.pipeline_timeout < stage_sum {
            return Err(TalkbackError::InvalidConfiguration(format!(
                "pipeline timeout {:?} is below the sum of per-stage timeouts {:?}",
                self.pipeline_timeout, stage_sum
            )));
        }
        if !(0.0..=2.0).contains(&self.llm_temperature) {
            return Err(TalkbackError::InvalidConfiguration(format!(
                "LLM temperature must be in [0, 2], got {}",
                self.llm_temperature
            )));
        }
        if self.llm_max_tokens == 0 {
            return Err(TalkbackError::InvalidConfiguration(
                "LLM max tokens must be positive".to_string(),
            ));
        }
        if !(self.tts_speaking_rate > 0.0 && self.tts_speaking_rate <= 3.0) {
            return Err(TalkbackError::InvalidConfiguration(format!(
                "TTS speaking rate must be in (0, 3], got {}",
                self.tts_speaking_rate
            )));
        }
        if self.min_segment_samples == 0 {
            return Err(TalkbackError::InvalidConfiguration(
                "minimum segment length must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(TalkbackError::InvalidConfiguration(
                "event channel capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
