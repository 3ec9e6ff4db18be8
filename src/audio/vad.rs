//! Adaptive energy-based voice activity detection
//!
//! Classifies incoming audio chunks as speech or silence by comparing RMS
//! energy against an adaptive threshold. Hysteresis counters reject
//! single-frame noise spikes, ambient calibration derives the threshold from
//! measured background noise, and a suppression mode raises the bar while the
//! assistant's own synthesized speech is playing.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::audio::chunk::AudioChunk;
use crate::{Result, TalkbackError};

/// Speech boundary signal produced for a processed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechActivity {
    /// No boundary crossed by this chunk
    None,
    /// Speech has started
    Started,
    /// Speech has ended
    Ended,
}

/// Configuration for the voice activity detector
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VadConfig {
    /// Initial energy threshold, also used until calibration completes (0.0-1.0)
    pub energy_threshold: f32,

    /// Multiplier applied to the measured ambient noise level
    pub threshold_multiplier: f32,

    /// Lowest threshold calibration may produce
    pub absolute_floor: f32,

    /// Highest threshold calibration may produce
    pub threshold_cap: f32,

    /// Number of frames collected before the threshold is derived
    pub calibration_frames: usize,

    /// Consecutive voiced frames required to declare speech start
    pub voice_start_frames: usize,

    /// Consecutive silent frames required to declare speech end
    pub voice_end_frames: usize,

    /// Speech-start hysteresis while suppression is active
    pub suppressed_start_frames: usize,

    /// Speech-end hysteresis while suppression is active
    pub suppressed_end_frames: usize,

    /// Threshold scaling applied while synthesis is playing (1.0-10.0)
    pub suppression_factor: f32,

    /// Recent-energy history retained for observation
    pub energy_history_frames: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: 0.01,
            threshold_multiplier: 2.5,
            absolute_floor: 0.01,
            threshold_cap: 0.35,
            calibration_frames: 20,
            voice_start_frames: 1,
            voice_end_frames: 8,
            suppressed_start_frames: 10,
            suppressed_end_frames: 5,
            suppression_factor: 3.0,
            energy_history_frames: 32,
        }
    }
}

impl VadConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.energy_threshold) {
            return Err(TalkbackError::InvalidConfiguration(format!(
                "VAD energy threshold must be in [0, 1], got {}",
                self.energy_threshold
            )));
        }
        if self.threshold_multiplier <= 0.0 {
            return Err(TalkbackError::InvalidConfiguration(format!(
                "VAD threshold multiplier must be positive, got {}",
                self.threshold_multiplier
            )));
        }
        if self.absolute_floor < 0.0 || self.threshold_cap <= 0.0 {
            return Err(TalkbackError::InvalidConfiguration(
                "VAD threshold floor must be >= 0 and cap > 0".to_string(),
            ));
        }
        if self.absolute_floor > self.threshold_cap {
            return Err(TalkbackError::InvalidConfiguration(format!(
                "VAD threshold floor {} exceeds cap {}",
                self.absolute_floor, self.threshold_cap
            )));
        }
        if self.calibration_frames == 0 {
            return Err(TalkbackError::InvalidConfiguration(
                "VAD calibration requires at least one frame".to_string(),
            ));
        }
        if self.voice_start_frames == 0
            || self.voice_end_frames == 0
            || self.suppressed_start_frames == 0
            || self.suppressed_end_frames == 0
        {
            return Err(TalkbackError::InvalidConfiguration(
                "VAD hysteresis frame counts must be positive".to_string(),
            ));
        }
        if !(1.0..=10.0).contains(&self.suppression_factor) {
            return Err(TalkbackError::InvalidConfiguration(format!(
                "VAD suppression factor must be in [1, 10], got {}",
                self.suppression_factor
            )));
        }
        Ok(())
    }
}

/// Adaptive energy voice activity detector.
///
/// All state is owned here and mutated only through `process`,
/// `begin_suppression`, `end_suppression`, and `reset`.
pub struct VoiceActivityDetector {
    config: VadConfig,
    energy_threshold: f32,
    nominal_threshold: f32,
    ambient_noise_level: f32,
    consecutive_voice_frames: usize,
    consecutive_silent_frames: usize,
    is_speaking: bool,
    is_calibrating: bool,
    calibration_samples: Vec<f32>,
    energy_history: VecDeque<f32>,
    suppression_active: bool,
}

impl VoiceActivityDetector {
    pub fn new(config: VadConfig) -> Self {
        let threshold = config.energy_threshold;
        Self {
            energy_history: VecDeque::with_capacity(config.energy_history_frames),
            calibration_samples: Vec::with_capacity(config.calibration_frames),
            config,
            energy_threshold: threshold,
            nominal_threshold: threshold,
            ambient_noise_level: 0.0,
            consecutive_voice_frames: 0,
            consecutive_silent_frames: 0,
            is_speaking: false,
            is_calibrating: true,
            suppression_active: false,
        }
    }

    /// Classify one chunk, updating detector state.
    ///
    /// Zero-length chunks are ignored. During calibration no activity
    /// signals are emitted; calibration completes on frame count alone.
    pub fn process(&mut self, chunk: &AudioChunk) -> SpeechActivity {
        if chunk.is_empty() {
            return SpeechActivity::None;
        }

        let energy = chunk.rms();

        if self.is_calibrating {
            self.calibration_samples.push(energy);
            if self.calibration_samples.len() >= self.config.calibration_frames {
                self.finish_calibration();
            }
            return SpeechActivity::None;
        }

        if self.energy_history.len() >= self.config.energy_history_frames {
            self.energy_history.pop_front();
        }
        self.energy_history.push_back(energy);

        let (start_frames, end_frames) = if self.suppression_active {
            (
                self.config.suppressed_start_frames,
                self.config.suppressed_end_frames,
            )
        } else {
            (self.config.voice_start_frames, self.config.voice_end_frames)
        };

        if energy > self.energy_threshold {
            self.consecutive_voice_frames += 1;
            self.consecutive_silent_frames = 0;

            if !self.is_speaking && self.consecutive_voice_frames >= start_frames {
                self.is_speaking = true;
                debug!(
                    energy,
                    threshold = self.energy_threshold,
                    seq = chunk.sequence_number,
                    "speech started"
                );
                return SpeechActivity::Started;
            }
        } else {
            self.consecutive_silent_frames += 1;
            self.consecutive_voice_frames = 0;

            if self.is_speaking && self.consecutive_silent_frames >= end_frames {
                self.is_speaking = false;
                debug!(seq = chunk.sequence_number, "speech ended");
                return SpeechActivity::Ended;
            }
        }

        SpeechActivity::None
    }

    fn finish_calibration(&mut self) {
        let mut energies = std::mem::take(&mut self.calibration_samples);
        energies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        // 90th percentile (nearest rank) is robust to rare spikes
        self.ambient_noise_level = percentile(&energies, 0.9);
        self.nominal_threshold = (self.ambient_noise_level * self.config.threshold_multiplier)
            .max(self.config.absolute_floor)
            .min(self.config.threshold_cap);
        self.energy_threshold = if self.suppression_active {
            suppressed_threshold(self.nominal_threshold, self.config.suppression_factor)
        } else {
            self.nominal_threshold
        };
        self.is_calibrating = false;

        info!(
            ambient = self.ambient_noise_level,
            threshold = self.nominal_threshold,
            "ambient calibration complete"
        );
    }

    /// Enter feedback suppression: synthesis is about to play.
    ///
    /// Raises the threshold, switches to strict hysteresis, and force-closes
    /// any in-progress speech. Returns `Ended` if speech was open, so the
    /// caller can finalize the segment. Idempotent.
    pub fn begin_suppression(&mut self) -> SpeechActivity {
        if self.suppression_active {
            return SpeechActivity::None;
        }
        self.suppression_active = true;
        self.energy_threshold =
            suppressed_threshold(self.nominal_threshold, self.config.suppression_factor);
        self.consecutive_voice_frames = 0;
        self.consecutive_silent_frames = 0;

        if self.is_speaking {
            self.is_speaking = false;
            debug!("suppression began mid-speech, forcing speech end");
            return SpeechActivity::Ended;
        }
        SpeechActivity::None
    }

    /// Leave feedback suppression: synthesis has finished.
    ///
    /// Restores the nominal threshold and hysteresis, and clears the
    /// recent-energy history so stale synthesis-era readings cannot cause
    /// false triggers. Idempotent.
    pub fn end_suppression(&mut self) {
        if !self.suppression_active {
            return;
        }
        self.suppression_active = false;
        self.energy_threshold = self.nominal_threshold;
        self.consecutive_voice_frames = 0;
        self.consecutive_silent_frames = 0;
        self.energy_history.clear();
    }

    /// Reset to a freshly calibrating detector.
    pub fn reset(&mut self) {
        self.energy_threshold = self.config.energy_threshold;
        self.nominal_threshold = self.config.energy_threshold;
        self.ambient_noise_level = 0.0;
        self.consecutive_voice_frames = 0;
        self.consecutive_silent_frames = 0;
        self.is_speaking = false;
        self.is_calibrating = true;
        self.calibration_samples.clear();
        self.energy_history.clear();
        self.suppression_active = false;
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn is_calibrating(&self) -> bool {
        self.is_calibrating
    }

    pub fn suppression_active(&self) -> bool {
        self.suppression_active
    }

    pub fn energy_threshold(&self) -> f32 {
        self.energy_threshold
    }

    pub fn ambient_noise_level(&self) -> f32 {
        self.ambient_noise_level
    }

    pub fn recent_energy_frames(&self) -> usize {
        self.energy_history.len()
    }
}

fn suppressed_threshold(nominal: f32, factor: f32) -> f32 {
    (nominal * factor).min(1.0)
}

/// Nearest-rank percentile of an ascending-sorted slice.
fn percentile(sorted: &[f32], pct: f32) -> f32 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = ((pct * sorted.len() as f32).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
