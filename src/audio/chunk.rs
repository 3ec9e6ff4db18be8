//! Audio chunk and speech segment types
//!
//! An `AudioChunk` is one fixed-format block of capture audio; a
//! `SpeechSegment` is the buffer accumulated between a detected
//! speech-start and speech-end boundary.

/// One block of captured audio samples.
///
/// Chunks are produced by the audio source and consumed exactly once by the
/// pipeline; ownership transfers chunk-by-chunk. `sequence_number` strictly
/// increases for the lifetime of one capture session, and `sample_rate` is
/// fixed for the session.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono f32 samples in [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Capture timestamp in seconds since session start
    pub timestamp: f64,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count (mono capture uses 1)
    pub channels: u16,
    /// Monotonically increasing per-session sequence number
    pub sequence_number: u64,
    /// Set on the last chunk of a session
    pub is_final: bool,
}

impl AudioChunk {
    pub fn new(samples: Vec<f32>, timestamp: f64, sample_rate: u32, sequence_number: u64) -> Self {
        Self {
            samples,
            timestamp,
            sample_rate,
            channels: 1,
            sequence_number,
            is_final: false,
        }
    }

    /// Mark this chunk as the last of the session
    pub fn finalized(mut self) -> Self {
        self.is_final = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / (self.sample_rate as f32 * self.channels.max(1) as f32)
    }

    /// Root-mean-square energy of the chunk's samples.
    ///
    /// Returns 0.0 for an empty chunk.
    pub fn rms(&self) -> f32 {
        rms(&self.samples)
    }
}

/// Root-mean-square energy of a sample slice.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_sq / samples.len() as f64).sqrt() as f32
}

/// Sample buffer accumulated for one utterance.
///
/// Owned by the orchestrator between a speech-start and speech-end boundary,
/// handed to speech-to-text once, then discarded.
#[derive(Debug, Default)]
pub struct SpeechSegment {
    samples: Vec<f32>,
    sample_rate: u32,
    started_at: f64,
}

impl SpeechSegment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new segment from the chunk that triggered speech detection.
    pub fn begin(&mut self, chunk: &AudioChunk) {
        self.samples.clear();
        self.samples.extend_from_slice(&chunk.samples);
        self.sample_rate = chunk.sample_rate;
        self.started_at = chunk.timestamp;
    }

    /// Append a chunk while speech is in progress.
    pub fn extend(&mut self, chunk: &AudioChunk) {
        self.samples.extend_from_slice(&chunk.samples);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.sample_rate = 0;
        self.started_at = 0.0;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn started_at(&self) -> f64 {
        self.started_at
    }

    pub fn duration_secs(&self) -> f32 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// Take the buffered samples, leaving the segment empty.
    pub fn take_samples(&mut self) -> Vec<f32> {
        self.started_at = 0.0;
        std::mem::take(&mut self.samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_duration() {
        let chunk = AudioChunk::new(vec![0.0; 1600], 0.0, 16000, 0);
        assert!((chunk.duration_secs() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_rms_of_constant_signal() {
        // RMS of a constant signal of amplitude A is A itself
        let chunk = AudioChunk::new(vec![0.5; 1600], 0.0, 16000, 0);
        assert!((chunk.rms() - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_rms_of_empty_chunk_is_zero() {
        let chunk = AudioChunk::new(vec![], 0.0, 16000, 0);
        assert_eq!(chunk.rms(), 0.0);
    }

    #[test]
    fn test_rms_of_sine_wave() {
        // RMS of a full-cycle sine of amplitude A is A / sqrt(2)
        let samples: Vec<f32> = (0..16000)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 16000.0).sin())
            .collect();
        let value = rms(&samples);
        assert!((value - 0.3 / 2.0_f32.sqrt()).abs() < 1e-3);
    }

    #[test]
    fn test_segment_accumulation() {
        let mut segment = SpeechSegment::new();
        let first = AudioChunk::new(vec![0.1; 1600], 2.0, 16000, 20);
        let second = AudioChunk::new(vec![0.2; 1600], 2.1, 16000, 21);

        segment.begin(&first);
        segment.extend(&second);

        assert_eq!(segment.len(), 3200);
        assert_eq!(segment.sample_rate(), 16000);
        assert!((segment.started_at() - 2.0).abs() < 1e-9);
        assert!((segment.duration_secs() - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_segment_begin_discards_previous() {
        let mut segment = SpeechSegment::new();
        segment.begin(&AudioChunk::new(vec![0.1; 100], 0.0, 16000, 0));
        segment.begin(&AudioChunk::new(vec![0.2; 50], 1.0, 16000, 10));
        assert_eq!(segment.len(), 50);
    }

    #[test]
    fn test_take_samples_empties_segment() {
        let mut segment = SpeechSegment::new();
        segment.begin(&AudioChunk::new(vec![0.1; 100], 0.0, 16000, 0));

        let samples = segment.take_samples();
        assert_eq!(samples.len(), 100);
        assert!(segment.is_empty());
    }
}
