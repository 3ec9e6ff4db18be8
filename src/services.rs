//! External service contracts: speech-to-text, language model, text-to-speech
//!
//! The engines behind these traits are black boxes; the pipeline depends only
//! on the request/response and token-stream shapes here. Adapters own retry
//! policy; the orchestrator never retries a failed call.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;

use crate::Result;

/// Boxed stream of generated response tokens.
pub type TokenStream<'a> = BoxStream<'a, Result<String>>;

/// A component the orchestrator initializes at startup.
#[async_trait]
pub trait PipelineComponent: Send + Sync {
    /// Component name used in initialization events and logs
    fn name(&self) -> &str;

    /// One-time startup work (model load, warmup). Called once, before any
    /// other method.
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }
}

/// Result of transcribing one speech segment.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    pub confidence: f32,
}

impl Transcription {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }

    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Speech-to-text service, called once per completed speech segment.
#[async_trait]
pub trait SpeechToText: PipelineComponent {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> Result<Transcription>;
}

/// One language generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            temperature: 0.7,
            max_tokens: 256,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }
}

/// Language model service with streaming token generation.
#[async_trait]
pub trait LanguageModel: PipelineComponent {
    /// Stream response tokens for the request.
    fn stream_generate<'a>(&'a self, request: &GenerationRequest) -> TokenStream<'a>;

    /// Generate the full response text. The default collects the token
    /// stream; adapters with a cheaper non-streaming path may override.
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut stream = self.stream_generate(request);
        let mut response = String::new();
        while let Some(token) = stream.next().await {
            response.push_str(&token?);
        }
        Ok(response)
    }
}

/// Outcome of one synthesis call.
#[derive(Debug, Clone)]
pub enum SynthesisResult {
    /// Synthesized audio for the caller to play
    Audio { samples: Vec<f32>, sample_rate: u32 },
    /// The service played the audio itself and playback has completed
    PlaybackComplete,
}

/// Text-to-speech service, called once per generated response.
#[async_trait]
pub trait TextToSpeech: PipelineComponent {
    async fn synthesize(&self, text: &str, speaking_rate: f32) -> Result<SynthesisResult>;
}
