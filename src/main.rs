use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use talkback::audio::AudioChunk;
use talkback::config::PipelineConfig;
use talkback::pipeline::OrchestratorBuilder;
use talkback::services::{
    GenerationRequest, LanguageModel, PipelineComponent, SpeechToText, SynthesisResult,
    TextToSpeech, TokenStream, Transcription,
};

/// Demo speech-to-text: pretends every segment said the same thing.
struct DemoStt;

impl PipelineComponent for DemoStt {
    fn name(&self) -> &str {
        "demo-stt"
    }
}

#[async_trait]
impl SpeechToText for DemoStt {
    async fn transcribe(&self, samples: &[f32], sample_rate: u32) -> talkback::Result<Transcription> {
        let secs = samples.len() as f32 / sample_rate as f32;
        Ok(Transcription::new(
            format!("demo utterance ({:.1}s of audio)", secs),
            0.99,
        ))
    }
}

/// Demo language model: echoes the prompt back word by word.
struct DemoLlm;

impl PipelineComponent for DemoLlm {
    fn name(&self) -> &str {
        "demo-llm"
    }
}

impl LanguageModel for DemoLlm {
    fn stream_generate<'a>(&'a self, request: &GenerationRequest) -> TokenStream<'a> {
        let tokens: Vec<talkback::Result<String>> = format!("You said: {}", request.prompt)
            .split_inclusive(' ')
            .map(|w| Ok(w.to_string()))
            .collect();
        futures::stream::iter(tokens).boxed()
    }
}

/// Demo text-to-speech: "plays" for a moment, then reports completion.
struct DemoTts;

impl PipelineComponent for DemoTts {
    fn name(&self) -> &str {
        "demo-tts"
    }
}

#[async_trait]
impl TextToSpeech for DemoTts {
    async fn synthesize(&self, text: &str, _rate: f32) -> talkback::Result<SynthesisResult> {
        tokio::time::sleep(Duration::from_millis(10 * text.split(' ').count() as u64)).await;
        Ok(SynthesisResult::PlaybackComplete)
    }
}

/// Synthetic capture session: ambient noise for calibration, one spoken
/// burst, then trailing silence.
fn synthetic_session(sample_rate: u32) -> Vec<AudioChunk> {
    let chunk_len = (sample_rate / 10) as usize; // 100ms frames
    let mut chunks = Vec::new();
    let push = |amplitude: f32, count: usize, chunks: &mut Vec<AudioChunk>| {
        for _ in 0..count {
            let seq = chunks.len() as u64;
            chunks.push(AudioChunk::new(
                vec![amplitude; chunk_len],
                seq as f64 * 0.1,
                sample_rate,
                seq,
            ));
        }
    };
    push(0.001, 20, &mut chunks); // calibration
    push(0.30, 12, &mut chunks); // speech
    push(0.001, 10, &mut chunks); // trailing silence closes the segment
    chunks
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "talkback=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting talkback demo pipeline");

    let config = PipelineConfig::default().with_cooldown(Duration::from_millis(300));
    let orchestrator = OrchestratorBuilder::new()
        .with_config(config.clone())
        .with_stt(Arc::new(DemoStt))
        .with_llm(Arc::new(DemoLlm))
        .with_tts(Arc::new(DemoTts))
        .build()?;

    let mut events = orchestrator.subscribe();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(?event, "pipeline event");
        }
    });

    orchestrator.initialize_components().await?;
    orchestrator
        .process(futures::stream::iter(synthetic_session(config.sample_rate)))
        .await?;

    info!(state = %orchestrator.current_state(), "demo session complete");
    drop(orchestrator);
    let _ = printer.await;

    Ok(())
}
