//! Orchestrator for the end-to-end voice assistant pipeline
//!
//! Consumes the audio stream, drives the voice activity detector, buffers
//! speech segments, sequences the external services (STT -> LLM -> TTS), and
//! drives the state machine so the assistant never hears its own voice: audio
//! arriving while a response is generated, played, or cooling down is dropped
//! before it can reach the detector.

use std::sync::Arc;

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audio::chunk::{AudioChunk, SpeechSegment};
use crate::audio::vad::{SpeechActivity, VoiceActivityDetector};
use crate::config::PipelineConfig;
use crate::events::{EventChannel, EventSubscriber, VoiceEvent};
use crate::pipeline::state::{PipelineState, PipelineStateMachine};
use crate::services::{
    GenerationRequest, LanguageModel, PipelineComponent, SpeechToText, TextToSpeech,
};
use crate::{Result, ServiceStage, TalkbackError};

/// Coordinates the detector, state machine, and external services for one
/// capture session at a time.
pub struct PipelineOrchestrator {
    config: PipelineConfig,
    state: Arc<PipelineStateMachine>,
    events: EventChannel,
    vad: Mutex<VoiceActivityDetector>,
    segment: Mutex<SpeechSegment>,
    stt: Arc<dyn SpeechToText>,
    llm: Arc<dyn LanguageModel>,
    tts: Option<Arc<dyn TextToSpeech>>,
    auxiliary: Option<Arc<dyn PipelineComponent>>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator. The configuration is validated here; an
    /// invalid configuration never reaches a running pipeline.
    pub fn new(
        config: PipelineConfig,
        stt: Arc<dyn SpeechToText>,
        llm: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        config.validate()?;

        let events = EventChannel::new(config.event_capacity);
        let state = Arc::new(PipelineStateMachine::new(
            config.cooldown,
            config.strict_transitions,
            events.clone(),
        ));
        let vad = Mutex::new(VoiceActivityDetector::new(config.vad.clone()));

        Ok(Self {
            config,
            state,
            events,
            vad,
            segment: Mutex::new(SpeechSegment::new()),
            stt,
            llm,
            tts: None,
            auxiliary: None,
        })
    }

    /// Attach a text-to-speech service. Without one, responses are
    /// text-only and no cooldown is needed.
    pub fn with_tts(mut self, tts: Arc<dyn TextToSpeech>) -> Self {
        self.tts = Some(tts);
        self
    }

    /// Attach an auxiliary component (e.g. a diarizer) that participates in
    /// startup initialization.
    pub fn with_auxiliary(mut self, component: Arc<dyn PipelineComponent>) -> Self {
        self.auxiliary = Some(component);
        self
    }

    /// Subscribe to the pipeline event stream.
    pub fn subscribe(&self) -> EventSubscriber {
        self.events.subscribe()
    }

    /// Shared handle to the state machine.
    pub fn state_machine(&self) -> Arc<PipelineStateMachine> {
        Arc::clone(&self.state)
    }

    pub fn current_state(&self) -> PipelineState {
        self.state.current()
    }

    /// Samples currently buffered in the in-progress speech segment.
    pub fn pending_samples(&self) -> usize {
        self.segment.lock().len()
    }

    /// Reset after an error or between sessions: state machine to `Idle`,
    /// detector back to calibration, buffers cleared. Idempotent.
    pub fn reset(&self) {
        self.state.reset();
        self.vad.lock().reset();
        self.segment.lock().clear();
        info!("pipeline reset");
    }

    /// Sequentially initialize all components, publishing
    /// `ComponentInitializing`/`ComponentReady` per component. The first
    /// failure publishes `ComponentFailed`, aborts the remaining
    /// initializations, and is returned to the caller.
    pub async fn initialize_components(&self) -> Result<()> {
        self.events.publish(VoiceEvent::ComponentInitializing(
            "voice-activity-detector".to_string(),
        ));
        self.vad.lock().reset();
        self.events.publish(VoiceEvent::ComponentReady(
            "voice-activity-detector".to_string(),
        ));

        self.init_step(self.stt.name(), self.stt.initialize()).await?;
        self.init_step(self.llm.name(), self.llm.initialize()).await?;
        if let Some(tts) = &self.tts {
            self.init_step(tts.name(), tts.initialize()).await?;
        }
        if let Some(auxiliary) = &self.auxiliary {
            self.init_step(auxiliary.name(), auxiliary.initialize())
                .await?;
        }

        info!("all pipeline components initialized");
        Ok(())
    }

    async fn init_step(
        &self,
        name: &str,
        init: impl std::future::Future<Output = Result<()>>,
    ) -> Result<()> {
        self.events
            .publish(VoiceEvent::ComponentInitializing(name.to_string()));
        match init.await {
            Ok(()) => {
                self.events
                    .publish(VoiceEvent::ComponentReady(name.to_string()));
                Ok(())
            }
            Err(e) => {
                error!(component = name, error = %e, "component initialization failed");
                self.events.publish(VoiceEvent::ComponentFailed {
                    component: name.to_string(),
                    error: e.to_string(),
                });
                Err(TalkbackError::ComponentInitialization {
                    component: name.to_string(),
                    cause: e.to_string(),
                })
            }
        }
    }

    /// Consume the audio stream until it ends.
    ///
    /// Runs the full per-chunk loop: feedback gating, detection, segment
    /// accumulation, and the STT -> LLM -> TTS turn on each completed
    /// utterance. Service failures move the pipeline to `Error`; subsequent
    /// chunks are dropped until `reset()`. Stream end is a clean shutdown.
    pub async fn process<S>(&self, audio: S) -> Result<()>
    where
        S: Stream<Item = AudioChunk>,
    {
        info!("pipeline processing started");
        futures::pin_mut!(audio);

        while let Some(chunk) = audio.next().await {
            self.handle_chunk(chunk).await;
        }

        self.finish_session();
        Ok(())
    }

    async fn handle_chunk(&self, chunk: AudioChunk) {
        let state = self.state.current();

        // Hard block: audio captured during our own voice output, the
        // cooldown grace period, or an unreset error must never reach the
        // detector or STT.
        if state.blocks_audio() || !self.state.can_activate_microphone() {
            let mut segment = self.segment.lock();
            if !segment.is_empty() {
                debug!(state = %state, "dropping chunk and partial segment");
                segment.clear();
            }
            return;
        }

        let activity = self.vad.lock().process(&chunk);
        match activity {
            SpeechActivity::None => {
                if self.vad.lock().is_speaking() {
                    self.segment.lock().extend(&chunk);
                }
            }
            SpeechActivity::Started => {
                if self.state.transition(PipelineState::Listening).is_ok() {
                    self.events.publish(VoiceEvent::SpeechStarted);
                    self.segment.lock().begin(&chunk);
                }
            }
            SpeechActivity::Ended => {
                self.segment.lock().extend(&chunk);
                if self
                    .state
                    .transition(PipelineState::ProcessingSpeech)
                    .is_ok()
                {
                    self.events.publish(VoiceEvent::SpeechEnded);
                    self.run_turn().await;
                }
            }
        }
    }

    /// Run one full turn for the segment that just closed.
    async fn run_turn(&self) {
        let turn = Uuid::new_v4();
        let (samples, sample_rate) = {
            let mut segment = self.segment.lock();
            let rate = segment.sample_rate();
            (segment.take_samples(), rate)
        };

        if samples.len() < self.config.min_segment_samples {
            debug!(
                turn = %turn,
                samples = samples.len(),
                floor = self.config.min_segment_samples,
                "segment below minimum duration, discarded as noise"
            );
            let _ = self.state.transition(PipelineState::Idle);
            return;
        }

        let outcome = timeout(
            self.config.pipeline_timeout,
            self.execute_turn(turn, samples, sample_rate),
        )
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.fail_pipeline(e),
            Err(_) => self.fail_pipeline(TalkbackError::Pipeline(format!(
                "turn {} exceeded the overall pipeline timeout",
                turn
            ))),
        }
    }

    async fn execute_turn(&self, turn: Uuid, samples: Vec<f32>, sample_rate: u32) -> Result<()> {
        debug!(turn = %turn, samples = samples.len(), "transcribing speech segment");

        let transcription = timeout(
            self.config.stt_timeout,
            self.stt.transcribe(&samples, sample_rate),
        )
        .await
        .map_err(|_| stage_timeout(ServiceStage::SpeechToText))?
        .map_err(|e| stage_error(ServiceStage::SpeechToText, e))?;

        if transcription.is_blank() {
            debug!(turn = %turn, "blank transcript, discarding");
            let _ = self.state.transition(PipelineState::Idle);
            return Ok(());
        }

        info!(turn = %turn, text = %transcription.text, "transcript final");
        self.events
            .publish(VoiceEvent::TranscriptFinal(transcription.text.clone()));
        self.state.transition(PipelineState::GeneratingResponse)?;

        // Raise the detector's guard for the rest of the turn
        self.vad.lock().begin_suppression();

        let request = GenerationRequest::new(transcription.text)
            .with_temperature(self.config.llm_temperature)
            .with_max_tokens(self.config.llm_max_tokens);

        let response = timeout(self.config.llm_timeout, self.collect_response(&request))
            .await
            .map_err(|_| stage_timeout(ServiceStage::LanguageModel))?
            .map_err(|e| stage_error(ServiceStage::LanguageModel, e))?;

        self.events
            .publish(VoiceEvent::ResponseFinal(response.clone()));

        let Some(tts) = self.tts.as_ref() else {
            // Text-only: nothing will play, so no cooldown is needed
            self.vad.lock().end_suppression();
            let _ = self.state.transition(PipelineState::Idle);
            return Ok(());
        };

        if !self.state.can_play_synthesis() {
            return Err(TalkbackError::Pipeline(
                "synthesis requested outside GeneratingResponse".to_string(),
            ));
        }
        self.state.transition(PipelineState::PlayingSynthesis)?;
        self.vad.lock().begin_suppression();
        self.events.publish(VoiceEvent::SynthesisStarted);

        let synthesis = timeout(
            self.config.tts_timeout,
            tts.synthesize(&response, self.config.tts_speaking_rate),
        )
        .await;

        // The detector is released as soon as the call returns; the cooldown
        // gate below is what keeps the microphone closed
        self.vad.lock().end_suppression();

        synthesis
            .map_err(|_| stage_timeout(ServiceStage::TextToSpeech))?
            .map_err(|e| stage_error(ServiceStage::TextToSpeech, e))?;

        self.events.publish(VoiceEvent::SynthesisCompleted);
        self.state.transition(PipelineState::Cooldown)?;
        Arc::clone(&self.state).schedule_cooldown_expiry();

        debug!(turn = %turn, "turn complete, cooling down");
        Ok(())
    }

    async fn collect_response(&self, request: &GenerationRequest) -> Result<String> {
        let mut stream = self.llm.stream_generate(request);
        let mut response = String::new();
        while let Some(token) = stream.next().await {
            let token = token?;
            self.events
                .publish(VoiceEvent::ResponseToken(token.clone()));
            response.push_str(&token);
        }
        Ok(response)
    }

    /// Convert a turn failure into the error state, exactly one
    /// `PipelineError` event, and cleared buffers.
    fn fail_pipeline(&self, err: TalkbackError) {
        error!(error = %err, "pipeline turn failed");
        self.segment.lock().clear();
        self.vad.lock().end_suppression();
        let _ = self
            .state
            .transition(PipelineState::Error(err.to_string()));
        self.events.publish(VoiceEvent::PipelineError(err.to_string()));
    }

    /// Clean shutdown when the audio stream ends.
    fn finish_session(&self) {
        self.segment.lock().clear();
        self.vad.lock().reset();

        match self.state.current() {
            PipelineState::Listening => {
                let _ = self.state.transition(PipelineState::Idle);
            }
            PipelineState::Cooldown => self.state.finish_cooldown(),
            // An unreset error stays sticky until reset() is called
            _ => {}
        }
        info!("audio stream ended, pipeline shut down");
    }
}

/// Builder for wiring an orchestrator from configuration and services.
pub struct OrchestratorBuilder {
    config: PipelineConfig,
    stt: Option<Arc<dyn SpeechToText>>,
    llm: Option<Arc<dyn LanguageModel>>,
    tts: Option<Arc<dyn TextToSpeech>>,
    auxiliary: Option<Arc<dyn PipelineComponent>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            stt: None,
            llm: None,
            tts: None,
            auxiliary: None,
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_stt(mut self, stt: Arc<dyn SpeechToText>) -> Self {
        self.stt = Some(stt);
        self
    }

    pub fn with_llm(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_tts(mut self, tts: Arc<dyn TextToSpeech>) -> Self {
        self.tts = Some(tts);
        self
    }

    pub fn with_auxiliary(mut self, component: Arc<dyn PipelineComponent>) -> Self {
        self.auxiliary = Some(component);
        self
    }

    pub fn build(self) -> Result<PipelineOrchestrator> {
        let stt = self.stt.ok_or_else(|| {
            TalkbackError::InvalidConfiguration("a speech-to-text service is required".to_string())
        })?;
        let llm = self.llm.ok_or_else(|| {
            TalkbackError::InvalidConfiguration("a language model service is required".to_string())
        })?;

        let mut orchestrator = PipelineOrchestrator::new(self.config, stt, llm)?;
        orchestrator.tts = self.tts;
        orchestrator.auxiliary = self.auxiliary;
        Ok(orchestrator)
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn stage_timeout(stage: ServiceStage) -> TalkbackError {
    warn!(%stage, "service call timed out");
    TalkbackError::ExternalService {
        stage,
        cause: "call timed out".to_string(),
    }
}

fn stage_error(stage: ServiceStage, err: TalkbackError) -> TalkbackError {
    match err {
        e @ TalkbackError::ExternalService { .. } => e,
        other => TalkbackError::ExternalService {
            stage,
            cause: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{SynthesisResult, TokenStream, Transcription};
    use async_trait::async_trait;

    struct FixedStt {
        text: String,
    }

    impl PipelineComponent for FixedStt {
        fn name(&self) -> &str {
            "fixed-stt"
        }
    }

    #[async_trait]
    impl SpeechToText for FixedStt {
        async fn transcribe(&self, _samples: &[f32], _rate: u32) -> Result<Transcription> {
            Ok(Transcription::new(self.text.clone(), 0.95))
        }
    }

    struct FixedLlm;

    impl PipelineComponent for FixedLlm {
        fn name(&self) -> &str {
            "fixed-llm"
        }
    }

    impl LanguageModel for FixedLlm {
        fn stream_generate<'a>(&'a self, _request: &GenerationRequest) -> TokenStream<'a> {
            futures::stream::iter(vec![Ok("ok".to_string())]).boxed()
        }
    }

    struct SilentTts;

    impl PipelineComponent for SilentTts {
        fn name(&self) -> &str {
            "silent-tts"
        }
    }

    #[async_trait]
    impl TextToSpeech for SilentTts {
        async fn synthesize(&self, _text: &str, _rate: f32) -> Result<SynthesisResult> {
            Ok(SynthesisResult::PlaybackComplete)
        }
    }

    fn build(config: PipelineConfig) -> PipelineOrchestrator {
        OrchestratorBuilder::new()
            .with_config(config)
            .with_stt(Arc::new(FixedStt {
                text: "hello".into(),
            }))
            .with_llm(Arc::new(FixedLlm))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_services() {
        let missing_stt = OrchestratorBuilder::new()
            .with_llm(Arc::new(FixedLlm))
            .build();
        assert!(missing_stt.is_err());

        let missing_llm = OrchestratorBuilder::new()
            .with_stt(Arc::new(FixedStt { text: "x".into() }))
            .build();
        assert!(missing_llm.is_err());
    }

    #[test]
    fn builder_rejects_invalid_config_at_build_time() {
        let mut config = PipelineConfig::default();
        config.llm_max_tokens = 0;

        let result = OrchestratorBuilder::new()
            .with_config(config)
            .with_stt(Arc::new(FixedStt { text: "x".into() }))
            .with_llm(Arc::new(FixedLlm))
            .build();

        assert!(matches!(
            result,
            Err(TalkbackError::InvalidConfiguration(_))
        ));
    }

    #[tokio::test]
    async fn initialization_publishes_per_component_events() {
        let orchestrator = build(PipelineConfig::default()).with_tts(Arc::new(SilentTts));
        let mut sub = orchestrator.subscribe();

        orchestrator.initialize_components().await.unwrap();

        let mut names = Vec::new();
        while let Some(event) = sub.try_recv() {
            if let VoiceEvent::ComponentReady(name) = event {
                names.push(name);
            }
        }
        assert_eq!(
            names,
            vec!["voice-activity-detector", "fixed-stt", "fixed-llm", "silent-tts"]
        );
    }

    #[tokio::test]
    async fn failed_initialization_aborts_and_surfaces_first_error() {
        struct FailingAux;

        #[async_trait]
        impl PipelineComponent for FailingAux {
            fn name(&self) -> &str {
                "diarizer"
            }
            async fn initialize(&self) -> Result<()> {
                Err(TalkbackError::Pipeline("model file missing".into()))
            }
        }

        let orchestrator =
            build(PipelineConfig::default()).with_auxiliary(Arc::new(FailingAux));
        let mut sub = orchestrator.subscribe();

        let err = orchestrator.initialize_components().await.unwrap_err();
        assert!(matches!(
            err,
            TalkbackError::ComponentInitialization { ref component, .. } if component == "diarizer"
        ));

        let mut failed = 0;
        while let Some(event) = sub.try_recv() {
            if matches!(event, VoiceEvent::ComponentFailed { .. }) {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);
    }

    #[tokio::test]
    async fn reset_is_idempotent() {
        let orchestrator = build(PipelineConfig::default());
        orchestrator
            .state_machine()
            .transition(PipelineState::Error("boom".into()))
            .unwrap();

        orchestrator.reset();
        assert!(orchestrator.current_state().is_idle());
        assert_eq!(orchestrator.pending_samples(), 0);

        orchestrator.reset();
        assert!(orchestrator.current_state().is_idle());
    }
}
