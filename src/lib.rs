pub mod audio;
pub mod config;
pub mod events;
pub mod pipeline;
pub mod services;

use thiserror::Error;

use crate::pipeline::state::PipelineState;

/// The pipeline stage an external service failure originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStage {
    SpeechToText,
    LanguageModel,
    TextToSpeech,
}

impl std::fmt::Display for ServiceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceStage::SpeechToText => write!(f, "speech-to-text"),
            ServiceStage::LanguageModel => write!(f, "language-model"),
            ServiceStage::TextToSpeech => write!(f, "text-to-speech"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum TalkbackError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Component '{component}' failed to initialize: {cause}")]
    ComponentInitialization { component: String, cause: String },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("External service failure in {stage}: {cause}")]
    ExternalService { stage: ServiceStage, cause: String },

    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Audio stream terminated")]
    StreamTerminated,
}

impl TalkbackError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Config errors require user intervention before a session can start
            TalkbackError::InvalidConfiguration(_) => false,
            // Startup failures abort the session
            TalkbackError::ComponentInitialization { .. } => false,
            // Refused transitions leave the pipeline in its prior state
            TalkbackError::InvalidTransition { .. } => true,
            // Service failures require an explicit reset, then the session continues
            TalkbackError::ExternalService { .. } => true,
            TalkbackError::Pipeline(_) => true,
            TalkbackError::Channel(_) => false,
            // Stream end is a clean shutdown, not a fault
            TalkbackError::StreamTerminated => true,
        }
    }

    /// Get a user-friendly description
    pub fn user_message(&self) -> String {
        match self {
            TalkbackError::InvalidConfiguration(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            TalkbackError::ComponentInitialization { component, .. } => {
                format!("Failed to start '{}'. Please try again.", component)
            }
            TalkbackError::InvalidTransition { .. } => {
                "The assistant is busy. Please wait a moment.".to_string()
            }
            TalkbackError::ExternalService { stage, .. } => match stage {
                ServiceStage::SpeechToText => {
                    "Speech recognition failed. Please try again.".to_string()
                }
                ServiceStage::LanguageModel => {
                    "Response generation failed. Please try again.".to_string()
                }
                ServiceStage::TextToSpeech => {
                    "Text-to-speech failed. Response will be shown as text.".to_string()
                }
            },
            TalkbackError::Pipeline(_) => {
                "Processing pipeline error. Please try again.".to_string()
            }
            TalkbackError::Channel(_) => {
                "Internal communication error. Please restart the application.".to_string()
            }
            TalkbackError::StreamTerminated => "Audio input has stopped.".to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, TalkbackError>;
