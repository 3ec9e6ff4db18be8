//! Pipeline lifecycle events and the publish/subscribe conduit
//!
//! Events are fire-and-forget: producers never block, and a slow subscriber
//! only loses its own oldest events. Delivery order is FIFO per subscriber;
//! no ordering is guaranteed across two different subscribers.

use tokio::sync::broadcast;
use tracing::warn;

use crate::pipeline::state::PipelineState;

/// Lifecycle and transcript/response notifications emitted by the pipeline.
#[derive(Debug, Clone)]
pub enum VoiceEvent {
    /// The detector crossed a speech-start boundary
    SpeechStarted,

    /// The detector crossed a speech-end boundary
    SpeechEnded,

    /// Streaming transcription update (emitted by streaming STT adapters)
    TranscriptPartial(String),

    /// Final transcription of one utterance
    TranscriptFinal(String),

    /// One generated response token
    ResponseToken(String),

    /// The complete generated response
    ResponseFinal(String),

    /// Speech synthesis is starting
    SynthesisStarted,

    /// Speech synthesis has completed
    SynthesisCompleted,

    /// A component has begun initializing
    ComponentInitializing(String),

    /// A component finished initializing
    ComponentReady(String),

    /// A component failed to initialize
    ComponentFailed { component: String, error: String },

    /// A mid-session pipeline failure; the pipeline requires a reset
    PipelineError(String),

    /// A committed state machine transition
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
}

/// Bounded broadcast channel for `VoiceEvent`.
///
/// Backpressure policy: drop-oldest. A subscriber that falls more than the
/// channel capacity behind skips its oldest pending events rather than
/// stalling the pipeline.
#[derive(Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<VoiceEvent>,
}

impl EventChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event to all current subscribers. Never blocks; an event
    /// published with no subscribers is discarded.
    pub fn publish(&self, event: VoiceEvent) {
        let _ = self.tx.send(event);
    }

    /// Open a new subscription. Only events published after this call are
    /// delivered.
    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One subscriber's view of the event stream.
pub struct EventSubscriber {
    rx: broadcast::Receiver<VoiceEvent>,
}

impl EventSubscriber {
    /// Receive the next event, waiting if none is pending. Returns `None`
    /// once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<VoiceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Receive the next pending event without waiting.
    pub fn try_recv(&mut self) -> Option<VoiceEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, oldest events dropped");
                }
                Err(_) => return None,
            }
        }
    }
}
