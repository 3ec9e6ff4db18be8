//! Audio data types and voice activity detection

pub mod chunk;
pub mod vad;

pub use chunk::{rms, AudioChunk, SpeechSegment};
pub use vad::{SpeechActivity, VadConfig, VoiceActivityDetector};

use futures::Stream;
use tokio::sync::mpsc;

/// Bridge a push-style audio source into the chunk stream the pipeline
/// consumes. The stream ends when the sender side is dropped.
pub fn chunk_stream(mut rx: mpsc::Receiver<AudioChunk>) -> impl Stream<Item = AudioChunk> {
    async_stream::stream! {
        while let Some(chunk) = rx.recv().await {
            let last = chunk.is_final;
            yield chunk;
            if last {
                break;
            }
        }
    }
}
