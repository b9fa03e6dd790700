//! Speech recognition abstraction.
//!
//! The [`Recognizer`] trait decouples the pipeline from any specific backend.
//! Calls take `&self`: implementations hold model state across calls and
//! guard it with their own mutex, which is also what makes a backend
//! eligible to advertise [`Recognizer::parallel_safe`].
//!
//! The reference backend in the original system buffered until it had about
//! 0.3 s of audio; callers must not assume any minimum — the per-segment
//! deadline in the worker pool guards against hangs either way.

pub mod stub;
pub mod worker;

pub use stub::{NullRecognizer, StubRecognizer};

use std::sync::Arc;

use crate::error::Result;

/// One recognition result.
#[derive(Debug, Clone)]
pub struct Transcription {
    pub text: String,
    /// Backend confidence in [0.0, 1.0].
    pub confidence: f32,
}

/// Contract for speech recognition backends.
pub trait Recognizer: Send + Sync + 'static {
    /// Transcribe one utterance of PCM s16le mono 16 kHz audio.
    ///
    /// Called from a blocking worker thread; may take up to the per-segment
    /// deadline before the caller gives up on the result.
    fn transcribe(&self, pcm: &[u8]) -> Result<Transcription>;

    /// Whether concurrent `transcribe` calls are allowed. Worker counts
    /// above one are only honored when this returns true.
    fn parallel_safe(&self) -> bool {
        false
    }
}

/// Shared handle to any [`Recognizer`] implementor.
#[derive(Clone)]
pub struct RecognizerHandle(pub Arc<dyn Recognizer>);

impl RecognizerHandle {
    pub fn new<R: Recognizer>(recognizer: R) -> Self {
        Self(Arc::new(recognizer))
    }
}

impl std::fmt::Debug for RecognizerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecognizerHandle").finish_non_exhaustive()
    }
}
