//! Placeholder recognizers used before a real backend is wired in.

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{BYTES_PER_SAMPLE, SAMPLE_RATE};
use crate::error::Result;
use crate::recognize::{Recognizer, Transcription};

/// Echo-style stub: reports the shape of what it was given.
///
/// Lets the full pipeline (gate → workers → assembler → broadcast) be
/// exercised end-to-end with deterministic output.
pub struct StubRecognizer {
    utterances: Mutex<u64>,
}

impl StubRecognizer {
    pub fn new() -> Self {
        Self {
            utterances: Mutex::new(0),
        }
    }
}

impl Default for StubRecognizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Recognizer for StubRecognizer {
    fn transcribe(&self, pcm: &[u8]) -> Result<Transcription> {
        let mut count = self.utterances.lock();
        *count += 1;
        let secs = pcm.len() as f64 / (SAMPLE_RATE as usize * BYTES_PER_SAMPLE) as f64;
        Ok(Transcription {
            text: format!("[utterance {} — {:.1}s]", *count, secs),
            confidence: 1.0,
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }
}

/// Always-empty recognizer. Every segment surfaces as an empty-text final,
/// which exercises the failure accounting without a model.
pub struct NullRecognizer;

impl Recognizer for NullRecognizer {
    fn transcribe(&self, pcm: &[u8]) -> Result<Transcription> {
        debug!(bytes = pcm.len(), "null recognizer discarding segment");
        Ok(Transcription {
            text: String::new(),
            confidence: 0.0,
        })
    }

    fn parallel_safe(&self) -> bool {
        true
    }
}
