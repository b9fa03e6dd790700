//! PCM byte stream → fixed-size audio frames + level meter.
//!
//! The chunker slices the transcoder's s16le byte stream into frames of
//! `round(chunk_seconds · 16000) · 2` bytes, computing RMS and peak per
//! frame. Partial tails are held until the next read completes them; on
//! session stop the tail is discarded.
//!
//! When the segment path backs up (recognizer queue full → VAD task blocked
//! → frame queue full), the chunker keeps reading: level emission pauses and
//! frames are held for at most 2 s of stream time before the oldest are
//! dropped and counted.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::events::{AudioEvent, LevelEvent};
use crate::session::SessionStats;

/// Frame queue bound between chunker and VAD gate.
pub const FRAME_QUEUE: usize = 64;

/// Stream time between level events. Frames are never shorter than 0.2 s, so
/// this also caps the level rate well under 10 Hz.
const LEVEL_INTERVAL_SECS: f64 = 0.1;

/// How much stream time of frames may pile up before the oldest are dropped.
const OVERFLOW_HOLD_SECS: f64 = 2.0;

/// One fixed-size PCM chunk with its precomputed levels.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// PCM s16le mono 16 kHz bytes, exactly one frame long.
    pub pcm: Vec<u8>,
    /// Stream time of the frame start, seconds since session start.
    pub t0: f64,
    pub duration: f64,
    pub rms: f32,
    pub peak: f32,
}

/// RMS and absolute peak of an s16le sample buffer, normalized to [0, 1].
pub fn rms_peak(pcm: &[u8]) -> (f32, f32) {
    let samples = pcm.len() / 2;
    if samples == 0 {
        return (0.0, 0.0);
    }
    let mut sum_sq = 0.0f64;
    let mut peak = 0.0f32;
    for pair in pcm.chunks_exact(2) {
        let s = i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0;
        sum_sq += (s as f64) * (s as f64);
        peak = peak.max(s.abs());
    }
    ((sum_sq / samples as f64).sqrt() as f32, peak)
}

/// Stateful frame slicer.
pub struct Chunker {
    frame_bytes: usize,
    chunk_seconds: f64,
    buf: Vec<u8>,
    produced: u64,
    last_level_t: f64,
}

impl Chunker {
    pub fn new(frame_bytes: usize, chunk_seconds: f64) -> Self {
        Self {
            frame_bytes,
            chunk_seconds,
            buf: Vec::with_capacity(frame_bytes * 2),
            produced: 0,
            last_level_t: f64::NEG_INFINITY,
        }
    }

    pub fn chunk_seconds(&self) -> f64 {
        self.chunk_seconds
    }

    /// Feed raw bytes; returns every frame completed by this read.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while self.buf.len() >= self.frame_bytes {
            let rest = self.buf.split_off(self.frame_bytes);
            let pcm = std::mem::replace(&mut self.buf, rest);
            let (rms, peak) = rms_peak(&pcm);
            out.push(AudioFrame {
                pcm,
                t0: self.produced as f64 * self.chunk_seconds,
                duration: self.chunk_seconds,
                rms,
                peak,
            });
            self.produced += 1;
        }
        out
    }

    /// Coalesced level tick for `frame`, if one is due.
    pub fn take_level(&mut self, frame: &AudioFrame) -> Option<LevelEvent> {
        if frame.t0 - self.last_level_t < LEVEL_INTERVAL_SECS {
            return None;
        }
        self.last_level_t = frame.t0;
        Some(LevelEvent {
            rms: frame.rms,
            peak: frame.peak,
            t: frame.t0,
        })
    }

    /// Bytes currently held as an incomplete tail.
    pub fn tail_len(&self) -> usize {
        self.buf.len()
    }
}

/// Chunker task: consumes reader output, forwards frames to the VAD gate.
pub(crate) async fn run_chunker(
    mut bytes_rx: mpsc::Receiver<Vec<u8>>,
    mut chunker: Chunker,
    frame_tx: mpsc::Sender<AudioFrame>,
    events: Arc<Broadcaster<AudioEvent>>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
) {
    let hold_max = (OVERFLOW_HOLD_SECS / chunker.chunk_seconds()).ceil().max(1.0) as usize;
    let mut held: VecDeque<AudioFrame> = VecDeque::new();
    let mut flush_tick = tokio::time::interval(std::time::Duration::from_millis(50));
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = flush_tick.tick() => {
                forward_held(&frame_tx, &mut held);
            }
            msg = bytes_rx.recv() => {
                let Some(bytes) = msg else { break };
                for frame in chunker.push(&bytes) {
                    stats.chunks_in.fetch_add(1, Ordering::Relaxed);
                    // Levels pause while the pipeline is backpressured; frames
                    // take priority.
                    if held.is_empty() {
                        if let Some(level) = chunker.take_level(&frame) {
                            events.publish(AudioEvent::Level(level));
                        }
                    }
                    held.push_back(frame);
                }
                forward_held(&frame_tx, &mut held);
                while held.len() > hold_max {
                    held.pop_front();
                    stats.dropped_frames.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }
    if chunker.tail_len() > 0 {
        debug!(tail_bytes = chunker.tail_len(), "discarding partial tail on stop");
    }
}

fn forward_held(frame_tx: &mpsc::Sender<AudioFrame>, held: &mut VecDeque<AudioFrame>) {
    while let Some(frame) = held.pop_front() {
        match frame_tx.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                held.push_front(frame);
                break;
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                held.clear();
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pcm_of(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn partial_tail_held_until_completed() {
        // 4 samples per frame (8 bytes).
        let mut chunker = Chunker::new(8, 0.25);
        let bytes = pcm_of(&[100, 200, 300]);
        assert!(chunker.push(&bytes).is_empty());
        assert_eq!(chunker.tail_len(), 6);

        let frames = chunker.push(&pcm_of(&[400, 500]));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].pcm, pcm_of(&[100, 200, 300, 400]));
        assert_eq!(chunker.tail_len(), 2);
    }

    #[test]
    fn frame_t0_is_strictly_monotonic() {
        let mut chunker = Chunker::new(4, 0.125);
        let frames = chunker.push(&pcm_of(&[0; 8]));
        assert_eq!(frames.len(), 4);
        for pair in frames.windows(2) {
            assert!(pair[1].t0 > pair[0].t0);
        }
        assert!((frames[1].t0 - 0.125).abs() < 1e-9);
    }

    #[test]
    fn rms_peak_of_square_wave() {
        let samples: Vec<i16> = (0..64).map(|i| if i % 2 == 0 { 16384 } else { -16384 }).collect();
        let (rms, peak) = rms_peak(&pcm_of(&samples));
        assert!((rms - 0.5).abs() < 1e-3, "rms={rms}");
        assert!((peak - 0.5).abs() < 1e-3, "peak={peak}");
    }

    #[test]
    fn rms_peak_of_empty_buffer_is_zero() {
        assert_eq!(rms_peak(&[]), (0.0, 0.0));
    }

    #[test]
    fn level_ticks_are_coalesced() {
        let mut chunker = Chunker::new(4, 0.02); // deliberately tiny frames
        let frames = chunker.push(&pcm_of(&[0; 24]));
        let levels: Vec<LevelEvent> = frames.iter().filter_map(|f| chunker.take_level(f)).collect();
        // 12 frames over 0.24 s of stream time → at most 3 ticks at 0.1 s spacing.
        assert!(levels.len() <= 3, "got {} levels", levels.len());
    }
}
