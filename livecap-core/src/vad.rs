//! Voice-activity gate — the central segmentation state machine.
//!
//! ## States
//!
//! ```text
//!            voiced ≥ min_speech                first quiet frame
//!   Idle ───────────────────────► Speech ───────────────────────► Hangover
//!    ▲                              ▲                                │
//!    │       emit segment           │      RMS back above threshold  │
//!    └──────────────────────────────┼────────────────────────────────┤
//!                                   └────────────────────────────────┘
//!                                         quiet ≥ min_silence
//! ```
//!
//! A prebuffer of recent frames (one hangover window deep) is prepended to
//! every segment so the utterance onset is not clipped. A frame whose RMS
//! equals the threshold exactly counts as voiced. Accumulated voiced audio is
//! force-emitted at 30 s to bound recognizer input size.
//!
//! The gate itself cannot fail; recognizer trouble downstream is reported as
//! empty-text finals, never back into the gate.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunker::AudioFrame;
use crate::config::VadParams;
use crate::persist::PersistItem;
use crate::session::SessionStats;

/// Segment queue bound between the gate and the recognizer workers. Sends
/// block when the recognizer falls behind, backpressuring the gate.
pub const SEGMENT_QUEUE: usize = 4;

/// Forced-flush ceiling on accumulated voiced audio.
pub const MAX_VOICED_SECS: f64 = 30.0;

/// One utterance bounded by detected silences.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Concatenated frame PCM (s16le mono 16 kHz).
    pub pcm: Vec<u8>,
    /// Stream time of the first included frame.
    pub t0: f64,
    pub duration: f64,
    pub mean_rms: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Speech,
    Hangover,
}

/// RMS-plus-hangover voice activity gate.
pub struct VadGate {
    params: VadParams,
    state: GateState,
    /// Recent frames kept while idle so segment onsets are preserved.
    prebuffer: VecDeque<AudioFrame>,
    /// Voiced frames observed in `Idle` that have not yet confirmed speech.
    candidate: Vec<AudioFrame>,
    candidate_voiced: f64,
    /// Frames collected since entering `Speech` (prebuffer included).
    collected: Vec<AudioFrame>,
    voiced_total: f64,
    silence_run: f64,
}

impl VadGate {
    pub fn new(params: VadParams) -> Self {
        Self {
            params,
            state: GateState::Idle,
            prebuffer: VecDeque::new(),
            candidate: Vec::new(),
            candidate_voiced: 0.0,
            collected: Vec::new(),
            voiced_total: 0.0,
            silence_run: 0.0,
        }
    }

    fn voiced(&self, frame: &AudioFrame) -> bool {
        // Exactly-threshold frames count as voiced.
        frame.rms as f64 >= self.params.min_rms
    }

    /// Advance the machine by one frame; returns a segment when one closes.
    pub fn push(&mut self, frame: AudioFrame) -> Option<Segment> {
        match self.state {
            GateState::Idle => {
                if self.voiced(&frame) {
                    self.candidate_voiced += frame.duration;
                    self.candidate.push(frame);
                    if self.candidate_voiced >= self.params.min_speech_sec {
                        self.enter_speech();
                    }
                } else {
                    // Candidate run broken: its frames become onset context.
                    for f in self.candidate.drain(..) {
                        self.prebuffer.push_back(f);
                    }
                    self.candidate_voiced = 0.0;
                    self.prebuffer.push_back(frame);
                    self.trim_prebuffer();
                }
                None
            }
            GateState::Speech => {
                let voiced = self.voiced(&frame);
                let duration = frame.duration;
                self.collected.push(frame);
                if voiced {
                    self.voiced_total += duration;
                    self.maybe_force_flush()
                } else {
                    self.state = GateState::Hangover;
                    self.silence_run = duration;
                    None
                }
            }
            GateState::Hangover => {
                let voiced = self.voiced(&frame);
                let duration = frame.duration;
                self.collected.push(frame);
                if voiced {
                    self.state = GateState::Speech;
                    self.silence_run = 0.0;
                    self.voiced_total += duration;
                    self.maybe_force_flush()
                } else {
                    self.silence_run += duration;
                    if self.silence_run >= self.params.min_silence_sec {
                        Some(self.emit())
                    } else {
                        None
                    }
                }
            }
        }
    }

    fn enter_speech(&mut self) {
        self.state = GateState::Speech;
        self.voiced_total = self.candidate_voiced;
        self.silence_run = 0.0;
        self.collected = self.prebuffer.drain(..).chain(self.candidate.drain(..)).collect();
        self.candidate_voiced = 0.0;
    }

    fn maybe_force_flush(&mut self) -> Option<Segment> {
        if self.voiced_total >= MAX_VOICED_SECS {
            debug!(voiced_secs = self.voiced_total, "forcing segment flush");
            Some(self.emit())
        } else {
            None
        }
    }

    fn trim_prebuffer(&mut self) {
        let max = self.params.hangover_sec;
        let mut total: f64 = self.prebuffer.iter().map(|f| f.duration).sum();
        while self.prebuffer.len() > 1 && total > max {
            if let Some(front) = self.prebuffer.pop_front() {
                total -= front.duration;
            }
        }
    }

    fn emit(&mut self) -> Segment {
        let frames = std::mem::take(&mut self.collected);
        let t0 = frames.first().map(|f| f.t0).unwrap_or(0.0);
        let duration: f64 = frames.iter().map(|f| f.duration).sum();
        let mean_rms = if frames.is_empty() {
            0.0
        } else {
            frames.iter().map(|f| f.rms).sum::<f32>() / frames.len() as f32
        };
        let mut pcm = Vec::with_capacity(frames.iter().map(|f| f.pcm.len()).sum());
        for f in &frames {
            pcm.extend_from_slice(&f.pcm);
        }

        self.state = GateState::Idle;
        self.voiced_total = 0.0;
        self.silence_run = 0.0;
        self.candidate_voiced = 0.0;
        self.prebuffer.clear();

        Segment {
            pcm,
            t0,
            duration,
            mean_rms,
        }
    }
}

/// Gate task: frames in, sequenced segments out with backpressure.
pub(crate) async fn run_gate(
    mut frame_rx: mpsc::Receiver<AudioFrame>,
    mut gate: VadGate,
    seg_tx: mpsc::Sender<(u64, Segment)>,
    persist_tx: Option<mpsc::Sender<PersistItem>>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
) {
    let mut next_seq: u64 = 0;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Some(segment) = gate.push(frame) {
            if segment.pcm.is_empty() {
                continue;
            }
            stats.segments_emitted.fetch_add(1, Ordering::Relaxed);
            if let Some(tx) = &persist_tx {
                let _ = tx.try_send(PersistItem::Segment {
                    seq: next_seq,
                    segment: segment.clone(),
                });
            }
            let seq = next_seq;
            next_seq += 1;
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = seg_tx.send((seq, segment)) => {
                    if sent.is_err() {
                        break;
                    }
                }
            }
        }
    }
}
