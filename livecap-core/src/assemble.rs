//! Sentence assembly — turns per-segment transcripts into stable sentences.
//!
//! Every recognized segment is appended to a pending buffer and re-emitted
//! as a `delta` snapshot. A `final` is committed when, checked in order:
//!
//! 1. the pending text ends with a sentence terminator,
//! 2. the pending text reaches `max_chars`,
//! 3. the buffer has been pending for `max_wait`,
//! 4. `silence_flush` has passed since the last segment and the pending
//!    text is at least `min_sentence_chars` long.
//!
//! Latin-script fragments are joined with a single space; CJK fragments are
//! concatenated directly. Re-delivery of the most recent fragment is a no-op.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broadcast::Broadcaster;
use crate::config::AssemblerParams;
use crate::events::{AudioEvent, TranscriptEvent, TranscriptKind};
use crate::persist::PersistItem;
use crate::recognize::worker::{RecognizedSegment, ReorderBuffer};

const SENTENCE_TERMINATORS: [char; 7] = ['.', '。', '!', '！', '?', '？', '…'];

fn is_cjk(c: char) -> bool {
    matches!(c as u32,
        0x3000..=0x303F   // CJK punctuation
        | 0x3040..=0x30FF // kana
        | 0x3400..=0x4DBF // CJK ext A
        | 0x4E00..=0x9FFF // CJK unified
        | 0xAC00..=0xD7AF // hangul
        | 0xF900..=0xFAFF // CJK compat
        | 0xFF00..=0xFFEF // fullwidth forms
    )
}

/// Single-session sentence assembler. Pure state machine; the driving task
/// lives in [`run_assembler`].
pub struct SentenceAssembler {
    params: AssemblerParams,
    session_id: String,
    pending: String,
    pending_since: Option<Instant>,
    pending_start: f64,
    last_segment_end: Option<(f64, Instant)>,
    last_fragment: Option<String>,
    confidence_sum: f64,
    confidence_count: u32,
}

impl SentenceAssembler {
    pub fn new(params: AssemblerParams, session_id: String) -> Self {
        Self {
            params,
            session_id,
            pending: String::new(),
            pending_since: None,
            pending_start: 0.0,
            last_segment_end: None,
            last_fragment: None,
            confidence_sum: 0.0,
            confidence_count: 0,
        }
    }

    /// Process one recognized segment. Returns the events to publish, in
    /// order.
    pub fn on_segment(&mut self, seg: &RecognizedSegment, now: Instant) -> Vec<TranscriptEvent> {
        let text = seg.text.trim();
        if seg.failed || text.is_empty() {
            // Recognition trouble surfaces as an empty final, never as a
            // session-level error.
            return vec![TranscriptEvent {
                kind: TranscriptKind::Final,
                text: String::new(),
                confidence: 0.0,
                seg_start: seg.seg_start,
                seg_end: seg.seg_end,
                session_id: self.session_id.clone(),
            }];
        }

        // Idempotent on exact re-delivery of the most recent fragment.
        if self.last_fragment.as_deref() == Some(text) {
            debug!(seq = seg.seq, "duplicate fragment ignored");
            return Vec::new();
        }

        if self.pending.is_empty() {
            self.pending_start = seg.seg_start;
            self.pending_since = Some(now);
        } else if needs_space(&self.pending, text) {
            self.pending.push(' ');
        }
        self.pending.push_str(text);
        self.last_fragment = Some(text.to_string());
        self.last_segment_end = Some((seg.seg_end, now));
        self.confidence_sum += seg.confidence as f64;
        self.confidence_count += 1;

        let mut out = vec![self.snapshot(TranscriptKind::Delta)];

        let terminator_hit = self
            .pending
            .chars()
            .last()
            .is_some_and(|c| SENTENCE_TERMINATORS.contains(&c));
        let length_hit = self.pending.chars().count() >= self.params.max_chars;
        let wait_hit = self
            .pending_since
            .is_some_and(|since| now.duration_since(since) >= self.params.max_wait);

        if terminator_hit || length_hit || wait_hit {
            out.push(self.finalize());
        }
        out
    }

    /// Time-based rules (3) and (4), checked from the driver's tick.
    pub fn on_tick(&mut self, now: Instant) -> Option<TranscriptEvent> {
        if self.pending.is_empty() {
            return None;
        }
        if self
            .pending_since
            .is_some_and(|since| now.duration_since(since) >= self.params.max_wait)
        {
            return Some(self.finalize());
        }
        if let Some((_, received_at)) = self.last_segment_end {
            if now.duration_since(received_at) >= self.params.silence_flush
                && self.pending.chars().count() >= self.params.min_sentence_chars
            {
                return Some(self.finalize());
            }
        }
        None
    }

    fn snapshot(&self, kind: TranscriptKind) -> TranscriptEvent {
        let confidence = if self.confidence_count == 0 {
            0.0
        } else {
            (self.confidence_sum / self.confidence_count as f64) as f32
        };
        TranscriptEvent {
            kind,
            text: self.pending.clone(),
            confidence,
            seg_start: self.pending_start,
            seg_end: self.last_segment_end.map(|(t, _)| t).unwrap_or(self.pending_start),
            session_id: self.session_id.clone(),
        }
    }

    fn finalize(&mut self) -> TranscriptEvent {
        let event = self.snapshot(TranscriptKind::Final);
        self.pending.clear();
        self.pending_since = None;
        self.confidence_sum = 0.0;
        self.confidence_count = 0;
        event
    }
}

fn needs_space(pending: &str, next: &str) -> bool {
    let prev_last = pending.chars().last();
    let next_first = next.chars().next();
    match (prev_last, next_first) {
        (Some(a), Some(b)) => !is_cjk(a) && !is_cjk(b),
        _ => false,
    }
}

/// Assembler task: reorders worker output and drives the assembler, fanning
/// results out to subscribers (and finals to the persistence task).
pub(crate) async fn run_assembler(
    mut rec_rx: mpsc::Receiver<RecognizedSegment>,
    mut assembler: SentenceAssembler,
    events: Arc<Broadcaster<AudioEvent>>,
    persist_tx: Option<mpsc::Sender<PersistItem>>,
    cancel: CancellationToken,
) {
    let mut reorder = ReorderBuffer::new();
    let mut tick = tokio::time::interval(std::time::Duration::from_millis(100));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                if let Some(event) = assembler.on_tick(Instant::now()) {
                    publish(&events, &persist_tx, event);
                }
            }
            item = rec_rx.recv() => {
                let Some(recognized) = item else { break };
                for released in reorder.push(recognized.seq, recognized) {
                    for event in assembler.on_segment(&released, Instant::now()) {
                        publish(&events, &persist_tx, event);
                    }
                }
            }
        }
    }
}

fn publish(
    events: &Broadcaster<AudioEvent>,
    persist_tx: &Option<mpsc::Sender<PersistItem>>,
    event: TranscriptEvent,
) {
    if event.kind == TranscriptKind::Final && !event.text.is_empty() {
        if let Some(tx) = persist_tx {
            let _ = tx.try_send(PersistItem::Final {
                text: event.text.clone(),
            });
        }
    }
    events.publish(AudioEvent::Transcript(event));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> AssemblerParams {
        AssemblerParams {
            max_wait: Duration::from_secs(4),
            max_chars: 120,
            silence_flush: Duration::from_millis(800),
            min_sentence_chars: 6,
        }
    }

    fn seg(seq: u64, text: &str, start: f64) -> RecognizedSegment {
        RecognizedSegment {
            seq,
            text: text.into(),
            confidence: 0.8,
            seg_start: start,
            seg_end: start + 1.0,
            failed: false,
        }
    }

    fn kinds(events: &[TranscriptEvent]) -> Vec<TranscriptKind> {
        events.iter().map(|e| e.kind).collect()
    }

    #[test]
    fn delta_then_final_on_terminator() {
        let mut asm = SentenceAssembler::new(params(), "s".into());
        let now = Instant::now();

        let first = asm.on_segment(&seg(0, "hello", 0.0), now);
        assert_eq!(kinds(&first), vec![TranscriptKind::Delta]);
        assert_eq!(first[0].text, "hello");

        let second = asm.on_segment(&seg(1, "world.", 1.5), now);
        assert_eq!(kinds(&second), vec![TranscriptKind::Delta, TranscriptKind::Final]);
        assert_eq!(second[1].text, "hello world.");
        assert!((second[1].seg_start - 0.0).abs() < 1e-9);
        assert!((second[1].seg_end - 2.5).abs() < 1e-9);
        assert!((second[1].confidence - 0.8).abs() < 1e-6);
    }

    #[test]
    fn cjk_fragments_concatenate_without_space() {
        let mut asm = SentenceAssembler::new(params(), "s".into());
        let now = Instant::now();
        asm.on_segment(&seg(0, "大家好", 0.0), now);
        let events = asm.on_segment(&seg(1, "欢迎来到直播间。", 1.0), now);
        let last = events.last().expect("final expected");
        assert_eq!(last.kind, TranscriptKind::Final);
        assert_eq!(last.text, "大家好欢迎来到直播间。");
    }

    #[test]
    fn max_chars_forces_final() {
        let mut p = params();
        p.max_chars = 10;
        let mut asm = SentenceAssembler::new(p, "s".into());
        let now = Instant::now();
        let events = asm.on_segment(&seg(0, "abcdefghijk", 0.0), now);
        assert_eq!(kinds(&events), vec![TranscriptKind::Delta, TranscriptKind::Final]);
    }

    #[test]
    fn max_wait_forces_final_on_tick() {
        let mut p = params();
        // Push the silence rule out of the way so max_wait is what fires.
        p.silence_flush = Duration::from_secs(60);
        let mut asm = SentenceAssembler::new(p, "s".into());
        let t0 = Instant::now();
        asm.on_segment(&seg(0, "no punctuation here", 0.0), t0);
        assert!(asm.on_tick(t0 + Duration::from_secs(3)).is_none());
        let event = asm.on_tick(t0 + Duration::from_secs(5)).expect("forced final");
        assert_eq!(event.kind, TranscriptKind::Final);
        assert_eq!(event.text, "no punctuation here");
        // Buffer reset: nothing further to flush.
        assert!(asm.on_tick(t0 + Duration::from_secs(10)).is_none());
    }

    #[test]
    fn silence_flush_requires_min_sentence_chars() {
        let mut asm = SentenceAssembler::new(params(), "s".into());
        let t0 = Instant::now();
        asm.on_segment(&seg(0, "hm", 0.0), t0);
        // 2 chars < min_sentence_chars (6): silence alone must not finalize.
        assert!(asm.on_tick(t0 + Duration::from_secs(1)).is_none());

        asm.on_segment(&seg(1, "alright", 1.0), t0 + Duration::from_secs(1));
        let event = asm
            .on_tick(t0 + Duration::from_secs(2))
            .expect("silence flush final");
        assert_eq!(event.text, "hm alright");
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut asm = SentenceAssembler::new(params(), "s".into());
        let now = Instant::now();
        asm.on_segment(&seg(0, "hello", 0.0), now);
        let dup = asm.on_segment(&seg(0, "hello", 0.0), now);
        assert!(dup.is_empty());
        let events = asm.on_segment(&seg(1, "again.", 1.0), now);
        assert_eq!(events.last().expect("final").text, "hello again.");
    }

    #[test]
    fn failed_segment_yields_empty_final_without_touching_pending() {
        let mut asm = SentenceAssembler::new(params(), "s".into());
        let now = Instant::now();
        asm.on_segment(&seg(0, "hello", 0.0), now);

        let failed = RecognizedSegment {
            failed: true,
            ..seg(1, "", 1.0)
        };
        let events = asm.on_segment(&failed, now);
        assert_eq!(kinds(&events), vec![TranscriptKind::Final]);
        assert!(events[0].text.is_empty());
        assert_eq!(events[0].confidence, 0.0);

        let events = asm.on_segment(&seg(2, "world.", 2.0), now);
        assert_eq!(events.last().expect("final").text, "hello world.");
    }

    #[test]
    fn ellipsis_terminates_a_sentence() {
        let mut asm = SentenceAssembler::new(params(), "s".into());
        let events = asm.on_segment(&seg(0, "well…", 0.0), Instant::now());
        assert_eq!(kinds(&events), vec![TranscriptKind::Delta, TranscriptKind::Final]);
    }
}
