//! Recognizer worker pool and output reordering.
//!
//! Segments are pulled from a single FIFO queue by up to `W` workers
//! (`W > 1` only when the backend advertises parallel safety). Each result
//! is tagged with its segment's sequence number; a [`ReorderBuffer`]
//! downstream releases results to the assembler in strict segment order even
//! when recognition completes out of order. With one worker the buffer is a
//! pass-through, but it always exists so the contract stays single-shape.
//!
//! A per-segment deadline of `max(3 s, 2 · duration)` bounds every call.
//! Deadline or backend failure yields an empty-text result with zero
//! confidence; it is never session-fatal.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::recognize::RecognizerHandle;
use crate::session::SessionStats;
use crate::vad::Segment;

/// Recognition output for one segment, tagged for reordering.
#[derive(Debug, Clone)]
pub struct RecognizedSegment {
    pub seq: u64,
    pub text: String,
    pub confidence: f32,
    pub seg_start: f64,
    pub seg_end: f64,
    /// True when the backend errored or the deadline elapsed.
    pub failed: bool,
}

/// Per-segment recognition deadline.
pub fn deadline_for(segment_duration: f64) -> Duration {
    Duration::from_secs_f64((2.0 * segment_duration).max(3.0))
}

/// Releases items in ascending sequence order, holding early arrivals.
pub struct ReorderBuffer<T> {
    next: u64,
    pending: BTreeMap<u64, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Insert `item` and drain everything now contiguous from the front.
    pub fn push(&mut self, seq: u64, item: T) -> Vec<T> {
        self.pending.insert(seq, item);
        let mut released = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            released.push(item);
            self.next += 1;
        }
        released
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Worker pool task. Resolves when the segment queue closes or the session
/// is cancelled.
pub(crate) async fn run_workers(
    worker_count: usize,
    handle: RecognizerHandle,
    seg_rx: mpsc::Receiver<(u64, Segment)>,
    out_tx: mpsc::Sender<RecognizedSegment>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
) {
    let workers = if worker_count > 1 && !handle.0.parallel_safe() {
        warn!(
            requested = worker_count,
            "recognizer is not parallel-safe; using a single worker"
        );
        1
    } else {
        worker_count.max(1)
    };

    let seg_rx = Arc::new(Mutex::new(seg_rx));
    let mut tasks = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let seg_rx = Arc::clone(&seg_rx);
        let handle = handle.clone();
        let out_tx = out_tx.clone();
        let stats = Arc::clone(&stats);
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(worker_loop(
            worker_id, seg_rx, handle, out_tx, stats, cancel,
        )));
    }
    for task in tasks {
        let _ = task.await;
    }
}

async fn worker_loop(
    worker_id: usize,
    seg_rx: Arc<Mutex<mpsc::Receiver<(u64, Segment)>>>,
    handle: RecognizerHandle,
    out_tx: mpsc::Sender<RecognizedSegment>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
) {
    loop {
        // Lock only to pick up the next segment, not across the call.
        let next = {
            let mut rx = seg_rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                item = rx.recv() => item,
            }
        };
        let Some((seq, segment)) = next else { break };

        let result = transcribe_with_deadline(&handle, &segment).await;
        let recognized = match result {
            Ok(tr) => {
                if !tr.text.trim().is_empty() {
                    stats.successful_transcriptions.fetch_add(1, Ordering::Relaxed);
                    stats.record_confidence(tr.confidence);
                }
                RecognizedSegment {
                    seq,
                    text: tr.text,
                    confidence: tr.confidence,
                    seg_start: segment.t0,
                    seg_end: segment.t0 + segment.duration,
                    failed: false,
                }
            }
            Err(reason) => {
                stats.failed_transcriptions.fetch_add(1, Ordering::Relaxed);
                warn!(worker_id, seq, %reason, "segment recognition failed");
                RecognizedSegment {
                    seq,
                    text: String::new(),
                    confidence: 0.0,
                    seg_start: segment.t0,
                    seg_end: segment.t0 + segment.duration,
                    failed: true,
                }
            }
        };
        debug!(worker_id, seq, failed = recognized.failed, "segment recognized");
        if out_tx.send(recognized).await.is_err() {
            break;
        }
    }
}

async fn transcribe_with_deadline(
    handle: &RecognizerHandle,
    segment: &Segment,
) -> std::result::Result<crate::recognize::Transcription, String> {
    let deadline = deadline_for(segment.duration);
    let pcm = segment.pcm.clone();
    let recognizer = handle.clone();
    let call = tokio::task::spawn_blocking(move || recognizer.0.transcribe(&pcm));
    match tokio::time::timeout(deadline, call).await {
        Ok(Ok(Ok(tr))) => Ok(tr),
        Ok(Ok(Err(e))) => Err(e.to_string()),
        Ok(Err(join)) => Err(format!("recognizer worker panicked: {join}")),
        // The blocking call keeps running; its late result is dropped with
        // the abandoned JoinHandle.
        Err(_) => Err(format!("deadline {deadline:?} exceeded")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LivecapError;
    use crate::recognize::{Recognizer, Transcription};

    #[test]
    fn deadline_floors_at_three_seconds() {
        assert_eq!(deadline_for(0.5), Duration::from_secs(3));
        assert_eq!(deadline_for(1.5), Duration::from_secs(3));
        assert_eq!(deadline_for(10.0), Duration::from_secs(20));
    }

    #[test]
    fn reorder_buffer_releases_in_sequence() {
        let mut buf = ReorderBuffer::new();
        assert!(buf.push(1, "b").is_empty());
        assert!(buf.push(2, "c").is_empty());
        assert_eq!(buf.pending_len(), 2);
        assert_eq!(buf.push(0, "a"), vec!["a", "b", "c"]);
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.push(3, "d"), vec!["d"]);
    }

    struct FailingRecognizer;

    impl Recognizer for FailingRecognizer {
        fn transcribe(&self, _pcm: &[u8]) -> crate::error::Result<Transcription> {
            Err(LivecapError::RecognizerFailed("model exploded".into()))
        }
    }

    struct FixedRecognizer(&'static str);

    impl Recognizer for FixedRecognizer {
        fn transcribe(&self, _pcm: &[u8]) -> crate::error::Result<Transcription> {
            Ok(Transcription {
                text: self.0.to_string(),
                confidence: 0.9,
            })
        }
    }

    fn segment(t0: f64) -> Segment {
        Segment {
            pcm: vec![0u8; 320],
            t0,
            duration: 0.5,
            mean_rms: 0.1,
        }
    }

    #[tokio::test]
    async fn worker_emits_tagged_results_and_counts_successes() {
        let (seg_tx, seg_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let stats = Arc::new(SessionStats::default());
        let cancel = CancellationToken::new();
        let pool = tokio::spawn(run_workers(
            1,
            RecognizerHandle::new(FixedRecognizer("hello")),
            seg_rx,
            out_tx,
            Arc::clone(&stats),
            cancel.clone(),
        ));

        seg_tx.send((0, segment(0.0))).await.expect("send");
        seg_tx.send((1, segment(1.0))).await.expect("send");
        drop(seg_tx);

        let first = out_rx.recv().await.expect("first result");
        let second = out_rx.recv().await.expect("second result");
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert_eq!(first.text, "hello");
        assert!(!first.failed);
        assert!((first.seg_end - 0.5).abs() < 1e-9);

        pool.await.expect("pool join");
        assert_eq!(stats.snapshot().successful_transcriptions, 2);
        assert_eq!(stats.snapshot().failed_transcriptions, 0);
    }

    #[tokio::test]
    async fn backend_error_becomes_empty_failed_result() {
        let (seg_tx, seg_rx) = mpsc::channel(4);
        let (out_tx, mut out_rx) = mpsc::channel(4);
        let stats = Arc::new(SessionStats::default());
        let pool = tokio::spawn(run_workers(
            1,
            RecognizerHandle::new(FailingRecognizer),
            seg_rx,
            out_tx,
            Arc::clone(&stats),
            CancellationToken::new(),
        ));

        seg_tx.send((0, segment(0.0))).await.expect("send");
        drop(seg_tx);

        let result = out_rx.recv().await.expect("result");
        assert!(result.failed);
        assert!(result.text.is_empty());
        assert_eq!(result.confidence, 0.0);

        pool.await.expect("pool join");
        assert_eq!(stats.snapshot().failed_transcriptions, 1);
        assert_eq!(stats.snapshot().successful_transcriptions, 0);
    }
}
