//! Optional debug artifacts under `persist_root/<session_id>/`.
//!
//! Segments land as 16 kHz mono WAV files (`seg_00042.wav`), committed
//! sentences are appended to `finals.log`. Everything here is best-effort:
//! a write failure is logged and the pipeline continues.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::SAMPLE_RATE;
use crate::vad::Segment;

/// Queue bound for the persistence task. Sends are `try_send`: if the disk
/// cannot keep up, artifacts are skipped, never the pipeline.
pub const PERSIST_QUEUE: usize = 32;

#[derive(Debug, Clone)]
pub enum PersistItem {
    Segment { seq: u64, segment: Segment },
    Final { text: String },
}

pub struct PersistWriter {
    dir: PathBuf,
}

impl PersistWriter {
    /// Create the session directory eagerly so a bad `persist_root` surfaces
    /// in the log at start rather than per-segment.
    pub fn new(root: &Path, session_id: &str) -> std::io::Result<Self> {
        let dir = root.join(session_id);
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "debug persistence enabled");
        Ok(Self { dir })
    }

    fn write_segment(&self, seq: u64, segment: &Segment) -> anyhow::Result<()> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let path = self.dir.join(format!("seg_{seq:05}.wav"));
        let mut writer = hound::WavWriter::create(&path, spec)?;
        for pair in segment.pcm.chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        writer.finalize()?;
        Ok(())
    }

    fn append_final(&self, text: &str) -> anyhow::Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("finals.log"))?;
        writeln!(file, "{}\t{}", chrono::Utc::now().to_rfc3339(), text)?;
        Ok(())
    }
}

/// Persistence task: drains artifacts until the channel closes.
pub(crate) async fn run_persist(writer: PersistWriter, mut rx: mpsc::Receiver<PersistItem>) {
    while let Some(item) = rx.recv().await {
        let result = match &item {
            PersistItem::Segment { seq, segment } => writer.write_segment(*seq, segment),
            PersistItem::Final { text } => writer.append_final(text),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to write debug artifact");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(samples: &[i16]) -> Segment {
        Segment {
            pcm: samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            t0: 0.0,
            duration: samples.len() as f64 / SAMPLE_RATE as f64,
            mean_rms: 0.1,
        }
    }

    #[test]
    fn segment_wav_round_trips() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let writer = PersistWriter::new(tmp.path(), "sess-1").expect("writer");
        let samples: Vec<i16> = (0..160).map(|i| (i * 100) as i16).collect();
        writer.write_segment(7, &segment(&samples)).expect("write");

        let path = tmp.path().join("sess-1/seg_00007.wav");
        let mut reader = hound::WavReader::open(path).expect("open wav");
        assert_eq!(reader.spec().sample_rate, SAMPLE_RATE);
        assert_eq!(reader.spec().channels, 1);
        let read: Vec<i16> = reader.samples::<i16>().map(|s| s.expect("sample")).collect();
        assert_eq!(read, samples);
    }

    #[test]
    fn finals_are_appended_line_per_sentence() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let writer = PersistWriter::new(tmp.path(), "sess-2").expect("writer");
        writer.append_final("first sentence.").expect("append");
        writer.append_final("second sentence.").expect("append");

        let log = std::fs::read_to_string(tmp.path().join("sess-2/finals.log")).expect("read log");
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("first sentence."));
        assert!(lines[1].ends_with("second sentence."));
    }
}
