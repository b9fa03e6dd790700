//! Media pulling — resolved stream URL → continuous PCM byte stream.
//!
//! [`MediaSource`] is a capability seam: the production implementation
//! ([`FfmpegSource`]) spawns an external transcoder, but anything that can
//! produce PCM s16le mono 16 kHz bytes plugs in (tests use an in-memory
//! source).
//!
//! ## Termination
//!
//! [`MediaHandle::cancel`] is idempotent. On unix the child first receives
//! SIGTERM; if it has not exited after 2 s it is force-killed. Elsewhere it
//! is killed outright.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Profile;
use crate::error::{LivecapError, Result};
use crate::session::SessionStats;

/// Reads returning nothing for this long count as a stall.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Grace period between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

const READ_BUF_BYTES: usize = 4096;

/// Queue bound between the reader task and the chunker.
pub const BYTES_QUEUE: usize = 16;

/// An open PCM stream plus its termination handle.
pub struct MediaStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: MediaHandle,
}

/// Capability that turns a resolved media URL into a PCM stream.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Spawn / open the stream.
    ///
    /// # Errors
    /// `LivecapError::MediaOpenFailed` when the transcoder cannot start.
    async fn open(&self, media_url: &str) -> Result<MediaStream>;
}

/// Idempotent terminate handle for the transcoder process.
#[derive(Clone)]
pub struct MediaHandle {
    child: Arc<Mutex<Option<Child>>>,
}

impl MediaHandle {
    fn from_child(child: Child) -> Self {
        Self {
            child: Arc::new(Mutex::new(Some(child))),
        }
    }

    /// Handle for sources with no process behind them.
    pub fn detached() -> Self {
        Self {
            child: Arc::new(Mutex::new(None)),
        }
    }

    /// Terminate the transcoder. Safe to call any number of times.
    #[allow(unsafe_code)]
    pub fn cancel(&self) {
        let Some(mut child) = self.child.lock().take() else {
            return;
        };
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            // Graceful first; the 2 s escalation happens below.
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
        tokio::spawn(async move {
            match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "transcoder exited"),
                Ok(Err(e)) => warn!(error = %e, "transcoder wait failed"),
                Err(_) => {
                    warn!("transcoder ignored termination; force-killing");
                    if let Err(e) = child.kill().await {
                        error!(error = %e, "failed to kill transcoder");
                    }
                }
            }
        });
    }
}

/// External-transcoder media source.
pub struct FfmpegSource {
    ffmpeg: String,
}

impl FfmpegSource {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
        }
    }

    fn command(&self, media_url: &str) -> Command {
        let mut cmd = Command::new(&self.ffmpeg);
        cmd.args([
            "-hide_banner",
            "-loglevel",
            "error",
            "-nostdin",
            // Low-latency input handling: minimal probing, no demux buffering.
            "-probesize",
            "32768",
            "-analyzeduration",
            "0",
            "-fflags",
            "nobuffer",
            "-flags",
            "low_delay",
            "-i",
            media_url,
            "-vn",
            "-sn",
            "-ac",
            "1",
            "-ar",
            "16000",
            "-acodec",
            "pcm_s16le",
            "-f",
            "s16le",
            "pipe:1",
        ]);
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl MediaSource for FfmpegSource {
    async fn open(&self, media_url: &str) -> Result<MediaStream> {
        let mut child = self
            .command(media_url)
            .spawn()
            .map_err(|e| LivecapError::MediaOpenFailed(format!("{}: {e}", self.ffmpeg)))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LivecapError::MediaOpenFailed("transcoder stdout not captured".into()))?;
        info!(url = media_url, "transcoder started");
        Ok(MediaStream {
            reader: Box::new(stdout),
            handle: MediaHandle::from_child(child),
        })
    }
}

/// Why the reader task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum MediaFault {
    /// Stream closed or errored — terminal for the audio path.
    Closed,
}

/// Reader task: pulls bytes off the transcoder stdout and feeds the chunker.
///
/// Stall policy (spec of the audio path): no bytes for [`STALL_TIMEOUT`]
/// forces a transcoder restart under the `stable` profile and is terminal
/// under `fast`. Terminal conditions are reported through `fatal_tx`.
pub(crate) async fn run_reader(
    source: Arc<dyn MediaSource>,
    media_url: String,
    profile: Profile,
    first: MediaStream,
    bytes_tx: mpsc::Sender<Vec<u8>>,
    stats: Arc<SessionStats>,
    cancel: CancellationToken,
    fatal_tx: mpsc::Sender<MediaFault>,
) {
    let mut stream = first;
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => {
                stream.handle.cancel();
                return;
            }
            read = tokio::time::timeout(STALL_TIMEOUT, stream.reader.read(&mut buf)) => read,
        };
        match read {
            Ok(Ok(0)) | Ok(Err(_)) => {
                if let Ok(Err(e)) = read {
                    warn!(error = %e, "media read failed");
                } else {
                    warn!("media stream reached EOF");
                }
                stream.handle.cancel();
                let _ = fatal_tx.send(MediaFault::Closed).await;
                return;
            }
            Ok(Ok(n)) => {
                let chunk = buf[..n].to_vec();
                tokio::select! {
                    _ = cancel.cancelled() => {
                        stream.handle.cancel();
                        return;
                    }
                    sent = bytes_tx.send(chunk) => {
                        if sent.is_err() {
                            stream.handle.cancel();
                            return;
                        }
                    }
                }
            }
            Err(_) => {
                // Stall: process alive but silent for STALL_TIMEOUT.
                if profile == Profile::Stable {
                    warn!("media stalled; restarting transcoder");
                    stream.handle.cancel();
                    match source.open(&media_url).await {
                        Ok(next) => {
                            stats.media_restarts.fetch_add(1, Ordering::Relaxed);
                            stream = next;
                        }
                        Err(e) => {
                            error!(error = %e, "transcoder restart failed");
                            let _ = fatal_tx.send(MediaFault::Closed).await;
                            return;
                        }
                    }
                } else {
                    warn!("media stalled under fast profile; treating as terminal");
                    stream.handle.cancel();
                    let _ = fatal_tx.send(MediaFault::Closed).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Emits a fixed byte script, then EOF.
    struct ScriptReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for ScriptReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let remaining = self.data.len() - self.pos;
            if remaining == 0 {
                return Poll::Ready(Ok(()));
            }
            let n = remaining.min(buf.remaining()).min(1024);
            let start = self.pos;
            buf.put_slice(&self.data[start..start + n]);
            self.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn eof_reports_media_closed() {
        let source: Arc<dyn MediaSource> = Arc::new(NeverOpenSource);
        let (bytes_tx, mut bytes_rx) = mpsc::channel(16);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let stats = Arc::new(SessionStats::default());
        let stream = MediaStream {
            reader: Box::new(ScriptReader {
                data: vec![7u8; 3000],
                pos: 0,
            }),
            handle: MediaHandle::detached(),
        };

        let task = tokio::spawn(run_reader(
            source,
            "http://example/stream".into(),
            Profile::Fast,
            stream,
            bytes_tx,
            stats,
            CancellationToken::new(),
            fatal_tx,
        ));

        let mut total = 0;
        while let Some(chunk) = bytes_rx.recv().await {
            total += chunk.len();
        }
        assert_eq!(total, 3000);
        assert_eq!(fatal_rx.recv().await, Some(MediaFault::Closed));
        task.await.expect("reader join");
    }

    struct NeverOpenSource;

    #[async_trait]
    impl MediaSource for NeverOpenSource {
        async fn open(&self, _media_url: &str) -> Result<MediaStream> {
            Err(LivecapError::MediaOpenFailed("unavailable".into()))
        }
    }

    #[tokio::test]
    async fn cancel_is_idempotent_for_detached_handles() {
        let handle = MediaHandle::detached();
        handle.cancel();
        handle.cancel();
    }

    #[tokio::test]
    async fn cancellation_stops_reader_without_fault() {
        /// Pends forever, simulating a silent but healthy stream.
        struct PendingReader;
        impl AsyncRead for PendingReader {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Pending
            }
        }

        let (bytes_tx, _bytes_rx) = mpsc::channel(16);
        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let stream = MediaStream {
            reader: Box::new(PendingReader),
            handle: MediaHandle::detached(),
        };

        let task = tokio::spawn(run_reader(
            Arc::new(NeverOpenSource),
            "http://example/stream".into(),
            Profile::Fast,
            stream,
            bytes_tx,
            Arc::new(SessionStats::default()),
            cancel.clone(),
            fatal_tx,
        ));

        cancel.cancel();
        task.await.expect("reader join");
        assert!(fatal_rx.try_recv().is_err());
    }
}
