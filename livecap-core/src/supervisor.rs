//! `PipelineSupervisor` — top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start()──► Starting ──► Running ──stop()──► Stopping ──► Idle
//!                      │                     ▲
//!                      └── resolve/open err ─┘ (fatal media error auto-stops)
//! ```
//!
//! At most one session exists at any time. `start()` rejects re-entry until
//! the machine is back at `Idle`; `stop()` is idempotent. A fatal runtime
//! error (media stream lost) emits `{type: error, fatal: true}` and drives
//! the same stop path automatically.
//!
//! The supervisor owns every capability and both broadcasters. No component
//! it spawns may start or stop another component.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::assemble::{run_assembler, SentenceAssembler};
use crate::broadcast::{Broadcaster, Subscription};
use crate::chat::run_chat_relay;
use crate::chunker::{run_chunker, AudioFrame, Chunker, FRAME_QUEUE};
use crate::config::{SessionConfig, SessionOverrides};
use crate::error::{LivecapError, Result};
use crate::events::{AudioEvent, ChatEvent};
use crate::media::{run_reader, MediaSource, BYTES_QUEUE};
use crate::persist::{run_persist, PersistWriter, PERSIST_QUEUE};
use crate::recognize::worker::run_workers;
use crate::recognize::RecognizerHandle;
use crate::resolve::RoomResolver;
use crate::session::{Session, SessionSnapshot};
use crate::vad::{run_gate, Segment, VadGate, SEGMENT_QUEUE};

/// How long `stop()` waits for pipeline tasks to drain before aborting them.
const STOP_DRAIN_BUDGET: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Starting,
    Running,
    Stopping,
}

impl Lifecycle {
    fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Starting => "starting",
            Lifecycle::Running => "running",
            Lifecycle::Stopping => "stopping",
        }
    }
}

/// Start parameters: the room reference plus optional overrides.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub room_ref: String,
    pub overrides: SessionOverrides,
}

/// Returned by a successful `start()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartInfo {
    pub session_id: String,
    pub room_id: String,
    pub started_at: DateTime<Utc>,
}

/// Chat-relay status for the standalone control surface.
#[derive(Debug, Clone, Serialize)]
pub struct ChatStatusSnapshot {
    pub is_running: bool,
    pub live_id: Option<String>,
    pub room_id: Option<String>,
    pub last_error: Option<String>,
}

struct ActiveSession {
    session: Arc<Session>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

struct ChatRelaySlot {
    live_id: String,
    room_id: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    /// True when the slot belongs to the audio session (shares its token).
    session_owned: bool,
}

pub struct PipelineSupervisor {
    resolver: Arc<dyn RoomResolver>,
    media: Arc<dyn MediaSource>,
    recognizer: RecognizerHandle,
    worker_count: usize,
    audio_events: Arc<Broadcaster<AudioEvent>>,
    chat_events: Arc<Broadcaster<ChatEvent>>,
    lifecycle: Mutex<Lifecycle>,
    active: Mutex<Option<ActiveSession>>,
    /// Snapshot of the most recently stopped session, kept so `status()`
    /// still reports its stats and last error after auto-stop.
    last_session: Mutex<Option<SessionSnapshot>>,
    chat_slot: Mutex<Option<ChatRelaySlot>>,
    chat_last_error: Mutex<Option<String>>,
}

impl PipelineSupervisor {
    pub fn new(
        resolver: Arc<dyn RoomResolver>,
        media: Arc<dyn MediaSource>,
        recognizer: RecognizerHandle,
        worker_count: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            resolver,
            media,
            recognizer,
            worker_count: worker_count.max(1),
            audio_events: Arc::new(Broadcaster::new()),
            chat_events: Arc::new(Broadcaster::new()),
            lifecycle: Mutex::new(Lifecycle::Idle),
            active: Mutex::new(None),
            last_session: Mutex::new(None),
            chat_slot: Mutex::new(None),
            chat_last_error: Mutex::new(None),
        })
    }

    /// Start the full pipeline for one room.
    ///
    /// # Errors
    /// - `ConfigInvalid` for out-of-range parameters.
    /// - `AlreadyRunning` when a session exists (any non-idle state).
    /// - `ResolveFailed` / `MediaOpenFailed` from the respective capability;
    ///   the machine returns to `Idle` and no session is created.
    pub async fn start(self: &Arc<Self>, req: StartRequest) -> Result<StartInfo> {
        let config = SessionConfig::build(&req.room_ref, &req.overrides)?;

        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle != Lifecycle::Idle {
                return Err(LivecapError::AlreadyRunning);
            }
            *lifecycle = Lifecycle::Starting;
        }

        let resolved = match self.resolver.resolve(&config.room_ref).await {
            Ok(room) => room,
            Err(e) => {
                *self.lifecycle.lock() = Lifecycle::Idle;
                return Err(e);
            }
        };
        let media_stream = match self.media.open(&resolved.media_url).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.lifecycle.lock() = Lifecycle::Idle;
                return Err(e);
            }
        };

        // Lingering subscribers belong to a previous session's stream.
        self.audio_events
            .close_all(Some(AudioEvent::status("session_changed", None)));

        // The session claims the chat slot; a standalone relay yields.
        self.release_chat_slot(true).await;

        let session = Arc::new(Session::new(
            config.clone(),
            resolved.room_id.clone(),
            resolved.media_url.clone(),
            resolved.anchor_name.clone(),
        ));
        let stats = Arc::clone(&session.stats);
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        let persist_tx = if config.persist_enabled {
            match PersistWriter::new(
                config.persist_root.as_deref().unwrap_or(std::path::Path::new(".")),
                &config.session_id,
            ) {
                Ok(writer) => {
                    let (tx, rx) = mpsc::channel(PERSIST_QUEUE);
                    tasks.push(tokio::spawn(run_persist(writer, rx)));
                    Some(tx)
                }
                Err(e) => {
                    warn!(error = %e, "persistence disabled: cannot create artifact directory");
                    None
                }
            }
        } else {
            None
        };

        let (fatal_tx, mut fatal_rx) = mpsc::channel(4);
        let (bytes_tx, bytes_rx) = mpsc::channel::<Vec<u8>>(BYTES_QUEUE);
        let (frame_tx, frame_rx) = mpsc::channel::<AudioFrame>(FRAME_QUEUE);
        let (seg_tx, seg_rx) = mpsc::channel::<(u64, Segment)>(SEGMENT_QUEUE);
        let (rec_tx, rec_rx) = mpsc::channel(16);

        tasks.push(tokio::spawn(run_reader(
            Arc::clone(&self.media),
            resolved.media_url.clone(),
            config.profile,
            media_stream,
            bytes_tx,
            Arc::clone(&stats),
            cancel.clone(),
            fatal_tx,
        )));
        tasks.push(tokio::spawn(run_chunker(
            bytes_rx,
            Chunker::new(config.frame_bytes(), config.chunk_seconds),
            frame_tx,
            Arc::clone(&self.audio_events),
            Arc::clone(&stats),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_gate(
            frame_rx,
            VadGate::new(config.vad),
            seg_tx,
            persist_tx.clone(),
            Arc::clone(&stats),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_workers(
            self.worker_count,
            self.recognizer.clone(),
            seg_rx,
            rec_tx,
            Arc::clone(&stats),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_assembler(
            rec_rx,
            SentenceAssembler::new(config.assembler, config.session_id.clone()),
            Arc::clone(&self.audio_events),
            persist_tx,
            cancel.clone(),
        )));

        let relay_task = tokio::spawn(run_chat_relay(
            resolved.clone(),
            Arc::clone(&self.chat_events),
            Arc::clone(&stats),
            cancel.clone(),
        ));
        *self.chat_slot.lock() = Some(ChatRelaySlot {
            live_id: config.room_ref.clone(),
            room_id: resolved.room_id.clone(),
            cancel: cancel.clone(),
            task: relay_task,
            session_owned: true,
        });

        let info = StartInfo {
            session_id: config.session_id.clone(),
            room_id: resolved.room_id.clone(),
            started_at: session.started_at,
        };

        let watcher_session = Arc::clone(&session);
        *self.active.lock() = Some(ActiveSession {
            session,
            cancel: cancel.clone(),
            tasks,
        });
        *self.lifecycle.lock() = Lifecycle::Running;

        // Fatal-error watcher: a terminal media fault auto-stops the session.
        // Spawned only after the transition to Running so its stop() call can
        // never race a half-registered session; a fault raised earlier waits
        // in the channel.
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                fault = fatal_rx.recv() => {
                    if fault.is_some() {
                        watcher_session.set_last_error("media_closed");
                        if let Some(supervisor) = weak.upgrade() {
                            supervisor
                                .audio_events
                                .publish(AudioEvent::error("media_closed", true));
                            let _ = supervisor.stop().await;
                        }
                    }
                }
            }
        });
        info!(
            session_id = %info.session_id,
            room_id = %info.room_id,
            profile = config.profile.as_str(),
            "session started"
        );
        Ok(info)
    }

    /// Stop the pipeline. Idempotent: returns `Ok(())` when nothing runs.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            match *lifecycle {
                Lifecycle::Running => *lifecycle = Lifecycle::Stopping,
                // Idle: nothing to do. Starting/Stopping: another caller owns
                // the transition.
                _ => return Ok(()),
            }
        }

        let active = self.active.lock().take();
        let chat = self.chat_slot.lock().take();

        if let Some(active) = active {
            let session_id = active.session.config.session_id.clone();
            info!(session_id = %session_id, "stopping session");
            active.cancel.cancel();
            *self.last_session.lock() = Some(active.session.snapshot(false, "idle"));

            self.audio_events
                .close_all(Some(AudioEvent::status("stopped", Some(session_id))));
            self.chat_events
                .close_all(Some(ChatEvent::status("stopped", None)));

            let deadline = tokio::time::Instant::now() + STOP_DRAIN_BUDGET;
            for mut task in active.tasks {
                if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                    warn!("pipeline task exceeded drain budget; aborting");
                    task.abort();
                }
            }
        }
        if let Some(chat) = chat {
            chat.cancel.cancel();
            let mut task = chat.task;
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }

        *self.lifecycle.lock() = Lifecycle::Idle;
        info!("session stopped");
        Ok(())
    }

    /// Current session snapshot. Safe to call concurrently with start/stop.
    pub fn status(&self) -> SessionSnapshot {
        let lifecycle = *self.lifecycle.lock();
        let active = self.active.lock();
        match &*active {
            Some(active) => active
                .session
                .snapshot(lifecycle == Lifecycle::Running, lifecycle.as_str()),
            None => self
                .last_session
                .lock()
                .clone()
                .unwrap_or_else(|| SessionSnapshot::idle(lifecycle.as_str())),
        }
    }

    /// Subscribe to transcript / level / status frames. Also returns the
    /// current session id, when one is running.
    pub fn subscribe_transcript(&self) -> Result<(Subscription<AudioEvent>, Option<String>)> {
        let subscription = self.audio_events.subscribe()?;
        let session_id = self
            .active
            .lock()
            .as_ref()
            .map(|a| a.session.config.session_id.clone());
        Ok((subscription, session_id))
    }

    /// Subscribe to normalized chat events.
    pub fn subscribe_chat(&self) -> Result<Subscription<ChatEvent>> {
        self.chat_events.subscribe()
    }

    // ── Standalone chat relay (chat without an audio session) ────────────

    /// Start the chat relay alone for `live_id`.
    ///
    /// # Errors
    /// `AlreadyRunning` when any relay (session-owned or standalone) is up;
    /// `ResolveFailed` when the room cannot be resolved.
    pub async fn start_chat(self: &Arc<Self>, live_id: &str) -> Result<ChatStatusSnapshot> {
        {
            let mut slot = self.chat_slot.lock();
            if let Some(existing) = &*slot {
                if !existing.task.is_finished() {
                    return Err(LivecapError::AlreadyRunning);
                }
                *slot = None;
            }
        }

        let resolved = match self.resolver.resolve(live_id).await {
            Ok(room) => room,
            Err(e) => {
                *self.chat_last_error.lock() = Some(e.to_string());
                return Err(e);
            }
        };
        *self.chat_last_error.lock() = None;

        let cancel = CancellationToken::new();
        let stats = Arc::new(crate::session::SessionStats::default());
        let task = tokio::spawn(run_chat_relay(
            resolved.clone(),
            Arc::clone(&self.chat_events),
            stats,
            cancel.clone(),
        ));

        let mut slot = self.chat_slot.lock();
        *slot = Some(ChatRelaySlot {
            live_id: live_id.to_string(),
            room_id: resolved.room_id.clone(),
            cancel,
            task,
            session_owned: false,
        });
        info!(live_id, room_id = %resolved.room_id, "standalone chat relay started");
        Ok(ChatStatusSnapshot {
            is_running: true,
            live_id: Some(live_id.to_string()),
            room_id: Some(resolved.room_id),
            last_error: None,
        })
    }

    /// Stop the standalone relay. Idempotent; a session-owned relay is left
    /// to its session.
    pub async fn stop_chat(&self) {
        self.release_chat_slot(false).await;
    }

    pub fn chat_status(&self) -> ChatStatusSnapshot {
        let slot = self.chat_slot.lock();
        match &*slot {
            Some(slot) => ChatStatusSnapshot {
                is_running: !slot.task.is_finished(),
                live_id: Some(slot.live_id.clone()),
                room_id: Some(slot.room_id.clone()),
                last_error: self.chat_last_error.lock().clone(),
            },
            None => ChatStatusSnapshot {
                is_running: false,
                live_id: None,
                room_id: None,
                last_error: self.chat_last_error.lock().clone(),
            },
        }
    }

    /// Tear down the current chat slot. With `include_session_owned` the
    /// session's relay is released too (used when a new session claims it).
    async fn release_chat_slot(&self, include_session_owned: bool) {
        let slot = {
            let mut guard = self.chat_slot.lock();
            match &*guard {
                Some(slot) if include_session_owned || !slot.session_owned => guard.take(),
                _ => None,
            }
        };
        if let Some(slot) = slot {
            slot.cancel.cancel();
            let mut task = slot.task;
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}
