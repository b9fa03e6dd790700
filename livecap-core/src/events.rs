//! Event types fanned out to subscribers.
//!
//! ## WS envelope (audio stream)
//!
//! | Event | `type` field |
//! |-------|--------------|
//! | `TranscriptEvent` (final) | `"transcription"` |
//! | `TranscriptEvent` (delta) | `"transcription_delta"` |
//! | `LevelEvent` | `"level"` |
//! | `StatusFrame` | `"status"` |
//! | `ErrorFrame` | `"error"` |
//!
//! The chat stream carries `{type, payload, timestamp}` objects, one per
//! [`ChatEvent`].

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::json;

// ---------------------------------------------------------------------------
// Transcript events
// ---------------------------------------------------------------------------

/// Distinguishes streaming snapshots from committed sentences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptKind {
    /// Snapshot of the current pending text — may change on the next event.
    Delta,
    /// Committed sentence — will not change.
    Final,
}

/// One transcription output, delta or final.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptEvent {
    pub kind: TranscriptKind,
    pub text: String,
    /// Mean recognizer confidence over contributing segments, in [0.0, 1.0].
    pub confidence: f32,
    /// Stream time (seconds since session start) of the first contributing segment.
    pub seg_start: f64,
    /// Stream time of the end of the last contributing segment.
    pub seg_end: f64,
    pub session_id: String,
}

/// UI audio-meter tick, emitted at most 10 Hz. Lossy by design.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelEvent {
    pub rms: f32,
    pub peak: f32,
    /// Stream time in seconds.
    pub t: f64,
}

/// Lifecycle notice on the audio stream (`stopped`, `session_changed`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusFrame {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Error notice on the audio stream. `fatal: true` means the session is
/// stopping.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    pub reason: String,
    pub fatal: bool,
}

/// Everything the audio-side broadcaster carries.
#[derive(Debug, Clone)]
pub enum AudioEvent {
    Transcript(TranscriptEvent),
    Level(LevelEvent),
    Status(StatusFrame),
    Error(ErrorFrame),
}

impl AudioEvent {
    pub fn status(stage: &str, session_id: Option<String>) -> Self {
        AudioEvent::Status(StatusFrame {
            stage: stage.to_string(),
            session_id,
        })
    }

    pub fn error(reason: &str, fatal: bool) -> Self {
        AudioEvent::Error(ErrorFrame {
            reason: reason.to_string(),
            fatal,
        })
    }

    /// WS wire form: `{type, data}`.
    pub fn envelope(&self) -> serde_json::Value {
        match self {
            AudioEvent::Transcript(ev) => {
                let t = match ev.kind {
                    TranscriptKind::Final => "transcription",
                    TranscriptKind::Delta => "transcription_delta",
                };
                json!({ "type": t, "data": ev })
            }
            AudioEvent::Level(ev) => json!({ "type": "level", "data": ev }),
            AudioEvent::Status(ev) => json!({ "type": "status", "data": ev }),
            AudioEvent::Error(ev) => json!({ "type": "error", "data": ev }),
        }
    }
}

// ---------------------------------------------------------------------------
// Chat events
// ---------------------------------------------------------------------------

/// One entry of a room contribution ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankEntry {
    pub user: String,
    pub rank: u32,
}

/// Typed payload per chat-channel event type. Unrecognized frames land in
/// `Other` with their raw bytes base64-encoded, so a protocol addition never
/// breaks the connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChatPayload {
    Chat { user: String, content: String },
    Gift { user: String, gift_name: String, count: u64 },
    Like { user: String, count: u64 },
    Member { user: String },
    Follow { user: String },
    Fansclub { user: String, content: String },
    EmojiChat { user: String, emoji: String },
    RoomInfo { title: String, anchor: String },
    RoomStats { display: String },
    RoomUserStats { total: u64 },
    RoomRank { ranks: Vec<RankEntry> },
    RoomControl { status: i64, message: String },
    StreamAdaptation { level: i64 },
    Status {
        stage: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        attempt: Option<u32>,
    },
    Error { reason: String },
    Other { raw: String },
}

/// Normalized room event as delivered to chat subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    #[serde(flatten)]
    pub payload: ChatPayload,
    /// Unix epoch milliseconds at parse time.
    pub timestamp: i64,
}

impl ChatEvent {
    pub fn new(payload: ChatPayload) -> Self {
        Self {
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn status(stage: &str, attempt: Option<u32>) -> Self {
        Self::new(ChatPayload::Status {
            stage: stage.to_string(),
            attempt,
        })
    }

    pub fn error(reason: &str) -> Self {
        Self::new(ChatPayload::Error {
            reason: reason.to_string(),
        })
    }

    pub fn other(raw: &[u8]) -> Self {
        Self::new(ChatPayload::Other {
            raw: BASE64.encode(raw),
        })
    }
}
