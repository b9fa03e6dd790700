//! Runtime session record and rolling pipeline counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::SessionConfig;

/// Rolling per-session counters. Written by pipeline tasks, read under a
/// snapshot copy from `status()`.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub chunks_in: AtomicU64,
    pub segments_emitted: AtomicU64,
    pub successful_transcriptions: AtomicU64,
    pub failed_transcriptions: AtomicU64,
    pub dropped_frames: AtomicU64,
    pub media_restarts: AtomicU64,
    pub chat_events: AtomicU64,
    pub chat_reconnects: AtomicU64,
    pub unknown_chat_frames: AtomicU64,
    /// Sum of per-segment confidence, scaled by 1000, over successful calls.
    confidence_milli_sum: AtomicU64,
}

impl SessionStats {
    pub fn record_confidence(&self, confidence: f32) {
        let milli = (confidence.clamp(0.0, 1.0) * 1000.0) as u64;
        self.confidence_milli_sum.fetch_add(milli, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let successes = self.successful_transcriptions.load(Ordering::Relaxed);
        let avg_confidence = if successes == 0 {
            0.0
        } else {
            self.confidence_milli_sum.load(Ordering::Relaxed) as f64 / 1000.0 / successes as f64
        };
        StatsSnapshot {
            chunks_in: self.chunks_in.load(Ordering::Relaxed),
            segments_emitted: self.segments_emitted.load(Ordering::Relaxed),
            successful_transcriptions: successes,
            failed_transcriptions: self.failed_transcriptions.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            media_restarts: self.media_restarts.load(Ordering::Relaxed),
            chat_events: self.chat_events.load(Ordering::Relaxed),
            chat_reconnects: self.chat_reconnects.load(Ordering::Relaxed),
            unknown_chat_frames: self.unknown_chat_frames.load(Ordering::Relaxed),
            avg_confidence,
        }
    }
}

/// Point-in-time copy of [`SessionStats`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub chunks_in: u64,
    pub segments_emitted: u64,
    pub successful_transcriptions: u64,
    pub failed_transcriptions: u64,
    pub dropped_frames: u64,
    pub media_restarts: u64,
    pub chat_events: u64,
    pub chat_reconnects: u64,
    pub unknown_chat_frames: u64,
    pub avg_confidence: f64,
}

/// Mutable runtime state for the one active session. Owned exclusively by the
/// supervisor; everything observable goes through [`Session::snapshot`].
pub struct Session {
    pub config: SessionConfig,
    pub room_id: String,
    pub media_url: String,
    pub anchor_name: String,
    pub started_at: DateTime<Utc>,
    pub stats: Arc<SessionStats>,
    last_error: Mutex<Option<String>>,
}

impl Session {
    pub fn new(config: SessionConfig, room_id: String, media_url: String, anchor_name: String) -> Self {
        Self {
            config,
            room_id,
            media_url,
            anchor_name,
            started_at: Utc::now(),
            stats: Arc::new(SessionStats::default()),
            last_error: Mutex::new(None),
        }
    }

    pub fn set_last_error(&self, message: impl Into<String>) {
        *self.last_error.lock() = Some(message.into());
    }

    pub fn snapshot(&self, is_running: bool, lifecycle: &str) -> SessionSnapshot {
        SessionSnapshot {
            is_running,
            lifecycle: lifecycle.to_string(),
            session_id: Some(self.config.session_id.clone()),
            room_id: Some(self.room_id.clone()),
            anchor_name: Some(self.anchor_name.clone()),
            profile: Some(self.config.profile.as_str().to_string()),
            started_at: Some(self.started_at),
            stats: self.stats.snapshot(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

/// Status view returned to HTTP callers. Safe to produce concurrently with
/// start/stop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub is_running: bool,
    pub lifecycle: String,
    pub session_id: Option<String>,
    pub room_id: Option<String>,
    pub anchor_name: Option<String>,
    pub profile: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stats: StatsSnapshot,
    pub last_error: Option<String>,
}

impl SessionSnapshot {
    pub fn idle(lifecycle: &str) -> Self {
        Self {
            is_running: false,
            lifecycle: lifecycle.to_string(),
            session_id: None,
            room_id: None,
            anchor_name: None,
            profile: None,
            started_at: None,
            stats: StatsSnapshot::default(),
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_confidence_over_successes_only() {
        let stats = SessionStats::default();
        assert_eq!(stats.snapshot().avg_confidence, 0.0);

        stats.successful_transcriptions.fetch_add(2, Ordering::Relaxed);
        stats.record_confidence(0.8);
        stats.record_confidence(0.6);
        stats.failed_transcriptions.fetch_add(1, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert!((snap.avg_confidence - 0.7).abs() < 1e-3);
        assert_eq!(snap.failed_transcriptions, 1);
    }
}
