//! Immutable session configuration.
//!
//! A [`SessionConfig`] is assembled once at `start()` from the room reference
//! plus optional per-request overrides, validated, and never mutated for the
//! lifetime of the session. Profile selection (`fast` / `stable`) fills in
//! VAD and chunking defaults; explicit overrides always win over the profile.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LivecapError, Result};

/// Canonical audio format: PCM s16le, mono, 16 kHz.
pub const SAMPLE_RATE: u32 = 16_000;
pub const BYTES_PER_SAMPLE: usize = 2;

/// Named bundle of VAD / chunking defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Prioritizes latency: short silences close a segment quickly.
    Fast,
    /// Prioritizes correctness: longer confirmation windows.
    Stable,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Fast => "fast",
            Profile::Stable => "stable",
        }
    }

    fn default_chunk_seconds(self) -> f64 {
        match self {
            Profile::Fast => 0.2,
            Profile::Stable => 0.5,
        }
    }

    fn vad_defaults(self) -> VadParams {
        match self {
            Profile::Fast => VadParams {
                min_silence_sec: 0.3,
                min_speech_sec: 0.2,
                hangover_sec: 0.1,
                min_rms: 0.012,
            },
            Profile::Stable => VadParams {
                min_silence_sec: 1.2,
                min_speech_sec: 1.0,
                hangover_sec: 0.30,
                min_rms: 0.020,
            },
        }
    }
}

/// Voice-activity thresholds. All durations in seconds, RMS normalized to
/// [0.0, 1.0].
#[derive(Debug, Clone, Copy)]
pub struct VadParams {
    pub min_silence_sec: f64,
    pub min_speech_sec: f64,
    pub hangover_sec: f64,
    pub min_rms: f64,
}

/// Sentence assembler knobs.
#[derive(Debug, Clone, Copy)]
pub struct AssemblerParams {
    /// Maximum time pending text is held before a forced final.
    pub max_wait: Duration,
    /// Hard cap on pending text length (chars) before a forced final.
    pub max_chars: usize,
    /// Silence after the last segment that triggers a final, provided the
    /// pending text is at least `min_sentence_chars` long.
    pub silence_flush: Duration,
    pub min_sentence_chars: usize,
}

impl Default for AssemblerParams {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(4),
            max_chars: 120,
            silence_flush: Duration::from_millis(800),
            min_sentence_chars: 6,
        }
    }
}

/// Optional per-request overrides, deserialized straight from the
/// `/api/live_audio/start` body. Field names match the HTTP contract.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionOverrides {
    pub session_id: Option<String>,
    pub chunk_duration: Option<f64>,
    pub profile: Option<Profile>,
    pub vad_min_silence_sec: Option<f64>,
    pub vad_min_speech_sec: Option<f64>,
    pub vad_hangover_sec: Option<f64>,
    pub vad_rms: Option<f64>,
    pub max_wait: Option<f64>,
    pub max_chars: Option<usize>,
    pub silence_flush: Option<f64>,
    pub min_sentence_chars: Option<usize>,
    pub persist_enabled: Option<bool>,
    pub persist_root: Option<PathBuf>,
}

/// Immutable run parameters for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Room URL or short ID, as supplied by the operator.
    pub room_ref: String,
    pub session_id: String,
    /// Audio frame length in seconds, within [0.2, 2.0].
    pub chunk_seconds: f64,
    pub profile: Profile,
    pub vad: VadParams,
    pub assembler: AssemblerParams,
    pub persist_enabled: bool,
    pub persist_root: Option<PathBuf>,
}

impl SessionConfig {
    /// Build a validated config from a room reference and overrides.
    ///
    /// # Errors
    /// `LivecapError::ConfigInvalid` when any field is out of range.
    pub fn build(room_ref: &str, ov: &SessionOverrides) -> Result<Self> {
        let room_ref = room_ref.trim();
        if room_ref.is_empty() {
            return Err(LivecapError::ConfigInvalid("live_url must not be empty".into()));
        }

        let profile = ov.profile.unwrap_or(Profile::Stable);
        let chunk_seconds = ov.chunk_duration.unwrap_or_else(|| profile.default_chunk_seconds());
        if !(0.2..=2.0).contains(&chunk_seconds) {
            return Err(LivecapError::ConfigInvalid(format!(
                "chunk_duration {chunk_seconds} outside [0.2, 2.0]"
            )));
        }

        let defaults = profile.vad_defaults();
        let vad = VadParams {
            min_silence_sec: ov.vad_min_silence_sec.unwrap_or(defaults.min_silence_sec),
            min_speech_sec: ov.vad_min_speech_sec.unwrap_or(defaults.min_speech_sec),
            hangover_sec: ov.vad_hangover_sec.unwrap_or(defaults.hangover_sec),
            min_rms: ov.vad_rms.unwrap_or(defaults.min_rms),
        };
        for (name, value) in [
            ("vad_min_silence_sec", vad.min_silence_sec),
            ("vad_min_speech_sec", vad.min_speech_sec),
            ("vad_hangover_sec", vad.hangover_sec),
        ] {
            if !(0.0..=30.0).contains(&value) {
                return Err(LivecapError::ConfigInvalid(format!(
                    "{name} {value} outside [0.0, 30.0]"
                )));
            }
        }
        if !(0.0..1.0).contains(&vad.min_rms) {
            return Err(LivecapError::ConfigInvalid(format!(
                "vad_rms {} outside [0.0, 1.0)",
                vad.min_rms
            )));
        }

        let asm_defaults = AssemblerParams::default();
        let max_wait = ov.max_wait.unwrap_or(asm_defaults.max_wait.as_secs_f64());
        let silence_flush = ov
            .silence_flush
            .unwrap_or(asm_defaults.silence_flush.as_secs_f64());
        if !(0.1..=120.0).contains(&max_wait) {
            return Err(LivecapError::ConfigInvalid(format!(
                "max_wait {max_wait} outside [0.1, 120.0]"
            )));
        }
        if !(0.0..=60.0).contains(&silence_flush) {
            return Err(LivecapError::ConfigInvalid(format!(
                "silence_flush {silence_flush} outside [0.0, 60.0]"
            )));
        }
        let assembler = AssemblerParams {
            max_wait: Duration::from_secs_f64(max_wait),
            max_chars: ov.max_chars.unwrap_or(asm_defaults.max_chars),
            silence_flush: Duration::from_secs_f64(silence_flush),
            min_sentence_chars: ov
                .min_sentence_chars
                .unwrap_or(asm_defaults.min_sentence_chars),
        };
        if assembler.max_chars == 0 {
            return Err(LivecapError::ConfigInvalid("max_chars must be positive".into()));
        }
        if assembler.min_sentence_chars > assembler.max_chars {
            return Err(LivecapError::ConfigInvalid(
                "min_sentence_chars must not exceed max_chars".into(),
            ));
        }

        let persist_enabled = ov.persist_enabled.unwrap_or(false);
        if persist_enabled && ov.persist_root.is_none() {
            return Err(LivecapError::ConfigInvalid(
                "persist_enabled requires persist_root".into(),
            ));
        }

        Ok(Self {
            room_ref: room_ref.to_string(),
            session_id: ov
                .session_id
                .clone()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            chunk_seconds,
            profile,
            vad,
            assembler,
            persist_enabled,
            persist_root: ov.persist_root.clone(),
        })
    }

    /// Size of one audio frame in bytes, rounded to a whole sample.
    pub fn frame_bytes(&self) -> usize {
        let samples = (self.chunk_seconds * SAMPLE_RATE as f64).round() as usize;
        samples.max(1) * BYTES_PER_SAMPLE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_follow_profile() {
        let cfg = SessionConfig::build("https://live.example.com/123", &SessionOverrides::default())
            .expect("valid config");
        assert_eq!(cfg.profile, Profile::Stable);
        assert!((cfg.chunk_seconds - 0.5).abs() < 1e-9);
        assert!((cfg.vad.min_silence_sec - 1.2).abs() < 1e-9);
        assert!((cfg.vad.min_rms - 0.020).abs() < 1e-9);
        assert!(!cfg.session_id.is_empty());
    }

    #[test]
    fn fast_profile_defaults() {
        let ov = SessionOverrides {
            profile: Some(Profile::Fast),
            ..Default::default()
        };
        let cfg = SessionConfig::build("12345", &ov).expect("valid config");
        assert!((cfg.chunk_seconds - 0.2).abs() < 1e-9);
        assert!((cfg.vad.min_speech_sec - 0.2).abs() < 1e-9);
        assert!((cfg.vad.hangover_sec - 0.1).abs() < 1e-9);
    }

    #[test]
    fn explicit_overrides_win_over_profile() {
        let ov = SessionOverrides {
            profile: Some(Profile::Fast),
            vad_rms: Some(0.05),
            chunk_duration: Some(1.0),
            ..Default::default()
        };
        let cfg = SessionConfig::build("12345", &ov).expect("valid config");
        assert!((cfg.vad.min_rms - 0.05).abs() < 1e-9);
        assert!((cfg.chunk_seconds - 1.0).abs() < 1e-9);
    }

    #[test]
    fn rejects_empty_room_ref() {
        let err = SessionConfig::build("   ", &SessionOverrides::default());
        assert!(matches!(err, Err(LivecapError::ConfigInvalid(_))));
    }

    #[test]
    fn rejects_chunk_duration_out_of_range() {
        for bad in [0.1, 2.5] {
            let ov = SessionOverrides {
                chunk_duration: Some(bad),
                ..Default::default()
            };
            let err = SessionConfig::build("12345", &ov);
            assert!(matches!(err, Err(LivecapError::ConfigInvalid(_))), "chunk {bad}");
        }
    }

    #[test]
    fn rejects_persist_without_root() {
        let ov = SessionOverrides {
            persist_enabled: Some(true),
            ..Default::default()
        };
        let err = SessionConfig::build("12345", &ov);
        assert!(matches!(err, Err(LivecapError::ConfigInvalid(_))));
    }

    #[test]
    fn frame_bytes_at_boundaries() {
        for (chunk, expected) in [(0.2, 6_400), (2.0, 64_000)] {
            let ov = SessionOverrides {
                chunk_duration: Some(chunk),
                ..Default::default()
            };
            let cfg = SessionConfig::build("12345", &ov).expect("valid config");
            assert_eq!(cfg.frame_bytes(), expected);
        }
    }
}
