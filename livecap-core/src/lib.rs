//! # livecap-core
//!
//! Real-time live-stream transcription engine.
//!
//! ## Architecture
//!
//! ```text
//! room ref → RoomResolver → media URL
//!                              │
//!                  MediaSource (external transcoder)
//!                              │  PCM s16le 16 kHz mono
//!                           Chunker ──► LevelEvent (≤10 Hz)
//!                              │  AudioFrame
//!                           VadGate
//!                              │  Segment (bounded queue, backpressure)
//!                      Recognizer workers ──► reorder by segment order
//!                              │
//!                      SentenceAssembler
//!                              │  delta / final
//!                  Broadcaster<AudioEvent> ──► subscribers
//!
//! room chat channel → ChatRelay → Broadcaster<ChatEvent> ──► subscribers
//! ```
//!
//! Both paths are owned by one [`PipelineSupervisor`]; there is no mutable
//! state outside it.

// `deny`, not `forbid`: MediaHandle::cancel sends SIGTERM through libc and
// carries a scoped allow.
#![deny(unsafe_code)]
#![warn(clippy::all)]

pub mod assemble;
pub mod broadcast;
pub mod chat;
pub mod chunker;
pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod persist;
pub mod recognize;
pub mod resolve;
pub mod session;
pub mod supervisor;
pub mod vad;

// Convenience re-exports for downstream crates
pub use config::{Profile, SessionConfig, SessionOverrides};
pub use error::LivecapError;
pub use events::{AudioEvent, ChatEvent, ChatPayload, LevelEvent, TranscriptEvent, TranscriptKind};
pub use media::{FfmpegSource, MediaSource};
pub use recognize::{NullRecognizer, Recognizer, RecognizerHandle, StubRecognizer};
pub use resolve::{HttpRoomResolver, ResolvedRoom, RoomResolver, StaticResolver};
pub use session::SessionSnapshot;
pub use supervisor::{PipelineSupervisor, StartInfo, StartRequest};
