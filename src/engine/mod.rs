//! # Voice Session Engine
//!
//! The real-time core that drives a spoken conversation between a human
//! operator and a synthesized agent. Everything latency- or ordering-
//! sensitive lives here; the HTTP/WebSocket layers above are plumbing.
//!
//! ## Key Components:
//! - **Codec**: WAV-envelope encode, container/raw-PCM fallback decode
//! - **Capture**: operator utterance accumulation between start/stop-stream
//! - **Sequencer**: per-utterance ordering of synthesized chunks
//! - **Playback**: gapless FIFO playback with immediate interruption
//! - **Turn**: the operator/agent turn-taking state machine
//! - **Session**: per-session worker wiring the pieces together, plus the
//!   manager that owns session lifecycle
//!
//! ## Pipeline:
//! operator `audio-chunk` → codec validate → capture buffer → recognition →
//! dialogue → synthesis → sequencer → codec decode → playback → paced
//! `ai-audio-chunk` emission. The turn controller observes and gates every
//! step; `interrupt()` and session reset are the only cancellation
//! primitives.

pub mod capture;
pub mod codec;
pub mod playback;
pub mod sequencer;
pub mod session;
pub mod turn;

pub use codec::{AudioCodec, Direction, SampleBuffer};
pub use playback::{AudioSink, PlaybackEvent, PlaybackQueue};
pub use sequencer::{ChunkSequencer, OrderingPolicy, SynthesizedChunk};
pub use session::{SessionManager, VoiceSession};
pub use turn::{Party, TurnController, TurnState};
