//! # Inference Collaborators
//!
//! The engine treats speech recognition/synthesis and dialogue generation
//! as black-box external collaborators behind traits. The session worker
//! only ever sees the traits; the HTTP implementations here are the
//! production wiring, and tests inject scripted doubles.
//!
//! ## Collaborator Contract:
//! - **SpeechProvider**: encoded operator audio → transcript; response text
//!   → synthesized audio chunks carrying per-utterance sequence indices.
//! - **DialogueProvider**: conversation history + case identity → response
//!   text plus category metadata.
//!
//! Provider failures map to `EngineError::Collaborator`; the engine aborts
//! the turn and never retries on its own.

pub mod dialogue;
pub mod speech;

pub use dialogue::{AgentReply, DialogueProvider, DialogueRole, DialogueTurn, HttpDialogueProvider};
pub use speech::{HttpSpeechProvider, SpeechProvider, Transcript};
