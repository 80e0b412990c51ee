//! # Turn Controller
//!
//! The state machine that owns whose turn it is. It is deliberately pure:
//! transition methods mutate state and *report* which side effects the
//! session worker must apply (interrupt playback, reset the sequencer), so
//! the machine is unit-testable without a runtime.
//!
//! ## Turn Lifecycle:
//! 1. **Idle**: nobody is speaking; ready to accept a new turn
//! 2. **OperatorListening**: capture is open, operator audio accumulating
//! 3. **AgentThinking**: utterance handed to the inference collaborators
//! 4. **AgentSpeaking**: synthesized audio is being played back
//!
//! The machine is cyclic across the conversation; the only way out is
//! session teardown. A "thinking" signal forces `AgentThinking` from any
//! state — this is how barge-in cuts the agent off mid-sentence.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};

/// Whose turn the session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Idle,
    OperatorListening,
    AgentThinking,
    AgentSpeaking,
}

impl TurnState {
    /// Wire/API representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Idle => "idle",
            TurnState::OperatorListening => "operator_listening",
            TurnState::AgentThinking => "agent_thinking",
            TurnState::AgentSpeaking => "agent_speaking",
        }
    }
}

/// The active speaker of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    Operator,
    Agent,
}

/// A bounded period during which exactly one party speaks.
#[derive(Debug, Clone)]
pub struct Turn {
    pub party: Party,
    pub started_at: DateTime<Utc>,
}

impl Turn {
    fn begin(party: Party) -> Self {
        Self {
            party,
            started_at: Utc::now(),
        }
    }
}

/// Effects the session worker must apply after a forced thinking
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingTransition {
    /// An agent turn was cut off; playback must be interrupted and the
    /// sequencer reset before any new chunk is accepted.
    pub interrupted_agent: bool,
    /// The machine actually changed state (false when already thinking).
    pub changed: bool,
}

/// The turn-taking state machine for one session.
pub struct TurnController {
    state: TurnState,
    turn: Option<Turn>,
}

impl TurnController {
    pub fn new() -> Self {
        Self {
            state: TurnState::Idle,
            turn: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// The turn in progress, if the machine is in a speaking/listening
    /// state.
    pub fn current_turn(&self) -> Option<&Turn> {
        self.turn.as_ref()
    }

    /// Open an operator turn on explicit start-capture.
    ///
    /// ## State Transition:
    /// Idle → OperatorListening. Starting capture while already listening
    /// is a protocol violation: no two turns within a session may capture
    /// concurrently.
    pub fn begin_listening(&mut self) -> EngineResult<ListeningTransition> {
        match self.state {
            TurnState::Idle => {
                self.state = TurnState::OperatorListening;
                self.turn = Some(Turn::begin(Party::Operator));
                Ok(ListeningTransition {
                    interrupted_agent: false,
                })
            }
            TurnState::OperatorListening => Err(EngineError::ProtocolViolation(
                "start-stream received while capture is already open".to_string(),
            )),
            // The operator starting to speak over the agent is barge-in:
            // the agent turn dies and an operator turn opens in its place.
            TurnState::AgentThinking | TurnState::AgentSpeaking => {
                let interrupted = self.state == TurnState::AgentSpeaking;
                self.state = TurnState::OperatorListening;
                self.turn = Some(Turn::begin(Party::Operator));
                Ok(ListeningTransition {
                    interrupted_agent: interrupted,
                })
            }
        }
    }

    /// Close the operator turn and hand the utterance to inference.
    ///
    /// ## State Transition:
    /// OperatorListening → AgentThinking.
    pub fn finish_listening(&mut self) -> EngineResult<()> {
        match self.state {
            TurnState::OperatorListening => {
                self.state = TurnState::AgentThinking;
                self.turn = None;
                Ok(())
            }
            _ => Err(EngineError::ProtocolViolation(format!(
                "stop-stream received in state {}",
                self.state.as_str()
            ))),
        }
    }

    /// A thinking signal arrived; force AgentThinking from any state.
    ///
    /// This is the barge-in edge: when the signal cuts off an agent that
    /// was speaking (or about to speak), the caller must interrupt playback
    /// and reset the chunk sequencer before accepting new chunks.
    pub fn force_thinking(&mut self) -> ThinkingTransition {
        let interrupted_agent = matches!(
            self.state,
            TurnState::AgentSpeaking | TurnState::AgentThinking
        );
        let changed = self.state != TurnState::AgentThinking;
        self.state = TurnState::AgentThinking;
        self.turn = None;
        ThinkingTransition {
            interrupted_agent,
            changed,
        }
    }

    /// The first audio chunk of the response arrived.
    ///
    /// ## State Transition:
    /// AgentThinking → AgentSpeaking.
    pub fn begin_speaking(&mut self) -> EngineResult<()> {
        match self.state {
            TurnState::AgentThinking => {
                self.state = TurnState::AgentSpeaking;
                self.turn = Some(Turn::begin(Party::Agent));
                Ok(())
            }
            TurnState::AgentSpeaking => Ok(()),
            _ => Err(EngineError::ProtocolViolation(format!(
                "synthesis chunk received in state {}",
                self.state.as_str()
            ))),
        }
    }

    /// Playback drained with nothing pending; the agent turn is over.
    ///
    /// ## State Transition:
    /// AgentSpeaking → Idle.
    pub fn finish_speaking(&mut self) -> EngineResult<()> {
        match self.state {
            TurnState::AgentSpeaking => {
                self.state = TurnState::Idle;
                self.turn = None;
                Ok(())
            }
            _ => Err(EngineError::ProtocolViolation(format!(
                "playback drained in state {}",
                self.state.as_str()
            ))),
        }
    }

    /// Force Idle from any state (session reset, end-of-session, or an
    /// aborted turn). Idempotent.
    pub fn reset(&mut self) {
        self.state = TurnState::Idle;
        self.turn = None;
    }

    /// Whether operator audio chunks are acceptable right now.
    pub fn accepts_operator_audio(&self) -> bool {
        self.state == TurnState::OperatorListening
    }
}

impl Default for TurnController {
    fn default() -> Self {
        Self::new()
    }
}

/// Effects of opening an operator turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListeningTransition {
    /// A speaking agent was cut off; playback must be interrupted.
    pub interrupted_agent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle() {
        let mut turn = TurnController::new();
        assert_eq!(turn.state(), TurnState::Idle);

        turn.begin_listening().unwrap();
        assert_eq!(turn.state(), TurnState::OperatorListening);
        assert_eq!(turn.current_turn().unwrap().party, Party::Operator);

        turn.finish_listening().unwrap();
        assert_eq!(turn.state(), TurnState::AgentThinking);
        assert!(turn.current_turn().is_none());

        turn.begin_speaking().unwrap();
        assert_eq!(turn.state(), TurnState::AgentSpeaking);
        assert_eq!(turn.current_turn().unwrap().party, Party::Agent);

        turn.finish_speaking().unwrap();
        assert_eq!(turn.state(), TurnState::Idle);

        // Cyclic: a fresh turn can open immediately
        turn.begin_listening().unwrap();
        assert_eq!(turn.state(), TurnState::OperatorListening);
    }

    #[test]
    fn test_double_start_capture_is_violation() {
        let mut turn = TurnController::new();
        turn.begin_listening().unwrap();
        let err = turn.begin_listening().unwrap_err();
        assert!(matches!(err, EngineError::ProtocolViolation(_)));
        assert_eq!(turn.state(), TurnState::OperatorListening);
    }

    #[test]
    fn test_barge_in_while_speaking() {
        let mut turn = TurnController::new();
        turn.begin_listening().unwrap();
        turn.finish_listening().unwrap();
        turn.begin_speaking().unwrap();

        let transition = turn.begin_listening().unwrap();
        assert!(transition.interrupted_agent);
        assert_eq!(turn.state(), TurnState::OperatorListening);
    }

    #[test]
    fn test_thinking_signal_forces_from_any_state() {
        let mut turn = TurnController::new();
        let t = turn.force_thinking();
        assert!(!t.interrupted_agent);
        assert!(t.changed);
        assert_eq!(turn.state(), TurnState::AgentThinking);

        turn.begin_speaking().unwrap();
        let t = turn.force_thinking();
        assert!(t.interrupted_agent);
        assert_eq!(turn.state(), TurnState::AgentThinking);

        // Already thinking: no state change to announce
        let t = turn.force_thinking();
        assert!(!t.changed);
    }

    #[test]
    fn test_speaking_requires_thinking() {
        let mut turn = TurnController::new();
        assert!(turn.begin_speaking().is_err());
        turn.begin_listening().unwrap();
        assert!(turn.begin_speaking().is_err());
    }

    #[test]
    fn test_audio_only_accepted_while_listening() {
        let mut turn = TurnController::new();
        assert!(!turn.accepts_operator_audio());
        turn.begin_listening().unwrap();
        assert!(turn.accepts_operator_audio());
        turn.finish_listening().unwrap();
        assert!(!turn.accepts_operator_audio());
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut turn = TurnController::new();
        turn.begin_listening().unwrap();
        turn.reset();
        assert_eq!(turn.state(), TurnState::Idle);
        turn.reset();
        assert_eq!(turn.state(), TurnState::Idle);
        assert!(turn.current_turn().is_none());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(TurnState::Idle.as_str(), "idle");
        assert_eq!(TurnState::AgentSpeaking.as_str(), "agent_speaking");
    }
}
