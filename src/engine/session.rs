//! # Voice Session Management
//!
//! Binds one connection to one `(session_id, case_id)` conversation and
//! runs the session's pipeline. Each session gets a dedicated worker task
//! that exclusively owns the turn controller, chunk sequencer, playback
//! queue, codec, and capture buffer — stages hand data to each other over
//! channels, never through shared mutable state.
//!
//! ## Session Lifecycle:
//! 1. **Join**: connection binds `(session_id, case_id)`; the worker and
//!    playback task are spawned.
//! 2. **Turns**: wire events arrive as [`SessionCommand`]s; outbound
//!    [`SessionEvent`]s flow back to the originating connection only.
//! 3. **Reset**: the controller/sequencer/playback triple is torn down and
//!    reconstructed in place, preserving the session identity.
//! 4. **Disconnect**: the worker shuts down and every resource is released.
//!
//! ## Stale-turn protection:
//! Every barge-in and reset bumps a turn epoch. In-flight inference results
//! are tagged with the epoch they started under and discarded on arrival if
//! the world has moved on, so no utterance's audio can play after a newer
//! turn has begun.

use crate::config::AudioSettings;
use crate::engine::capture::CaptureBuffer;
use crate::engine::codec::{AudioCodec, Direction, SampleBuffer};
use crate::engine::playback::{AudioSink, PlaybackEvent, PlaybackQueue};
use crate::engine::sequencer::{ChunkSequencer, OrderingPolicy, SynthesizedChunk};
use crate::engine::turn::{TurnController, TurnState};
use crate::error::{EngineError, EngineResult};
use crate::providers::{AgentReply, DialogueProvider, DialogueTurn, SpeechProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Inbound wire events, already parsed and base64-decoded.
#[derive(Debug)]
pub enum SessionCommand {
    /// Operator pressed record: open capture
    StartCapture,
    /// Operator finished an utterance: close capture, run inference
    StopCapture,
    /// One encoded operator audio fragment
    OperatorAudio(Vec<u8>),
    /// Text-mode turn input (bypasses capture)
    TextTurn { text: String, target: Option<String> },
    /// End the current turn and clear sequencing/playback state
    Reset,
    /// Connection is gone; release everything
    Shutdown,
}

/// Outbound events for the originating connection.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Thinking {
        is_thinking: bool,
    },
    ResponseText {
        text: String,
        category: Option<String>,
    },
    AudioChunk {
        payload: Vec<u8>,
        sentence_index: Option<u32>,
    },
    StateUpdate {
        session_id: String,
        case_id: String,
        turn_state: TurnState,
        timestamp: String,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

/// Handle to one live session. Cheap to clone behind an `Arc`; all real
/// state lives in the worker task.
pub struct VoiceSession {
    pub session_id: String,
    pub case_id: String,
    pub created_at: DateTime<Utc>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    turn_state: Arc<RwLock<TurnState>>,
}

impl VoiceSession {
    /// Send a command to the session worker.
    pub fn command(&self, command: SessionCommand) -> EngineResult<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::SessionClosed(self.session_id.clone()))
    }

    /// The worker's last published turn state.
    pub fn turn_state(&self) -> TurnState {
        *self.turn_state.read().unwrap()
    }
}

/// Summary of one session for the introspection API.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub case_id: String,
    pub turn_state: TurnState,
    pub created_at: DateTime<Utc>,
}

/// Owns every live session and their lifecycle.
///
/// ## Isolation:
/// Outbound events reach the originating connection only: each session is
/// constructed around the event sender its connection handed over at join
/// time, and sessions never see each other's channels.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<VoiceSession>>>,
    max_concurrent_sessions: usize,
    audio: AudioSettings,
    ordering: OrderingPolicy,
    speech: Arc<dyn SpeechProvider>,
    dialogue: Arc<dyn DialogueProvider>,
}

impl SessionManager {
    pub fn new(
        audio: AudioSettings,
        ordering: OrderingPolicy,
        max_concurrent_sessions: usize,
        speech: Arc<dyn SpeechProvider>,
        dialogue: Arc<dyn DialogueProvider>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions,
            audio,
            ordering,
            speech,
            dialogue,
        }
    }

    /// Bind a connection to `(session_id, case_id)` and spawn the session
    /// worker. A join for an id that is already live rebinds it: the old
    /// worker is shut down and a fresh session takes over the identity
    /// (reconnect case).
    pub fn join(
        &self,
        session_id: Option<String>,
        case_id: String,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<VoiceSession>, String> {
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut sessions = self.sessions.write().unwrap();

        if let Some(previous) = sessions.remove(&session_id) {
            info!(session_id = %session_id, "rebinding existing session to new connection");
            let _ = previous.command(SessionCommand::Shutdown);
        } else if sessions.len() >= self.max_concurrent_sessions {
            return Err(format!(
                "Maximum concurrent sessions ({}) reached",
                self.max_concurrent_sessions
            ));
        }

        let session = spawn_session(
            session_id.clone(),
            case_id,
            self.audio.clone(),
            self.ordering,
            self.speech.clone(),
            self.dialogue.clone(),
            events,
        );

        let session = Arc::new(session);
        sessions.insert(session_id, session.clone());
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<VoiceSession>> {
        self.sessions.read().unwrap().get(session_id).cloned()
    }

    /// End the current turn and clear all sequencing/playback state,
    /// preserving the session identity. Idempotent.
    pub fn reset(&self, session_id: &str) -> EngineResult<()> {
        match self.get(session_id) {
            Some(session) => session.command(SessionCommand::Reset),
            None => Err(EngineError::SessionClosed(session_id.to_string())),
        }
    }

    /// Release all resources of a session (disconnect path).
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().unwrap().remove(session_id);
        match removed {
            Some(session) => {
                let _ = session.command(SessionCommand::Shutdown);
                true
            }
            None => false,
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Snapshot of every live session for the introspection API.
    pub fn summaries(&self) -> Vec<SessionSummary> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .map(|session| SessionSummary {
                session_id: session.session_id.clone(),
                case_id: session.case_id.clone(),
                turn_state: session.turn_state(),
                created_at: session.created_at,
            })
            .collect()
    }
}

/// Playback sink that streams agent audio back over the session
/// connection, paced to real time.
///
/// Emitting a chunk and then sleeping for the buffer's duration is what
/// makes the buffer "active": an interrupt lands mid-sleep and stops the
/// remainder of the utterance from ever being emitted.
struct ConnectionSink {
    events: mpsc::UnboundedSender<SessionEvent>,
    codec: AudioCodec,
    emitted_index: u32,
}

impl ConnectionSink {
    fn new(events: mpsc::UnboundedSender<SessionEvent>, codec: AudioCodec) -> Self {
        Self {
            events,
            codec,
            emitted_index: 0,
        }
    }
}

#[async_trait]
impl AudioSink for ConnectionSink {
    async fn play(&mut self, buffer: SampleBuffer) -> EngineResult<()> {
        let payload = self.codec.encode(&buffer.samples, Direction::Playback);
        self.emitted_index += 1;
        self.events
            .send(SessionEvent::AudioChunk {
                payload,
                sentence_index: Some(self.emitted_index),
            })
            .map_err(|_| {
                EngineError::DeviceUnavailable("session connection closed".to_string())
            })?;
        tokio::time::sleep(buffer.duration()).await;
        Ok(())
    }
}

/// What started the agent turn.
enum TurnInput {
    Speech(SampleBuffer),
    Text(String),
}

/// Results flowing back from the cancellable inference side-task, tagged
/// with the epoch they started under.
enum InferenceUpdate {
    ResponseText {
        epoch: u64,
        operator_text: String,
        reply: AgentReply,
    },
    Chunk {
        epoch: u64,
        chunk: SynthesizedChunk,
    },
    Completed {
        epoch: u64,
    },
    Failed {
        epoch: u64,
        error: EngineError,
    },
}

fn spawn_session(
    session_id: String,
    case_id: String,
    audio: AudioSettings,
    ordering: OrderingPolicy,
    speech: Arc<dyn SpeechProvider>,
    dialogue: Arc<dyn DialogueProvider>,
    events: mpsc::UnboundedSender<SessionEvent>,
) -> VoiceSession {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let turn_state = Arc::new(RwLock::new(TurnState::Idle));

    let session = VoiceSession {
        session_id: session_id.clone(),
        case_id: case_id.clone(),
        created_at: Utc::now(),
        commands: command_tx,
        turn_state: turn_state.clone(),
    };

    let worker = SessionWorker::new(
        session_id,
        case_id,
        audio,
        ordering,
        speech,
        dialogue,
        events,
        turn_state,
    );
    tokio::spawn(worker.run(command_rx));

    session
}

/// The per-session pipeline driver. Exclusively owns the controller,
/// sequencer, playback handle, codec, capture buffer, and history.
struct SessionWorker {
    session_id: String,
    case_id: String,
    audio: AudioSettings,
    ordering: OrderingPolicy,
    speech: Arc<dyn SpeechProvider>,
    dialogue: Arc<dyn DialogueProvider>,
    events: mpsc::UnboundedSender<SessionEvent>,
    shared_state: Arc<RwLock<TurnState>>,

    turn: TurnController,
    sequencer: ChunkSequencer,
    playback: PlaybackQueue,
    playback_events: mpsc::UnboundedReceiver<PlaybackEvent>,
    codec: AudioCodec,
    capture: CaptureBuffer,
    history: Vec<DialogueTurn>,

    inference_tx: mpsc::UnboundedSender<InferenceUpdate>,
    inference_rx: mpsc::UnboundedReceiver<InferenceUpdate>,
    inference_cancel: Option<CancellationToken>,

    /// Bumped on every barge-in and reset; stale inference results are
    /// discarded by comparing against this.
    epoch: u64,
    /// The current utterance's chunk stream has fully arrived.
    synthesis_done: bool,
    /// Playback has buffers it has not finished with.
    playback_active: bool,
}

impl SessionWorker {
    #[allow(clippy::too_many_arguments)]
    fn new(
        session_id: String,
        case_id: String,
        audio: AudioSettings,
        ordering: OrderingPolicy,
        speech: Arc<dyn SpeechProvider>,
        dialogue: Arc<dyn DialogueProvider>,
        events: mpsc::UnboundedSender<SessionEvent>,
        shared_state: Arc<RwLock<TurnState>>,
    ) -> Self {
        let codec = AudioCodec::new(audio.capture_sample_rate, audio.playback_sample_rate);
        let capture = CaptureBuffer::new(audio.capture_sample_rate, audio.max_utterance_ms);
        let (playback, playback_events) =
            PlaybackQueue::spawn(ConnectionSink::new(events.clone(), codec.clone()));
        let (inference_tx, inference_rx) = mpsc::unbounded_channel();

        Self {
            session_id,
            case_id,
            audio,
            ordering,
            speech,
            dialogue,
            events,
            shared_state,
            turn: TurnController::new(),
            sequencer: ChunkSequencer::new(ordering),
            playback,
            playback_events,
            codec,
            capture,
            history: Vec::new(),
            inference_tx,
            inference_rx,
            inference_cancel: None,
            epoch: 0,
            synthesis_done: false,
            playback_active: false,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        info!(session_id = %self.session_id, case_id = %self.case_id, "session worker started");

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(SessionCommand::Shutdown) => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(event) = self.playback_events.recv() => {
                    self.handle_playback_event(event);
                }
                Some(update) = self.inference_rx.recv() => {
                    self.handle_inference_update(update);
                }
            }
        }

        self.cancel_inference();
        self.playback.interrupt();
        info!(session_id = %self.session_id, "session worker stopped");
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::StartCapture => self.handle_start_capture(),
            SessionCommand::StopCapture => self.handle_stop_capture(),
            SessionCommand::OperatorAudio(payload) => self.handle_operator_audio(&payload),
            SessionCommand::TextTurn { text, target } => self.handle_text_turn(text, target),
            SessionCommand::Reset => self.handle_reset(),
            SessionCommand::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    fn handle_start_capture(&mut self) {
        match self.turn.begin_listening() {
            Ok(transition) => {
                if transition.interrupted_agent {
                    debug!(session_id = %self.session_id, "operator barge-in, cutting agent off");
                }
                // A new operator turn invalidates any agent activity,
                // speaking or still thinking.
                self.cut_off_agent();
                self.capture.clear();
                if transition.interrupted_agent {
                    self.send_event(SessionEvent::Thinking { is_thinking: false });
                }
                self.publish_state();
            }
            Err(violation) => self.log_violation(&violation),
        }
    }

    fn handle_operator_audio(&mut self, payload: &[u8]) {
        if !self.turn.accepts_operator_audio() {
            self.log_violation(&EngineError::ProtocolViolation(format!(
                "audio-chunk received in state {}",
                self.turn.state().as_str()
            )));
            return;
        }

        match self.codec.decode(payload, Direction::Capture) {
            Ok(buffer) => self.capture.append(&buffer),
            Err(error) => {
                // Single-chunk codec errors are recovered locally: drop the
                // chunk, keep the turn alive.
                warn!(session_id = %self.session_id, %error, "dropping malformed operator chunk");
            }
        }
    }

    fn handle_stop_capture(&mut self) {
        if let Err(violation) = self.turn.finish_listening() {
            self.log_violation(&violation);
            return;
        }

        let utterance = self.capture.take_utterance();
        debug!(
            session_id = %self.session_id,
            samples = utterance.len(),
            "operator utterance complete"
        );
        self.enter_thinking(TurnInput::Speech(utterance), None);
    }

    fn handle_text_turn(&mut self, text: String, target: Option<String>) {
        // A text turn is a new inference request: it forces thinking from
        // any state, cutting off whatever the agent was doing.
        if self.turn.state() == TurnState::AgentSpeaking {
            debug!(session_id = %self.session_id, "text turn interrupted agent speech");
        }
        self.capture.clear();
        self.enter_thinking(TurnInput::Text(text), target);
    }

    /// Shared tail of every path into AgentThinking: stop the agent,
    /// announce the state, and launch the inference side-task.
    fn enter_thinking(&mut self, input: TurnInput, target: Option<String>) {
        self.cut_off_agent();
        self.turn.force_thinking();
        self.send_event(SessionEvent::Thinking { is_thinking: true });
        self.publish_state();
        self.start_inference(input, target);
    }

    fn handle_reset(&mut self) {
        self.cut_off_agent();
        self.history.clear();
        // Reconstruct the triple in place; identity is preserved.
        self.turn = TurnController::new();
        self.sequencer = ChunkSequencer::new(self.ordering);
        self.capture = CaptureBuffer::new(
            self.audio.capture_sample_rate,
            self.audio.max_utterance_ms,
        );
        let (playback, playback_events) = PlaybackQueue::spawn(ConnectionSink::new(
            self.events.clone(),
            self.codec.clone(),
        ));
        self.playback = playback;
        self.playback_events = playback_events;
        self.playback_active = false;
        self.synthesis_done = false;
        self.send_event(SessionEvent::Thinking { is_thinking: false });
        self.publish_state();
        info!(session_id = %self.session_id, "session reset");
    }

    fn handle_playback_event(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Idle => {
                self.playback_active = false;
                self.try_finish_agent_turn();
            }
            PlaybackEvent::Failed(error) => {
                warn!(session_id = %self.session_id, %error, "playback failed, aborting turn");
                self.playback_active = false;
                self.abort_turn(error);
            }
        }
    }

    fn handle_inference_update(&mut self, update: InferenceUpdate) {
        match update {
            InferenceUpdate::ResponseText {
                epoch,
                operator_text,
                reply,
            } => {
                if self.is_stale(epoch) {
                    return;
                }
                self.history.push(DialogueTurn::operator(operator_text));
                self.history.push(DialogueTurn::agent(reply.text.clone()));
                self.send_event(SessionEvent::ResponseText {
                    text: reply.text,
                    category: reply.category,
                });
            }
            InferenceUpdate::Chunk { epoch, chunk } => {
                if self.is_stale(epoch) {
                    return;
                }
                self.handle_synthesis_chunk(chunk);
            }
            InferenceUpdate::Completed { epoch } => {
                if self.is_stale(epoch) {
                    return;
                }
                self.synthesis_done = true;
                if self.turn.state() == TurnState::AgentThinking {
                    // The reply produced no audio at all; the turn ends as
                    // a text-only response.
                    self.turn.reset();
                    self.send_event(SessionEvent::Thinking { is_thinking: false });
                    self.publish_state();
                } else {
                    self.try_finish_agent_turn();
                }
            }
            InferenceUpdate::Failed { epoch, error } => {
                if self.is_stale(epoch) {
                    return;
                }
                warn!(session_id = %self.session_id, %error, "collaborator failed, aborting turn");
                self.abort_turn(error);
            }
        }
    }

    fn handle_synthesis_chunk(&mut self, chunk: SynthesizedChunk) {
        if self.turn.state() == TurnState::AgentThinking {
            // First audio chunk of the response.
            if self.turn.begin_speaking().is_ok() {
                self.publish_state();
            }
        }
        if chunk.end_of_utterance {
            self.synthesis_done = true;
        }

        for payload in self.sequencer.receive(chunk) {
            match self.codec.decode(&payload, Direction::Playback) {
                Ok(buffer) => {
                    self.playback_active = true;
                    self.playback.enqueue(buffer);
                }
                Err(error) => {
                    warn!(session_id = %self.session_id, %error, "dropping malformed synthesis chunk");
                }
            }
        }
    }

    /// AgentSpeaking → Idle once every chunk has arrived, been released,
    /// and finished playing.
    fn try_finish_agent_turn(&mut self) {
        if self.turn.state() == TurnState::AgentSpeaking
            && self.synthesis_done
            && !self.playback_active
            && self.sequencer.pending_len() == 0
        {
            if self.turn.finish_speaking().is_ok() {
                self.send_event(SessionEvent::Thinking { is_thinking: false });
                self.publish_state();
            }
        }
    }

    /// Abort the current turn to Idle and surface the error. No automatic
    /// retry — the caller decides.
    fn abort_turn(&mut self, error: EngineError) {
        self.cut_off_agent();
        self.turn.reset();
        self.send_event(SessionEvent::Error {
            code: error.code(),
            message: error.to_string(),
        });
        self.send_event(SessionEvent::Thinking { is_thinking: false });
        self.publish_state();
    }

    /// Stop all agent activity: cancel in-flight inference, interrupt
    /// playback, reset sequencing, and invalidate stale results.
    /// Idempotent.
    fn cut_off_agent(&mut self) {
        self.cancel_inference();
        self.playback.interrupt();
        self.sequencer.reset();
        self.epoch += 1;
        self.synthesis_done = false;
        self.playback_active = false;
    }

    fn cancel_inference(&mut self) {
        if let Some(cancel) = self.inference_cancel.take() {
            cancel.cancel();
        }
    }

    fn start_inference(&mut self, input: TurnInput, target: Option<String>) {
        let cancel = CancellationToken::new();
        self.inference_cancel = Some(cancel.clone());

        let epoch = self.epoch;
        let tx = self.inference_tx.clone();
        let speech = self.speech.clone();
        let dialogue = self.dialogue.clone();
        let codec = self.codec.clone();
        let history = self.history.clone();
        let case_id = self.case_id.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(epoch, "inference turn cancelled");
                }
                _ = run_inference_turn(
                    input, target, history, case_id, speech, dialogue, codec, epoch, tx,
                ) => {}
            }
        });
    }

    fn is_stale(&self, epoch: u64) -> bool {
        if epoch != self.epoch {
            debug!(
                session_id = %self.session_id,
                stale = epoch,
                current = self.epoch,
                "discarding stale inference result"
            );
            true
        } else {
            false
        }
    }

    fn log_violation(&self, violation: &EngineError) {
        warn!(
            session_id = %self.session_id,
            state = self.turn.state().as_str(),
            %violation,
            "ignoring out-of-state event"
        );
    }

    fn send_event(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish_state(&self) {
        let state = self.turn.state();
        *self.shared_state.write().unwrap() = state;
        self.send_event(SessionEvent::StateUpdate {
            session_id: self.session_id.clone(),
            case_id: self.case_id.clone(),
            turn_state: state,
            timestamp: Utc::now().to_rfc3339(),
        });
    }
}

/// One agent turn: transcribe (voice turns only) → generate → synthesize,
/// streaming each stage's output back to the worker as it lands.
#[allow(clippy::too_many_arguments)]
async fn run_inference_turn(
    input: TurnInput,
    target: Option<String>,
    mut history: Vec<DialogueTurn>,
    case_id: String,
    speech: Arc<dyn SpeechProvider>,
    dialogue: Arc<dyn DialogueProvider>,
    codec: AudioCodec,
    epoch: u64,
    tx: mpsc::UnboundedSender<InferenceUpdate>,
) {
    let operator_text = match input {
        TurnInput::Text(text) => text,
        TurnInput::Speech(utterance) => {
            let sample_rate = utterance.sample_rate;
            let encoded = codec.encode(&utterance.samples, Direction::Capture);
            match speech.transcribe(&encoded, sample_rate).await {
                Ok(transcript) => transcript.text,
                Err(error) => {
                    let _ = tx.send(InferenceUpdate::Failed { epoch, error });
                    return;
                }
            }
        }
    };

    history.push(DialogueTurn::operator(operator_text.clone()));
    let reply = match dialogue.respond(&history, &case_id, target.as_deref()).await {
        Ok(reply) => reply,
        Err(error) => {
            let _ = tx.send(InferenceUpdate::Failed { epoch, error });
            return;
        }
    };

    let reply_text = reply.text.clone();
    let _ = tx.send(InferenceUpdate::ResponseText {
        epoch,
        operator_text,
        reply,
    });

    match speech.synthesize(&reply_text).await {
        Ok(chunks) => {
            for chunk in chunks {
                let _ = tx.send(InferenceUpdate::Chunk { epoch, chunk });
            }
            let _ = tx.send(InferenceUpdate::Completed { epoch });
        }
        Err(error) => {
            let _ = tx.send(InferenceUpdate::Failed { epoch, error });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::Transcript;
    use std::sync::Mutex;
    use tokio::time::{timeout, Duration};

    /// Scripted recognition/synthesis double.
    struct ScriptedSpeech {
        transcript: String,
        chunks: Mutex<Vec<SynthesizedChunk>>,
        synth_delay: Duration,
        fail_synthesis: bool,
    }

    impl ScriptedSpeech {
        fn new(transcript: &str, chunks: Vec<SynthesizedChunk>) -> Self {
            Self {
                transcript: transcript.to_string(),
                chunks: Mutex::new(chunks),
                synth_delay: Duration::ZERO,
                fail_synthesis: false,
            }
        }
    }

    #[async_trait]
    impl SpeechProvider for ScriptedSpeech {
        async fn transcribe(&self, _audio: &[u8], _sample_rate: u32) -> EngineResult<Transcript> {
            Ok(Transcript {
                text: self.transcript.clone(),
                confidence: 0.9,
            })
        }

        async fn synthesize(&self, _text: &str) -> EngineResult<Vec<SynthesizedChunk>> {
            if !self.synth_delay.is_zero() {
                tokio::time::sleep(self.synth_delay).await;
            }
            if self.fail_synthesis {
                return Err(EngineError::Collaborator("synthesis backend down".into()));
            }
            Ok(self.chunks.lock().unwrap().clone())
        }
    }

    /// Scripted dialogue double.
    struct ScriptedDialogue {
        reply: String,
        fail: bool,
    }

    #[async_trait]
    impl DialogueProvider for ScriptedDialogue {
        async fn respond(
            &self,
            _history: &[DialogueTurn],
            _case_id: &str,
            _target: Option<&str>,
        ) -> EngineResult<AgentReply> {
            if self.fail {
                return Err(EngineError::Collaborator("dialogue backend down".into()));
            }
            Ok(AgentReply {
                text: self.reply.clone(),
                category: Some("history_taking".to_string()),
            })
        }
    }

    fn test_audio() -> AudioSettings {
        AudioSettings {
            capture_sample_rate: 16000,
            playback_sample_rate: 24000,
            channels: 1,
            bit_depth: 16,
            max_utterance_ms: 30_000,
        }
    }

    /// Encoded playback-direction chunk whose samples are all `value`.
    fn synth_payload(value: i16, samples: usize) -> Vec<u8> {
        AudioCodec::new(16000, 24000).encode(&vec![value; samples], Direction::Playback)
    }

    fn manager(
        speech: ScriptedSpeech,
        dialogue: ScriptedDialogue,
    ) -> SessionManager {
        SessionManager::new(
            test_audio(),
            OrderingPolicy::Strict,
            4,
            Arc::new(speech),
            Arc::new(dialogue),
        )
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event within budget")
            .expect("event channel open")
    }

    /// Drain events until one matches, failing after a budget.
    async fn wait_for_event<F: Fn(&SessionEvent) -> bool>(
        rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        matches: F,
    ) -> Vec<SessionEvent> {
        let mut seen = Vec::new();
        loop {
            let event = next_event(rx).await;
            let done = matches(&event);
            seen.push(event);
            if done {
                return seen;
            }
        }
    }

    fn decoded_value(payload: &[u8]) -> i16 {
        AudioCodec::new(16000, 24000)
            .decode(payload, Direction::Playback)
            .unwrap()
            .samples[0]
    }

    #[tokio::test]
    async fn test_full_voice_turn_reaches_idle() {
        // Scenario D: synthesis completes, playback drains, state returns
        // to idle on its own.
        let speech = ScriptedSpeech::new(
            "what brings you in today",
            vec![
                SynthesizedChunk::new(synth_payload(1, 240), Some(1)),
                SynthesizedChunk::final_chunk(synth_payload(2, 240), Some(2)),
            ],
        );
        let dialogue = ScriptedDialogue {
            reply: "My chest hurts when I breathe.".into(),
            fail: false,
        };
        let manager = manager(speech, dialogue);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = manager.join(Some("s1".into()), "case-7".into(), tx).unwrap();

        session.command(SessionCommand::StartCapture).unwrap();
        let raw: Vec<u8> = vec![0u8; 3200];
        session.command(SessionCommand::OperatorAudio(raw)).unwrap();
        session.command(SessionCommand::StopCapture).unwrap();

        let seen = wait_for_event(&mut rx, |event| {
            matches!(
                event,
                SessionEvent::StateUpdate { turn_state: TurnState::Idle, .. }
            )
        })
        .await;

        // Thinking was announced, the transcript-driven reply arrived, and
        // both audio chunks were emitted in order before the drain.
        assert!(seen
            .iter()
            .any(|e| matches!(e, SessionEvent::Thinking { is_thinking: true })));
        assert!(seen.iter().any(|e| matches!(
            e,
            SessionEvent::ResponseText { text, .. } if text == "My chest hurts when I breathe."
        )));
        let audio_values: Vec<i16> = seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::AudioChunk { payload, .. } => Some(decoded_value(payload)),
                _ => None,
            })
            .collect();
        assert_eq!(audio_values, vec![1, 2]);
        assert_eq!(session.turn_state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn test_out_of_order_chunks_play_in_index_order() {
        // Scenario A end-to-end: provider hands chunks as (2, 1); chunk 1
        // is emitted first, both eventually play.
        let speech = ScriptedSpeech::new(
            "any allergies",
            vec![
                SynthesizedChunk::new(synth_payload(2, 240), Some(2)),
                SynthesizedChunk::final_chunk(synth_payload(1, 240), Some(1)),
            ],
        );
        let dialogue = ScriptedDialogue {
            reply: "Just penicillin.".into(),
            fail: false,
        };
        let manager = manager(speech, dialogue);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = manager.join(Some("s1".into()), "case-7".into(), tx).unwrap();
        session
            .command(SessionCommand::TextTurn {
                text: "any allergies?".into(),
                target: None,
            })
            .unwrap();

        let seen = wait_for_event(&mut rx, |event| {
            matches!(
                event,
                SessionEvent::StateUpdate { turn_state: TurnState::Idle, .. }
            )
        })
        .await;

        let audio_values: Vec<i16> = seen
            .iter()
            .filter_map(|e| match e {
                SessionEvent::AudioChunk { payload, .. } => Some(decoded_value(payload)),
                _ => None,
            })
            .collect();
        assert_eq!(audio_values, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_barge_in_discards_agent_audio() {
        // Scenario B: a new turn arrives while the agent is speaking with
        // buffers still queued; playback empties immediately and the state
        // moves to thinking.
        let long = 24_000; // 1 s per chunk keeps the agent speaking
        let speech = ScriptedSpeech::new(
            "",
            vec![
                SynthesizedChunk::new(synth_payload(1, long), Some(1)),
                SynthesizedChunk::new(synth_payload(2, long), Some(2)),
                SynthesizedChunk::final_chunk(synth_payload(3, long), Some(3)),
            ],
        );
        let dialogue = ScriptedDialogue {
            reply: "a very long answer".into(),
            fail: false,
        };
        let manager = manager(speech, dialogue);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = manager.join(Some("s1".into()), "case-7".into(), tx).unwrap();
        session
            .command(SessionCommand::TextTurn {
                text: "first question".into(),
                target: None,
            })
            .unwrap();

        wait_for_event(&mut rx, |event| {
            matches!(
                event,
                SessionEvent::StateUpdate { turn_state: TurnState::AgentSpeaking, .. }
            )
        })
        .await;

        // Operator starts a new turn mid-playback.
        session.command(SessionCommand::StartCapture).unwrap();

        wait_for_event(&mut rx, |event| {
            matches!(
                event,
                SessionEvent::StateUpdate { turn_state: TurnState::OperatorListening, .. }
            )
        })
        .await;
        assert_eq!(session.turn_state(), TurnState::OperatorListening);

        // The cut-off utterance must emit no further audio: with 1 s
        // chunks only the first could have started before the barge-in.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut late_audio = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SessionEvent::AudioChunk { .. }) {
                late_audio += 1;
            }
        }
        assert_eq!(late_audio, 0);
    }

    #[tokio::test]
    async fn test_audio_chunk_while_idle_is_ignored() {
        // Scenario C: audio with no active listening turn is dropped with
        // no state change and no outbound events.
        let speech = ScriptedSpeech::new("", vec![]);
        let dialogue = ScriptedDialogue {
            reply: "unused".into(),
            fail: false,
        };
        let manager = manager(speech, dialogue);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = manager.join(Some("s1".into()), "case-7".into(), tx).unwrap();

        session
            .command(SessionCommand::OperatorAudio(vec![0u8; 320]))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.turn_state(), TurnState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_collaborator_failure_aborts_to_idle() {
        let speech = ScriptedSpeech::new("", vec![]);
        let dialogue = ScriptedDialogue {
            reply: String::new(),
            fail: true,
        };
        let manager = manager(speech, dialogue);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = manager.join(Some("s1".into()), "case-7".into(), tx).unwrap();
        session
            .command(SessionCommand::TextTurn {
                text: "hello".into(),
                target: None,
            })
            .unwrap();

        let seen = wait_for_event(&mut rx, |event| {
            matches!(event, SessionEvent::Error { code, .. } if *code == "collaborator_error")
        })
        .await;
        assert!(!seen.is_empty());

        wait_for_event(&mut rx, |event| {
            matches!(
                event,
                SessionEvent::StateUpdate { turn_state: TurnState::Idle, .. }
            )
        })
        .await;
        // Immediately ready for a new turn
        session.command(SessionCommand::StartCapture).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.turn_state(), TurnState::OperatorListening);
    }

    #[tokio::test]
    async fn test_stale_inference_results_are_discarded() {
        // First turn's synthesis is slow; a second turn barges in before it
        // lands. Only the second turn's reply may surface.
        let mut speech = ScriptedSpeech::new(
            "",
            vec![SynthesizedChunk::final_chunk(synth_payload(1, 240), Some(1))],
        );
        speech.synth_delay = Duration::from_millis(200);
        let dialogue = ScriptedDialogue {
            reply: "the reply".into(),
            fail: false,
        };
        let manager = manager(speech, dialogue);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = manager.join(Some("s1".into()), "case-7".into(), tx).unwrap();

        session
            .command(SessionCommand::TextTurn {
                text: "first".into(),
                target: None,
            })
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        session
            .command(SessionCommand::TextTurn {
                text: "second".into(),
                target: None,
            })
            .unwrap();

        let seen = wait_for_event(&mut rx, |event| {
            matches!(
                event,
                SessionEvent::StateUpdate { turn_state: TurnState::Idle, .. }
            )
        })
        .await;

        // The first (cancelled) turn's audio chunk must not have played
        // twice: exactly one emission for the surviving turn.
        let audio_chunks = seen
            .iter()
            .filter(|e| matches!(e, SessionEvent::AudioChunk { .. }))
            .count();
        assert_eq!(audio_chunks, 1);
    }

    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let speech = ScriptedSpeech::new("", vec![]);
        let dialogue = ScriptedDialogue {
            reply: "unused".into(),
            fail: false,
        };
        let manager = manager(speech, dialogue);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = manager.join(Some("s1".into()), "case-7".into(), tx).unwrap();

        session.command(SessionCommand::StartCapture).unwrap();
        manager.reset("s1").unwrap();
        manager.reset("s1").unwrap();

        let seen = wait_for_event(&mut rx, |event| {
            matches!(
                event,
                SessionEvent::StateUpdate { turn_state: TurnState::Idle, .. }
            )
        })
        .await;
        assert!(!seen.is_empty());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.turn_state(), TurnState::Idle);
        // Session identity survives reset
        assert!(manager.get("s1").is_some());
    }

    #[tokio::test]
    async fn test_session_cap_enforced() {
        let speech = ScriptedSpeech::new("", vec![]);
        let dialogue = ScriptedDialogue {
            reply: "unused".into(),
            fail: false,
        };
        let manager = SessionManager::new(
            test_audio(),
            OrderingPolicy::Strict,
            1,
            Arc::new(speech),
            Arc::new(dialogue),
        );

        let (tx1, _rx1) = mpsc::unbounded_channel();
        manager.join(Some("a".into()), "case".into(), tx1).unwrap();

        let (tx2, _rx2) = mpsc::unbounded_channel();
        assert!(manager.join(Some("b".into()), "case".into(), tx2).is_err());

        manager.remove("a");
        let (tx3, _rx3) = mpsc::unbounded_channel();
        assert!(manager.join(Some("b".into()), "case".into(), tx3).is_ok());
        assert_eq!(manager.active_session_count(), 1);
    }
}
