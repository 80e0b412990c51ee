//! # Voice Session WebSocket Handler
//!
//! The persistent connection for a spoken conversation. Clients connect to
//! `/ws/voice`, bind the connection to a session with `join-session`, and
//! then stream operator audio while receiving synthesized agent speech
//! back.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: client connects and must `join-session` first
//! 2. **Capture**: `start-stream` / `audio-chunk` (base64) / `stop-stream`
//! 3. **Text turns**: `message` bypasses capture entirely
//! 4. **Reset**: `reset-session` ends the turn and clears playback state
//! 5. **Heartbeat**: ping/pong every 30 s; 60 s silence closes the socket
//!
//! Server → client events: `ai-thinking`, `ai-response-text`,
//! `ai-audio-chunk` (base64, optional sentence index), `state-update`,
//! `error`.
//!
//! ## Actor Model:
//! Each connection is an independent Actix actor. Outbound engine events
//! arrive as a stream (the session worker's channel plugged into the actor
//! via `add_stream`), so ordering between engine events and heartbeats is
//! handled by the mailbox, not by locks.

use crate::engine::session::{SessionCommand, SessionEvent, SessionManager, VoiceSession};
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

/// How often the server pings an idle connection.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// How long a silent connection survives before being closed.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages from the client.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Bind this connection to a conversation session
    #[serde(rename = "join-session")]
    JoinSession {
        session_id: String,
        #[serde(default)]
        case_id: Option<String>,
    },

    /// Operator pressed record
    #[serde(rename = "start-stream")]
    StartStream,

    /// Operator finished an utterance
    #[serde(rename = "stop-stream")]
    StopStream,

    /// One encoded operator audio fragment
    #[serde(rename = "audio-chunk")]
    AudioChunk {
        /// Base64-encoded payload (WAV container or raw PCM)
        audio: String,
    },

    /// Text-mode turn input (bypasses capture)
    #[serde(rename = "message")]
    Message {
        text: String,
        case_id: String,
        session_id: String,
        #[serde(default)]
        target: Option<String>,
    },

    /// End the current turn, clear sequencing/playback state
    #[serde(rename = "reset-session")]
    ResetSession {
        case_id: String,
        session_id: String,
    },

    /// Heartbeat
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    /// Heartbeat reply
    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// Messages to the client.
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Turn-state notice; `is_thinking = true` triggers client-side
    /// interruption of any locally buffered playback
    #[serde(rename = "ai-thinking")]
    AiThinking { is_thinking: bool },

    /// Agent utterance transcript
    #[serde(rename = "ai-response-text")]
    AiResponseText { text: String, meta: ResponseMeta },

    /// One synthesized speech fragment
    #[serde(rename = "ai-audio-chunk")]
    AiAudioChunk {
        /// Base64-encoded payload
        audio: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        sentence_index: Option<u32>,
    },

    /// Session/turn metadata sync
    #[serde(rename = "state-update")]
    StateUpdate {
        session_id: String,
        case_id: String,
        turn_state: String,
        timestamp: String,
    },

    /// Something went wrong; the session survives unless the connection is
    /// told otherwise
    #[serde(rename = "error")]
    Error { code: String, message: String },

    #[serde(rename = "ping")]
    Ping { timestamp: u64 },

    #[serde(rename = "pong")]
    Pong { timestamp: u64 },
}

/// Metadata attached to an agent reply.
#[derive(Debug, Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

/// WebSocket actor for one voice connection.
pub struct VoiceWebSocket {
    /// The bound session, set by `join-session`
    session: Option<Arc<VoiceSession>>,

    /// Owner of all session lifecycle
    manager: Arc<SessionManager>,

    /// Shared metrics
    app_state: web::Data<AppState>,

    /// Last heartbeat time
    last_heartbeat: Instant,
}

impl VoiceWebSocket {
    pub fn new(manager: Arc<SessionManager>, app_state: web::Data<AppState>) -> Self {
        Self {
            session: None,
            manager,
            app_state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => error!("failed to serialize server message: {}", err),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, code: &str, message: &str) {
        warn!(code, message, "websocket error sent to client");
        self.send_json(
            ctx,
            &ServerMessage::Error {
                code: code.to_string(),
                message: message.to_string(),
            },
        );
    }

    fn handle_join(
        &mut self,
        session_id: String,
        case_id: Option<String>,
        ctx: &mut ws::WebsocketContext<Self>,
    ) {
        if self.session.is_some() {
            self.send_error(ctx, "protocol_violation", "connection already joined a session");
            return;
        }

        let case_id = case_id.unwrap_or_default();
        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel();

        match self.manager.join(Some(session_id.clone()), case_id, events_tx) {
            Ok(session) => {
                info!(session_id = %session.session_id, "connection joined session");
                self.session = Some(session);
                self.app_state.increment_active_sessions();
                // Engine events flow into the actor mailbox as a stream.
                ctx.add_stream(UnboundedReceiverStream::new(events_rx));
            }
            Err(err) => {
                self.send_error(ctx, "session_error", &err);
            }
        }
    }

    /// Forward a command to the bound session, or complain when there is
    /// none.
    fn forward(&self, command: SessionCommand, ctx: &mut ws::WebsocketContext<Self>) {
        match &self.session {
            Some(session) => {
                if session.command(command).is_err() {
                    self.send_error(ctx, "session_closed", "session worker is gone");
                    ctx.stop();
                }
            }
            None => {
                self.send_error(ctx, "protocol_violation", "join-session required first");
            }
        }
    }

    /// The bound session must match the id the client named.
    fn check_bound(&self, session_id: &str, ctx: &mut ws::WebsocketContext<Self>) -> bool {
        match &self.session {
            Some(session) if session.session_id == session_id => true,
            Some(session) => {
                warn!(
                    bound = %session.session_id,
                    requested = %session_id,
                    "event names a session this connection does not own"
                );
                self.send_error(ctx, "protocol_violation", "session id does not match this connection");
                false
            }
            None => {
                self.send_error(ctx, "protocol_violation", "join-session required first");
                false
            }
        }
    }
}

impl Actor for VoiceWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("voice websocket connected");

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("websocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }

            let ping = ServerMessage::Ping {
                timestamp: chrono::Utc::now().timestamp_millis() as u64,
            };
            if let Ok(json) = serde_json::to_string(&ping) {
                ctx.text(json);
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        if let Some(session) = self.session.take() {
            info!(session_id = %session.session_id, "connection closed, releasing session");
            self.manager.remove(&session.session_id);
            self.app_state.decrement_active_sessions();
        } else {
            info!("voice websocket disconnected before joining");
        }
    }
}

/// Inbound wire frames.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for VoiceWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::JoinSession { session_id, case_id }) => {
                    self.handle_join(session_id, case_id, ctx);
                }
                Ok(ClientMessage::StartStream) => {
                    self.forward(SessionCommand::StartCapture, ctx);
                }
                Ok(ClientMessage::StopStream) => {
                    self.forward(SessionCommand::StopCapture, ctx);
                }
                Ok(ClientMessage::AudioChunk { audio }) => match BASE64.decode(&audio) {
                    Ok(payload) => self.forward(SessionCommand::OperatorAudio(payload), ctx),
                    Err(err) => {
                        // Undecodable chunks are dropped; the turn goes on.
                        warn!(error = %err, "dropping undecodable audio-chunk payload");
                    }
                },
                Ok(ClientMessage::Message {
                    text,
                    session_id,
                    target,
                    ..
                }) => {
                    if self.check_bound(&session_id, ctx) {
                        self.forward(SessionCommand::TextTurn { text, target }, ctx);
                    }
                }
                Ok(ClientMessage::ResetSession { session_id, .. }) => {
                    if self.check_bound(&session_id, ctx) {
                        self.forward(SessionCommand::Reset, ctx);
                    }
                }
                Ok(ClientMessage::Ping { timestamp }) => {
                    self.last_heartbeat = Instant::now();
                    self.send_json(ctx, &ServerMessage::Pong { timestamp });
                }
                Ok(ClientMessage::Pong { .. }) => {
                    self.last_heartbeat = Instant::now();
                }
                Err(err) => {
                    self.send_error(ctx, "invalid_json", &format!("Invalid message: {}", err));
                }
            },
            Ok(ws::Message::Binary(data)) => {
                // Binary frames carry raw operator audio without the JSON
                // envelope; treated exactly like a decoded audio-chunk.
                debug!(bytes = data.len(), "binary operator audio frame");
                self.forward(SessionCommand::OperatorAudio(data.to_vec()), ctx);
            }
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!("websocket closed: {:?}", reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!("websocket protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// Outbound engine events, streamed from the session worker.
impl StreamHandler<SessionEvent> for VoiceWebSocket {
    fn handle(&mut self, event: SessionEvent, ctx: &mut Self::Context) {
        let message = match event {
            SessionEvent::Thinking { is_thinking } => ServerMessage::AiThinking { is_thinking },
            SessionEvent::ResponseText { text, category } => ServerMessage::AiResponseText {
                text,
                meta: ResponseMeta { category },
            },
            SessionEvent::AudioChunk {
                payload,
                sentence_index,
            } => ServerMessage::AiAudioChunk {
                audio: BASE64.encode(payload),
                sentence_index,
            },
            SessionEvent::StateUpdate {
                session_id,
                case_id,
                turn_state,
                timestamp,
            } => ServerMessage::StateUpdate {
                session_id,
                case_id,
                turn_state: turn_state.as_str().to_string(),
                timestamp,
            },
            SessionEvent::Error { code, message } => ServerMessage::Error {
                code: code.to_string(),
                message,
            },
        };
        self.send_json(ctx, &message);
    }

    fn finished(&mut self, _ctx: &mut Self::Context) {
        // The worker dropped its event sender (shutdown); keep the socket
        // open so the client can re-join.
        debug!("session event stream finished");
    }
}

/// WebSocket endpoint handler: upgrades the HTTP request and hands the
/// connection to the actor.
pub async fn voice_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
    manager: web::Data<Arc<SessionManager>>,
) -> ActixResult<HttpResponse> {
    info!(
        "new voice websocket connection from: {:?}",
        req.connection_info().peer_addr()
    );

    let websocket = VoiceWebSocket::new(manager.get_ref().clone(), app_state);
    ws::start(websocket, &req, stream)
}
