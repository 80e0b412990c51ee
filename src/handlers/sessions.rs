//! Introspection over live voice sessions. Read-only: session lifecycle is
//! driven exclusively through the websocket, never through REST.

use crate::engine::session::SessionManager;
use crate::error::AppError;
use actix_web::{web, HttpResponse};
use serde_json::json;
use std::sync::Arc;

/// GET /api/v1/sessions — every live session with its current turn state.
pub async fn list_sessions(
    manager: web::Data<Arc<SessionManager>>,
) -> Result<HttpResponse, AppError> {
    let summaries = manager.summaries();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active_sessions": summaries.len(),
        "sessions": summaries
    })))
}

/// GET /api/v1/sessions/{session_id} — one session's summary.
pub async fn get_session(
    manager: web::Data<Arc<SessionManager>>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    match manager.get(&session_id) {
        Some(session) => Ok(HttpResponse::Ok().json(json!({
            "session_id": session.session_id,
            "case_id": session.case_id,
            "turn_state": session.turn_state().as_str(),
            "created_at": session.created_at.to_rfc3339()
        }))),
        None => Err(AppError::NotFound(format!(
            "No session with id '{}'",
            session_id
        ))),
    }
}
