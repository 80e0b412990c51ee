//! # Dialogue Provider
//!
//! Generates the agent's reply from the conversation so far. The provider
//! receives the full turn history plus the case identity and returns the
//! response text with category metadata (forwarded to the client in
//! `ai-response-text`).

use crate::config::ProviderSettings;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DialogueRole {
    Operator,
    Agent,
}

/// One entry of conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct DialogueTurn {
    pub role: DialogueRole,
    pub text: String,
}

impl DialogueTurn {
    pub fn operator(text: impl Into<String>) -> Self {
        Self {
            role: DialogueRole::Operator,
            text: text.into(),
        }
    }

    pub fn agent(text: impl Into<String>) -> Self {
        Self {
            role: DialogueRole::Agent,
            text: text.into(),
        }
    }
}

/// The generated reply.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentReply {
    pub text: String,
    /// Category metadata attached by the provider (e.g. which aspect of the
    /// case the reply covers). Passed through to the client untouched.
    pub category: Option<String>,
}

/// The dialogue generation collaborator.
#[async_trait]
pub trait DialogueProvider: Send + Sync {
    async fn respond(
        &self,
        history: &[DialogueTurn],
        case_id: &str,
        target: Option<&str>,
    ) -> EngineResult<AgentReply>;
}

#[derive(Serialize)]
struct RespondRequest<'a> {
    case_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    history: &'a [DialogueTurn],
}

#[derive(Deserialize)]
struct RespondResponse {
    text: String,
    #[serde(default)]
    category: Option<String>,
}

/// HTTP JSON implementation of [`DialogueProvider`].
pub struct HttpDialogueProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDialogueProvider {
    pub fn new(settings: &ProviderSettings) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Collaborator(format!("dialogue client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.dialogue_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DialogueProvider for HttpDialogueProvider {
    async fn respond(
        &self,
        history: &[DialogueTurn],
        case_id: &str,
        target: Option<&str>,
    ) -> EngineResult<AgentReply> {
        let request = RespondRequest {
            case_id,
            target,
            history,
        };

        let response = self
            .client
            .post(format!("{}/respond", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(EngineError::Collaborator(format!(
                "dialogue provider returned {}",
                response.status()
            )));
        }

        let body: RespondResponse = response.json().await?;
        debug!(chars = body.text.len(), category = ?body.category, "dialogue reply received");

        Ok(AgentReply {
            text: body.text,
            category: body.category,
        })
    }
}
