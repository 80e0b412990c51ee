//! # Speech Provider
//!
//! Recognition and synthesis behind one trait: the same collaborator that
//! transcribes operator utterances also synthesizes the agent's reply,
//! returning it as one or more chunks tagged with per-utterance sequence
//! indices. Transport encoding on the wire is base64 over JSON.

use crate::config::ProviderSettings;
use crate::engine::sequencer::SynthesizedChunk;
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Result of recognizing one operator utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: f32,
}

/// The recognition/synthesis collaborator.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Transcribe one encoded operator utterance.
    async fn transcribe(&self, audio: &[u8], sample_rate: u32) -> EngineResult<Transcript>;

    /// Synthesize the agent's reply. Chunks may describe the utterance out
    /// of order; each carries its sequence index when the provider assigns
    /// one.
    async fn synthesize(&self, text: &str) -> EngineResult<Vec<SynthesizedChunk>>;
}

#[derive(Serialize)]
struct TranscribeRequest<'a> {
    audio: String,
    sample_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    language: Option<&'a str>,
}

#[derive(Deserialize)]
struct TranscribeResponse {
    text: String,
    #[serde(default)]
    confidence: f32,
}

#[derive(Serialize)]
struct SynthesizeRequest<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct SynthesizeResponse {
    chunks: Vec<WireChunk>,
}

/// One synthesized fragment as the provider describes it.
#[derive(Deserialize)]
struct WireChunk {
    audio: String,
    #[serde(default)]
    sentence_index: Option<u32>,
    #[serde(default)]
    is_final: bool,
}

/// HTTP JSON implementation of [`SpeechProvider`].
pub struct HttpSpeechProvider {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpeechProvider {
    pub fn new(settings: &ProviderSettings) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::Collaborator(format!("speech client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.speech_url.trim_end_matches('/').to_string(),
        })
    }

    fn check_status(response: &reqwest::Response, operation: &str) -> EngineResult<()> {
        if !response.status().is_success() {
            return Err(EngineError::Collaborator(format!(
                "speech provider {} returned {}",
                operation,
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechProvider for HttpSpeechProvider {
    async fn transcribe(&self, audio: &[u8], sample_rate: u32) -> EngineResult<Transcript> {
        let request = TranscribeRequest {
            audio: BASE64.encode(audio),
            sample_rate,
            language: None,
        };

        let response = self
            .client
            .post(format!("{}/transcribe", self.base_url))
            .json(&request)
            .send()
            .await?;
        Self::check_status(&response, "transcribe")?;

        let body: TranscribeResponse = response.json().await?;
        debug!(chars = body.text.len(), "transcription received");

        Ok(Transcript {
            text: body.text,
            confidence: body.confidence,
        })
    }

    async fn synthesize(&self, text: &str) -> EngineResult<Vec<SynthesizedChunk>> {
        let response = self
            .client
            .post(format!("{}/synthesize", self.base_url))
            .json(&SynthesizeRequest { text })
            .send()
            .await?;
        Self::check_status(&response, "synthesize")?;

        let body: SynthesizeResponse = response.json().await?;
        debug!(chunks = body.chunks.len(), "synthesis received");

        body.chunks
            .into_iter()
            .map(|chunk| {
                let payload = BASE64.decode(&chunk.audio).map_err(|e| {
                    EngineError::Collaborator(format!("undecodable synthesis payload: {}", e))
                })?;
                Ok(SynthesizedChunk {
                    payload,
                    sequence_index: chunk.sentence_index,
                    end_of_utterance: chunk.is_final,
                })
            })
            .collect()
    }
}
