//! # Configuration Management
//!
//! Loads and manages application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (APP_SERVER_HOST, APP_SESSIONS_ORDERING, etc.)
//! 2. Configuration file (config.toml)
//! 3. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::engine::sequencer::OrderingPolicy;

/// Main application configuration that contains all settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioSettings,
    pub sessions: SessionSettings,
    pub providers: ProviderSettings,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: accept connections from any address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Audio format settings, fixed for the lifetime of a session.
///
/// Capture and playback run at independent sample rates: the recognition
/// collaborator expects 16 kHz operator audio while the synthesis
/// collaborator produces 24 kHz agent audio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    /// Sample rate of operator (capture-direction) audio in Hz
    pub capture_sample_rate: u32,

    /// Sample rate of agent (playback-direction) audio in Hz
    pub playback_sample_rate: u32,

    /// Number of audio channels (mono for speech)
    pub channels: u8,

    /// Bit depth (16-bit signed little-endian PCM)
    pub bit_depth: u8,

    /// Cap on a single operator utterance, in milliseconds. Audio past this
    /// length is discarded oldest-first to bound memory.
    pub max_utterance_ms: u32,
}

/// Session engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Maximum number of concurrent voice sessions
    pub max_concurrent_sessions: usize,

    /// Chunk ordering policy: "strict" buffers out-of-order synthesis
    /// chunks until their predecessors arrive; "immediate" releases every
    /// chunk on arrival, trading ordering for latency.
    pub ordering: String,
}

/// Endpoints and timeouts for the external inference collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Base URL of the speech recognition/synthesis provider
    pub speech_url: String,

    /// Base URL of the dialogue generation provider
    pub dialogue_url: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            audio: AudioSettings {
                capture_sample_rate: 16000,
                playback_sample_rate: 24000,
                channels: 1,
                bit_depth: 16,
                max_utterance_ms: 30_000,
            },
            sessions: SessionSettings {
                max_concurrent_sessions: 10,
                ordering: "strict".to_string(),
            },
            providers: ProviderSettings {
                speech_url: "http://127.0.0.1:9100".to_string(),
                dialogue_url: "http://127.0.0.1:9200".to_string(),
                request_timeout_secs: 30,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, config.toml, and environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER_PORT=3000`: override server port
    /// - `APP_SESSIONS_ORDERING=immediate`: low-latency chunk release
    /// - `HOST` / `PORT`: deployment-platform overrides (no APP_ prefix)
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("_"));

        // Deployment platforms commonly inject these without a prefix.
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.sessions.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.bit_depth != 16 {
            return Err(anyhow::anyhow!(
                "Only 16-bit PCM is supported, got {}-bit",
                self.audio.bit_depth
            ));
        }

        if self.audio.channels != 1 {
            return Err(anyhow::anyhow!(
                "Only mono audio is supported, got {} channels",
                self.audio.channels
            ));
        }

        if self.audio.max_utterance_ms == 0 {
            return Err(anyhow::anyhow!("Max utterance length must be greater than 0"));
        }

        self.sessions
            .ordering
            .parse::<OrderingPolicy>()
            .map_err(|e| anyhow::anyhow!(e))?;

        if self.providers.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Provider timeout must be greater than 0"));
        }

        Ok(())
    }

    /// The parsed chunk ordering policy. Call after `validate()`.
    pub fn ordering_policy(&self) -> OrderingPolicy {
        self.sessions
            .ordering
            .parse()
            .unwrap_or(OrderingPolicy::Strict)
    }

    /// Update configuration from a JSON string (runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present in the JSON are touched. For example
    /// `{"sessions": {"ordering": "immediate"}}` changes just the ordering
    /// policy. The merged configuration is validated before being accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(audio) = partial_config.get("audio") {
            if let Some(rate) = audio.get("capture_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.capture_sample_rate = rate as u32;
            }
            if let Some(rate) = audio.get("playback_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.playback_sample_rate = rate as u32;
            }
            if let Some(ms) = audio.get("max_utterance_ms").and_then(|v| v.as_u64()) {
                self.audio.max_utterance_ms = ms as u32;
            }
        }

        if let Some(sessions) = partial_config.get("sessions") {
            if let Some(max) = sessions.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.sessions.max_concurrent_sessions = max as usize;
            }
            if let Some(ordering) = sessions.get("ordering").and_then(|v| v.as_str()) {
                self.sessions.ordering = ordering.to_string();
            }
        }

        if let Some(providers) = partial_config.get("providers") {
            if let Some(url) = providers.get("speech_url").and_then(|v| v.as_str()) {
                self.providers.speech_url = url.to_string();
            }
            if let Some(url) = providers.get("dialogue_url").and_then(|v| v.as_str()) {
                self.providers.dialogue_url = url.to_string();
            }
            if let Some(secs) = providers.get("request_timeout_secs").and_then(|v| v.as_u64()) {
                self.providers.request_timeout_secs = secs;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.audio.capture_sample_rate, 16000);
        assert_eq!(config.audio.playback_sample_rate, 24000);
        assert_eq!(config.ordering_policy(), OrderingPolicy::Strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sessions.ordering = "shuffled".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.audio.bit_depth = 24;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"sessions": {"ordering": "immediate"}, "server": {"port": 9090}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.ordering_policy(), OrderingPolicy::Immediate);
        // Untouched fields keep their values
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[test]
    fn test_invalid_update_rejected() {
        let mut config = AppConfig::default();
        let json = r#"{"sessions": {"max_concurrent_sessions": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }
}
