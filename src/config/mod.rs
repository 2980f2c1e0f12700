//! Configuration for the voice coding assistant core.
//!
//! Priority order (highest to lowest), identical to the teacher's layering:
//! 1. YAML file values
//! 2. Environment variables (actual ENV vars override `.env` values)
//! 3. `.env` file values
//! 4. Defaults
//!
//! Recognized options match §6.3 of the specification.

mod env;
mod yaml;

use std::path::{Path, PathBuf};

use crate::errors::{AppResult, ConfigError};

/// Session-related tunables (§6.3 `session.*`).
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub renewal_margin_seconds: u64,
    pub inactivity_timeout_minutes: u64,
    pub heartbeat_interval_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_backoff_ms: u64,
    /// Resolves Open Question (a): configurable, default 3.
    pub max_concurrent_sessions: usize,
    /// Per-IP mirror of the same cap, for the dev control server's
    /// connection-limit middleware (teacher's `max_connections_per_ip`).
    pub max_connections_per_ip: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renewal_margin_seconds: 10,
            inactivity_timeout_minutes: 5,
            heartbeat_interval_seconds: 30,
            max_retry_attempts: 3,
            retry_backoff_ms: 1000,
            max_concurrent_sessions: 3,
            max_connections_per_ip: 2,
        }
    }
}

/// Turn-taking policy profile, §4.9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolicyProfile {
    #[default]
    Standard,
    Assertive,
    HandsFree,
}

impl PolicyProfile {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "standard" => Some(PolicyProfile::Standard),
            "assertive" => Some(PolicyProfile::Assertive),
            "hands-free" => Some(PolicyProfile::HandsFree),
            _ => None,
        }
    }
}

/// Conversation/turn-taking tunables (§6.3 `conversation.*`).
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationConfig {
    pub policy_profile: PolicyProfile,
    pub allow_barge_in: bool,
    pub interruption_budget_ms: u64,
    pub completion_grace_ms: u64,
    pub speech_stop_debounce_ms: u64,
    /// Open Question (b): fault circuit breaker window, configurable.
    pub fault_window_seconds: u64,
    /// Open Question (b): fault circuit breaker threshold, configurable.
    pub fault_threshold: u32,
    pub fault_cooldown_seconds: u64,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            policy_profile: PolicyProfile::Standard,
            allow_barge_in: true,
            interruption_budget_ms: 500,
            completion_grace_ms: 200,
            speech_stop_debounce_ms: 300,
            fault_window_seconds: 60,
            fault_threshold: 3,
            fault_cooldown_seconds: 120,
        }
    }
}

impl ConversationConfig {
    /// Apply the named policy profile's parameter defaults, per §4.9.
    pub fn with_profile(mut self, profile: PolicyProfile) -> Self {
        self.policy_profile = profile;
        match profile {
            PolicyProfile::Standard => {}
            PolicyProfile::Assertive => {
                self.interruption_budget_ms = self.interruption_budget_ms.min(220);
                self.completion_grace_ms = self.completion_grace_ms.min(120);
            }
            PolicyProfile::HandsFree => {
                self.allow_barge_in = false;
                self.completion_grace_ms = self.completion_grace_ms.max(400);
            }
        }
        self
    }
}

/// Audio tunables (§6.3 `audio.*`).
#[derive(Debug, Clone, PartialEq)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub turn_detection: TurnDetectionMode,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnDetectionMode {
    Server {
        threshold: f32,
        prefix_padding_ms: u32,
        silence_duration_ms: u32,
        eagerness: Option<String>,
        create_response: bool,
    },
    Client,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            turn_detection: TurnDetectionMode::Server {
                threshold: 0.5,
                prefix_padding_ms: 300,
                silence_duration_ms: 500,
                eagerness: None,
                create_response: true,
            },
        }
    }
}

/// Transport tunables (§6.3 `transport.*`).
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    pub ice_servers: Vec<String>,
    pub connection_timeout_ms: u64,
    pub data_channel_name: String,
    pub stats_sample_interval_ms: u64,
    /// Cap on the data-channel fallback queue (§5 back-pressure note).
    pub pending_message_queue_cap: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            connection_timeout_ms: 5000,
            data_channel_name: "realtime-channel".to_string(),
            stats_sample_interval_ms: 5000,
            pending_message_queue_cap: 256,
        }
    }
}

/// Endpoint configuration: the realtime (SDP) endpoint and the credential endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointConfig {
    pub realtime_url: String,
    pub deployment: String,
    pub credential_url: String,
    pub voice: String,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            realtime_url: "https://api.openai.com/v1/realtime".to_string(),
            deployment: "gpt-4o-realtime-preview".to_string(),
            credential_url: "https://api.openai.com/v1/realtime/sessions".to_string(),
            voice: "alloy".to_string(),
        }
    }
}

/// Top-level assistant configuration, analogous to the teacher's `ServerConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantConfig {
    pub endpoint: EndpointConfig,
    pub session: SessionConfig,
    pub conversation: ConversationConfig,
    pub audio: AudioConfig,
    pub transport: TransportConfig,
    /// Long-lived credential used to request ephemeral keys (opaque secret).
    pub api_key: String,
    pub host: String,
    pub port: u16,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            session: SessionConfig::default(),
            conversation: ConversationConfig::default(),
            audio: AudioConfig::default(),
            transport: TransportConfig::default(),
            api_key: String::new(),
            host: "127.0.0.1".to_string(),
            port: 8787,
        }
    }
}

impl AssistantConfig {
    /// Load configuration from a YAML file, with environment variables as the
    /// base layer and `.env` underneath that. Mirrors `ServerConfig::from_file`.
    pub fn from_file(path: &Path) -> AppResult<Self> {
        let base = Self::from_env()?;
        yaml::apply_yaml_overrides(base, path)
    }

    /// Load configuration purely from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> AppResult<Self> {
        env::load_from_env()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.endpoint.realtime_url.parse::<url::Url>().is_err() {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.realtime_url.clone()).into());
        }
        if self.endpoint.credential_url.parse::<url::Url>().is_err() {
            return Err(ConfigError::InvalidEndpoint(self.endpoint.credential_url.clone()).into());
        }
        if !matches!(self.audio.sample_rate, 16000 | 24000 | 48000) {
            return Err(ConfigError::OutOfRange(format!(
                "audio.sampleRate must be 16000, 24000 or 48000, got {}",
                self.audio.sample_rate
            ))
            .into());
        }
        if self.session.max_concurrent_sessions == 0 {
            return Err(ConfigError::OutOfRange(
                "session.maxConcurrentSessions must be at least 1".to_string(),
            )
            .into());
        }
        Ok(())
    }
}

pub(crate) fn expand_path(raw: &str) -> PathBuf {
    PathBuf::from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let mut cfg = AssistantConfig::default();
        cfg.api_key = "test".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_unsupported_sample_rate() {
        let mut cfg = AssistantConfig::default();
        cfg.audio.sample_rate = 44100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_zero_concurrency_cap() {
        let mut cfg = AssistantConfig::default();
        cfg.session.max_concurrent_sessions = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn assertive_profile_clamps_budgets() {
        let cfg = ConversationConfig::default().with_profile(PolicyProfile::Assertive);
        assert!(cfg.interruption_budget_ms <= 220);
        assert!(cfg.completion_grace_ms <= 120);
    }

    #[test]
    fn hands_free_disables_barge_in() {
        let cfg = ConversationConfig::default().with_profile(PolicyProfile::HandsFree);
        assert!(!cfg.allow_barge_in);
        assert!(cfg.completion_grace_ms >= 400);
    }
}
