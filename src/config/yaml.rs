//! YAML override layer of configuration loading.
//!
//! All fields are optional: a present field overrides the environment-derived
//! base, absent fields leave the base untouched. Mirrors the teacher's
//! `YamlConfig` partial-override pattern.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::{AssistantConfig, PolicyProfile, TurnDetectionMode};
use crate::errors::{AppResult, ConfigError};

#[derive(Debug, Default, Deserialize)]
struct YamlEndpoint {
    realtime_url: Option<String>,
    deployment: Option<String>,
    credential_url: Option<String>,
    voice: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlSession {
    renewal_margin_seconds: Option<u64>,
    inactivity_timeout_minutes: Option<u64>,
    heartbeat_interval_seconds: Option<u64>,
    max_retry_attempts: Option<u32>,
    retry_backoff_ms: Option<u64>,
    max_concurrent_sessions: Option<usize>,
    max_connections_per_ip: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlConversation {
    policy_profile: Option<String>,
    allow_barge_in: Option<bool>,
    interruption_budget_ms: Option<u64>,
    completion_grace_ms: Option<u64>,
    speech_stop_debounce_ms: Option<u64>,
    fault_window_seconds: Option<u64>,
    fault_threshold: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlTurnDetection {
    mode: Option<String>,
    threshold: Option<f32>,
    prefix_padding_ms: Option<u32>,
    silence_duration_ms: Option<u32>,
    eagerness: Option<String>,
    create_response: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlAudio {
    sample_rate: Option<u32>,
    turn_detection: Option<YamlTurnDetection>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlTransport {
    ice_servers: Option<Vec<String>>,
    connection_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct YamlConfig {
    host: Option<String>,
    port: Option<u16>,
    api_key: Option<String>,
    endpoint: Option<YamlEndpoint>,
    session: Option<YamlSession>,
    conversation: Option<YamlConversation>,
    audio: Option<YamlAudio>,
    transport: Option<YamlTransport>,
}

pub(super) fn apply_yaml_overrides(mut base: AssistantConfig, path: &Path) -> AppResult<AssistantConfig> {
    let raw = fs::read_to_string(path).map_err(|e| {
        ConfigError::InvalidEndpoint(format!("failed to read {}: {e}", path.display()))
    })?;
    let yaml: YamlConfig = serde_yaml::from_str(&raw)
        .map_err(|e| ConfigError::InvalidEndpoint(format!("invalid YAML in {}: {e}", path.display())))?;

    if let Some(host) = yaml.host {
        base.host = host;
    }
    if let Some(port) = yaml.port {
        base.port = port;
    }
    if let Some(api_key) = yaml.api_key {
        base.api_key = api_key;
    }

    if let Some(e) = yaml.endpoint {
        if let Some(v) = e.realtime_url {
            base.endpoint.realtime_url = v;
        }
        if let Some(v) = e.deployment {
            base.endpoint.deployment = v;
        }
        if let Some(v) = e.credential_url {
            base.endpoint.credential_url = v;
        }
        if let Some(v) = e.voice {
            base.endpoint.voice = v;
        }
    }

    if let Some(s) = yaml.session {
        if let Some(v) = s.renewal_margin_seconds {
            base.session.renewal_margin_seconds = v;
        }
        if let Some(v) = s.inactivity_timeout_minutes {
            base.session.inactivity_timeout_minutes = v;
        }
        if let Some(v) = s.heartbeat_interval_seconds {
            base.session.heartbeat_interval_seconds = v;
        }
        if let Some(v) = s.max_retry_attempts {
            base.session.max_retry_attempts = v;
        }
        if let Some(v) = s.retry_backoff_ms {
            base.session.retry_backoff_ms = v;
        }
        if let Some(v) = s.max_concurrent_sessions {
            base.session.max_concurrent_sessions = v;
        }
        if let Some(v) = s.max_connections_per_ip {
            base.session.max_connections_per_ip = v;
        }
    }

    if let Some(c) = yaml.conversation {
        if let Some(v) = c.allow_barge_in {
            base.conversation.allow_barge_in = v;
        }
        if let Some(v) = c.interruption_budget_ms {
            base.conversation.interruption_budget_ms = v;
        }
        if let Some(v) = c.completion_grace_ms {
            base.conversation.completion_grace_ms = v;
        }
        if let Some(v) = c.speech_stop_debounce_ms {
            base.conversation.speech_stop_debounce_ms = v;
        }
        if let Some(v) = c.fault_window_seconds {
            base.conversation.fault_window_seconds = v;
        }
        if let Some(v) = c.fault_threshold {
            base.conversation.fault_threshold = v;
        }
        if let Some(profile_str) = c.policy_profile {
            let profile = PolicyProfile::parse(&profile_str).ok_or_else(|| {
                ConfigError::OutOfRange(format!("unknown conversation.policyProfile: {profile_str}"))
            })?;
            base.conversation = base.conversation.with_profile(profile);
        }
    }

    if let Some(a) = yaml.audio {
        if let Some(v) = a.sample_rate {
            base.audio.sample_rate = v;
        }
        if let Some(td) = a.turn_detection {
            if td.mode.as_deref() == Some("client") {
                base.audio.turn_detection = TurnDetectionMode::Client;
            } else if let TurnDetectionMode::Server {
                threshold,
                prefix_padding_ms,
                silence_duration_ms,
                eagerness,
                create_response,
            } = &mut base.audio.turn_detection
            {
                if let Some(v) = td.threshold {
                    *threshold = v;
                }
                if let Some(v) = td.prefix_padding_ms {
                    *prefix_padding_ms = v;
                }
                if let Some(v) = td.silence_duration_ms {
                    *silence_duration_ms = v;
                }
                if td.eagerness.is_some() {
                    *eagerness = td.eagerness;
                }
                if let Some(v) = td.create_response {
                    *create_response = v;
                }
            }
        }
    }

    if let Some(t) = yaml.transport {
        if let Some(v) = t.ice_servers {
            base.transport.ice_servers = v;
        }
        if let Some(v) = t.connection_timeout_ms {
            base.transport.connection_timeout_ms = v;
        }
    }

    base.validate()?;
    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn yaml_overrides_selected_fields_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "host: 0.0.0.0\nport: 9999\nsession:\n  max_concurrent_sessions: 5\n"
        )
        .unwrap();

        let mut base = AssistantConfig::default();
        base.api_key = "k".to_string();
        let merged = apply_yaml_overrides(base, file.path()).unwrap();

        assert_eq!(merged.host, "0.0.0.0");
        assert_eq!(merged.port, 9999);
        assert_eq!(merged.session.max_concurrent_sessions, 5);
        // untouched field keeps its default
        assert_eq!(merged.endpoint.voice, "alloy");
    }

    #[test]
    fn yaml_rejects_unknown_policy_profile() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "conversation:\n  policy_profile: bogus\n").unwrap();
        let mut base = AssistantConfig::default();
        base.api_key = "k".to_string();
        assert!(apply_yaml_overrides(base, file.path()).is_err());
    }
}
