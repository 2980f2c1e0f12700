//! Environment-variable layer of configuration loading.
//!
//! Loaded after `.env` (via `dotenvy::dotenv()` in `main.rs`) so that real
//! process environment variables take precedence over `.env` file contents,
//! and before any YAML override.

use std::env;

use super::{
    AssistantConfig, AudioConfig, ConversationConfig, EndpointConfig, PolicyProfile,
    SessionConfig, TransportConfig, TurnDetectionMode,
};
use crate::errors::AppResult;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f32(key: &str, default: f32) -> f32 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn load_from_env() -> AppResult<AssistantConfig> {
    let defaults = AssistantConfig::default();

    let endpoint = EndpointConfig {
        realtime_url: env_string("REALTIME_ENDPOINT_URL", &defaults.endpoint.realtime_url),
        deployment: env_string("REALTIME_DEPLOYMENT", &defaults.endpoint.deployment),
        credential_url: env_string("CREDENTIAL_ENDPOINT_URL", &defaults.endpoint.credential_url),
        voice: env_string("REALTIME_VOICE", &defaults.endpoint.voice),
    };

    let session = SessionConfig {
        renewal_margin_seconds: env_u64(
            "SESSION_RENEWAL_MARGIN_SECONDS",
            defaults.session.renewal_margin_seconds,
        ),
        inactivity_timeout_minutes: env_u64(
            "SESSION_INACTIVITY_TIMEOUT_MINUTES",
            defaults.session.inactivity_timeout_minutes,
        ),
        heartbeat_interval_seconds: env_u64(
            "SESSION_HEARTBEAT_INTERVAL_SECONDS",
            defaults.session.heartbeat_interval_seconds,
        ),
        max_retry_attempts: env_u32(
            "SESSION_MAX_RETRY_ATTEMPTS",
            defaults.session.max_retry_attempts,
        ),
        retry_backoff_ms: env_u64("SESSION_RETRY_BACKOFF_MS", defaults.session.retry_backoff_ms),
        max_concurrent_sessions: env_u64(
            "SESSION_MAX_CONCURRENT_SESSIONS",
            defaults.session.max_concurrent_sessions as u64,
        ) as usize,
        max_connections_per_ip: env_u64(
            "SESSION_MAX_CONNECTIONS_PER_IP",
            defaults.session.max_connections_per_ip as u64,
        ) as usize,
    };

    let policy_profile = env::var("CONVERSATION_POLICY_PROFILE")
        .ok()
        .and_then(|v| PolicyProfile::parse(&v))
        .unwrap_or(defaults.conversation.policy_profile);

    let conversation = ConversationConfig {
        allow_barge_in: env_bool("CONVERSATION_ALLOW_BARGE_IN", defaults.conversation.allow_barge_in),
        interruption_budget_ms: env_u64(
            "CONVERSATION_INTERRUPTION_BUDGET_MS",
            defaults.conversation.interruption_budget_ms,
        ),
        completion_grace_ms: env_u64(
            "CONVERSATION_COMPLETION_GRACE_MS",
            defaults.conversation.completion_grace_ms,
        ),
        speech_stop_debounce_ms: env_u64(
            "CONVERSATION_SPEECH_STOP_DEBOUNCE_MS",
            defaults.conversation.speech_stop_debounce_ms,
        ),
        fault_window_seconds: env_u64(
            "CONVERSATION_FAULT_WINDOW_SECONDS",
            defaults.conversation.fault_window_seconds,
        ),
        fault_threshold: env_u32(
            "CONVERSATION_FAULT_THRESHOLD",
            defaults.conversation.fault_threshold,
        ),
        fault_cooldown_seconds: env_u64(
            "CONVERSATION_FAULT_COOLDOWN_SECONDS",
            defaults.conversation.fault_cooldown_seconds,
        ),
        policy_profile,
    }
    .with_profile(policy_profile);

    let sample_rate = env_u32("AUDIO_SAMPLE_RATE", defaults.audio.sample_rate);
    let audio = AudioConfig {
        sample_rate,
        turn_detection: match env::var("AUDIO_TURN_DETECTION_MODE").as_deref() {
            Ok("client") => TurnDetectionMode::Client,
            _ => TurnDetectionMode::Server {
                threshold: env_f32("AUDIO_TURN_DETECTION_THRESHOLD", 0.5),
                prefix_padding_ms: env_u32("AUDIO_TURN_DETECTION_PREFIX_PADDING_MS", 300),
                silence_duration_ms: env_u32("AUDIO_TURN_DETECTION_SILENCE_DURATION_MS", 500),
                eagerness: env::var("AUDIO_TURN_DETECTION_EAGERNESS").ok(),
                create_response: env_bool("AUDIO_TURN_DETECTION_CREATE_RESPONSE", true),
            },
        },
    };

    let ice_servers = env::var("TRANSPORT_ICE_SERVERS")
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|| defaults.transport.ice_servers.clone());

    let transport = TransportConfig {
        ice_servers,
        connection_timeout_ms: env_u64(
            "TRANSPORT_CONNECTION_TIMEOUT_MS",
            defaults.transport.connection_timeout_ms,
        ),
        data_channel_name: env_string(
            "TRANSPORT_DATA_CHANNEL_NAME",
            &defaults.transport.data_channel_name,
        ),
        stats_sample_interval_ms: env_u64(
            "TRANSPORT_STATS_SAMPLE_INTERVAL_MS",
            defaults.transport.stats_sample_interval_ms,
        ),
        pending_message_queue_cap: env_u64(
            "TRANSPORT_PENDING_QUEUE_CAP",
            defaults.transport.pending_message_queue_cap as u64,
        ) as usize,
    };

    Ok(AssistantConfig {
        endpoint,
        session,
        conversation,
        audio,
        transport,
        api_key: env_string("REALTIME_API_KEY", &defaults.api_key),
        host: env_string("HOST", &defaults.host),
        port: env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.port),
    })
}
