//! Crate-wide error taxonomy.
//!
//! Mirrors the fault domains of the specification's error handling design:
//! `auth`, `transport`, `session`, `config`, `state`. Each domain has its own
//! `thiserror` enum (the shape `core::realtime::base::RealtimeError` uses in
//! the teacher crate); [`AppError`] aggregates them and exposes the
//! `{code, message, is_retryable, remediation}` view that session listeners
//! are guaranteed to receive.

use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Authentication / credential domain errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("invalid credential")]
    InvalidCredential,
    #[error("ephemeral token expired")]
    TokenExpired,
    #[error("insufficient permissions")]
    InsufficientPermissions,
    #[error("credential endpoint returned {status}: {body}")]
    EndpointError { status: u16, body: String },
}

impl AuthError {
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AuthError::InvalidCredential | AuthError::InsufficientPermissions
        )
    }
}

/// Transport (WebRTC) domain errors. Named after `WebRTCErrorCode` in §4.6.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("authentication failed during SDP exchange")]
    AuthenticationFailed,
    #[error("SDP negotiation failed: {0}")]
    SdpNegotiationFailed(String),
    #[error("ICE connection failed")]
    IceConnectionFailed,
    #[error("network timeout")]
    NetworkTimeout,
    #[error("data channel failed: {0}")]
    DataChannelFailed(String),
    #[error("audio track failed: {0}")]
    AudioTrackFailed(String),
    #[error("region not supported")]
    RegionNotSupported,
    #[error("invalid transport configuration: {0}")]
    ConfigurationInvalid(String),
}

impl TransportError {
    /// Recoverable per §4.6: `{NetworkTimeout, IceConnectionFailed, DataChannelFailed}`.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TransportError::NetworkTimeout
                | TransportError::IceConnectionFailed
                | TransportError::DataChannelFailed(_)
        )
    }
}

/// Session domain errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("concurrent session cap reached")]
    CapacityExceeded,
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session renewal failed: {0}")]
    RenewalFailed(String),
    #[error("session ended due to inactivity")]
    InactivityTimeout,
}

/// Configuration domain errors; all fatal at startup per §7.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("value out of range: {0}")]
    OutOfRange(String),
    #[error("unsupported region: {0}")]
    UnsupportedRegion(String),
}

/// Conversation state-machine domain errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("circuit open")]
    CircuitOpen,
    #[error("illegal transition from {from} on {input}")]
    IllegalTransition { from: String, input: String },
}

/// Aggregated crate error. Every fallible public operation returns `AppResult<T>`.
#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
}

pub type AppResult<T> = Result<T, AppError>;

/// The `{code, message, isRetryable, remediation, timestamp, context?}` shape
/// that session error listeners receive, per §7 ("the user-facing remediation
/// string is mandatory").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ErrorDescriptor {
    pub code: String,
    pub message: String,
    pub is_retryable: bool,
    pub remediation: String,
    pub timestamp: u64,
    pub context: Option<String>,
}

impl AppError {
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Auth(e) => !e.is_fatal(),
            AppError::Transport(e) => e.is_recoverable(),
            AppError::Session(_) => false,
            AppError::Config(_) => false,
            AppError::State(StateError::CircuitOpen) => false,
            AppError::State(StateError::IllegalTransition { .. }) => false,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            AppError::Auth(AuthError::InvalidCredential) => "AUTH_INVALID_CREDENTIAL",
            AppError::Auth(AuthError::TokenExpired) => "AUTH_TOKEN_EXPIRED",
            AppError::Auth(AuthError::InsufficientPermissions) => "AUTH_INSUFFICIENT_PERMISSIONS",
            AppError::Auth(AuthError::EndpointError { .. }) => "AUTH_ENDPOINT_ERROR",
            AppError::Transport(TransportError::AuthenticationFailed) => {
                "TRANSPORT_AUTH_FAILED"
            }
            AppError::Transport(TransportError::SdpNegotiationFailed(_)) => "TRANSPORT_SDP_FAILED",
            AppError::Transport(TransportError::IceConnectionFailed) => "TRANSPORT_ICE_FAILED",
            AppError::Transport(TransportError::NetworkTimeout) => "TRANSPORT_NETWORK_TIMEOUT",
            AppError::Transport(TransportError::DataChannelFailed(_)) => {
                "TRANSPORT_DATA_CHANNEL_FAILED"
            }
            AppError::Transport(TransportError::AudioTrackFailed(_)) => {
                "TRANSPORT_AUDIO_TRACK_FAILED"
            }
            AppError::Transport(TransportError::RegionNotSupported) => {
                "TRANSPORT_REGION_NOT_SUPPORTED"
            }
            AppError::Transport(TransportError::ConfigurationInvalid(_)) => {
                "TRANSPORT_CONFIG_INVALID"
            }
            AppError::Session(SessionError::CapacityExceeded) => "SESSION_CAPACITY_EXCEEDED",
            AppError::Session(SessionError::NotFound(_)) => "SESSION_NOT_FOUND",
            AppError::Session(SessionError::RenewalFailed(_)) => "SESSION_RENEWAL_FAILED",
            AppError::Session(SessionError::InactivityTimeout) => "SESSION_INACTIVITY_TIMEOUT",
            AppError::Config(ConfigError::InvalidEndpoint(_)) => "CONFIG_INVALID_ENDPOINT",
            AppError::Config(ConfigError::OutOfRange(_)) => "CONFIG_OUT_OF_RANGE",
            AppError::Config(ConfigError::UnsupportedRegion(_)) => "CONFIG_UNSUPPORTED_REGION",
            AppError::State(StateError::CircuitOpen) => "STATE_CIRCUIT_OPEN",
            AppError::State(StateError::IllegalTransition { .. }) => "STATE_ILLEGAL_TRANSITION",
        }
    }

    fn remediation(&self) -> &'static str {
        match self {
            AppError::Auth(AuthError::InvalidCredential) => {
                "Check the configured long-lived credential and reconfigure the extension."
            }
            AppError::Auth(AuthError::TokenExpired) => {
                "A renewal is already scheduled; no action needed unless this repeats."
            }
            AppError::Auth(AuthError::InsufficientPermissions) => {
                "The configured credential lacks access to this deployment; contact your administrator."
            }
            AppError::Auth(AuthError::EndpointError { .. }) => {
                "The credential endpoint is unreachable or rejected the request; retry shortly."
            }
            AppError::Transport(TransportError::AuthenticationFailed) => {
                "The ephemeral key was rejected; a new session will be requested automatically."
            }
            AppError::Transport(TransportError::SdpNegotiationFailed(_)) => {
                "The realtime endpoint rejected the connection offer; check the deployment name and region."
            }
            AppError::Transport(TransportError::IceConnectionFailed) => {
                "Network connectivity to the realtime endpoint was lost; reconnecting."
            }
            AppError::Transport(TransportError::NetworkTimeout) => {
                "The network is slow or unreachable; reconnecting."
            }
            AppError::Transport(TransportError::DataChannelFailed(_)) => {
                "The data channel closed unexpectedly; recreating it."
            }
            AppError::Transport(TransportError::AudioTrackFailed(_)) => {
                "The audio track could not be attached; check microphone permissions."
            }
            AppError::Transport(TransportError::RegionNotSupported) => {
                "This region does not support the realtime endpoint; choose a supported region."
            }
            AppError::Transport(TransportError::ConfigurationInvalid(_)) => {
                "Review the transport configuration (ICE servers, timeouts)."
            }
            AppError::Session(SessionError::CapacityExceeded) => {
                "Close an existing voice session before starting another."
            }
            AppError::Session(SessionError::NotFound(_)) => "No action needed.",
            AppError::Session(SessionError::RenewalFailed(_)) => {
                "The session could not renew its credential and has ended; start a new session."
            }
            AppError::Session(SessionError::InactivityTimeout) => {
                "The session ended after a period of inactivity; start a new session to continue."
            }
            AppError::Config(ConfigError::InvalidEndpoint(_)) => {
                "Fix the configured endpoint URL."
            }
            AppError::Config(ConfigError::OutOfRange(_)) => {
                "Adjust the configuration value to within its supported range."
            }
            AppError::Config(ConfigError::UnsupportedRegion(_)) => {
                "Choose a region supported by the realtime endpoint."
            }
            AppError::State(StateError::CircuitOpen) => {
                "Too many faults occurred recently; the assistant will resume automatically after cooldown."
            }
            AppError::State(StateError::IllegalTransition { .. }) => {
                "This is an internal coordination error; restarting the session should resolve it."
            }
        }
    }

    pub fn descriptor(&self) -> ErrorDescriptor {
        ErrorDescriptor {
            code: self.code().to_string(),
            message: self.to_string(),
            is_retryable: self.is_retryable(),
            remediation: self.remediation().to_string(),
            timestamp: now_unix_ms(),
            context: None,
        }
    }

    pub fn descriptor_with_context(&self, context: impl Into<String>) -> ErrorDescriptor {
        let mut d = self.descriptor();
        d.context = Some(context.into());
        d
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_fatal_classification() {
        assert!(AuthError::InvalidCredential.is_fatal());
        assert!(AuthError::InsufficientPermissions.is_fatal());
        assert!(!AuthError::TokenExpired.is_fatal());
    }

    #[test]
    fn transport_recoverable_classification() {
        assert!(TransportError::NetworkTimeout.is_recoverable());
        assert!(TransportError::IceConnectionFailed.is_recoverable());
        assert!(TransportError::DataChannelFailed("x".into()).is_recoverable());
        assert!(!TransportError::SdpNegotiationFailed("x".into()).is_recoverable());
        assert!(!TransportError::RegionNotSupported.is_recoverable());
    }

    #[test]
    fn descriptor_always_has_remediation() {
        let err: AppError = SessionError::CapacityExceeded.into();
        let d = err.descriptor();
        assert!(!d.remediation.is_empty());
        assert_eq!(d.code, "SESSION_CAPACITY_EXCEEDED");
        assert!(!d.is_retryable);
    }

    #[test]
    fn session_capacity_exceeded_is_fatal_not_retried() {
        let err: AppError = SessionError::CapacityExceeded.into();
        assert!(!err.is_retryable());
    }
}
