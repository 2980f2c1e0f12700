//! Ephemeral Credential Service (C2): requests and renews short-lived
//! access tokens from the configured credential endpoint.
//!
//! Grounded in the teacher's provider HTTP clients (`reqwest::Client` POST
//! with bearer auth, JSON body parsing) and the `on_*` callback pattern from
//! `core::realtime::base::BaseRealtime`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::EndpointConfig;
use crate::errors::{AppResult, AuthError};
use crate::events::{AsyncHandler, Emitter, Subscription};

/// §3 `Ephemeral Key Info`.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyInfo {
    pub key: String,
    pub session_id: String,
    pub issued_at: u64,
    pub expires_at: u64,
    pub refresh_at: u64,
    pub is_valid: bool,
}

/// §6.2 wire shape of the credential endpoint response.
#[derive(Debug, Deserialize)]
struct ClientSecret {
    value: String,
    expires_at: u64,
}

#[derive(Debug, Deserialize)]
struct CredentialResponse {
    id: String,
    #[allow(dead_code)]
    model: String,
    #[allow(dead_code)]
    expires_at: u64,
    client_secret: ClientSecret,
}

#[derive(Debug, Clone)]
pub struct KeyResult {
    pub success: bool,
    pub key: Option<KeyInfo>,
    pub error: Option<AuthError>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// C2. One instance serves one session at a time (a fresh instance is
/// created per session by the Session Manager).
pub struct CredentialService {
    http: reqwest::Client,
    endpoint: EndpointConfig,
    api_key: String,
    renewal_margin_seconds: u64,
    current: Mutex<Option<KeyInfo>>,
    renewal_in_flight: Mutex<bool>,
    on_key_renewed: Emitter<KeyInfo>,
    on_key_expired: Emitter<KeyInfo>,
    on_authentication_error: Emitter<AuthError>,
}

impl CredentialService {
    pub fn new(endpoint: EndpointConfig, api_key: String, renewal_margin_seconds: u64) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            api_key,
            renewal_margin_seconds,
            current: Mutex::new(None),
            renewal_in_flight: Mutex::new(false),
            on_key_renewed: Emitter::new(),
            on_key_expired: Emitter::new(),
            on_authentication_error: Emitter::new(),
        }
    }

    pub fn on_key_renewed(&self, handler: AsyncHandler<KeyInfo>) -> Subscription<KeyInfo> {
        self.on_key_renewed.subscribe(handler)
    }

    pub fn on_key_expired(&self, handler: AsyncHandler<KeyInfo>) -> Subscription<KeyInfo> {
        self.on_key_expired.subscribe(handler)
    }

    pub fn on_authentication_error(&self, handler: AsyncHandler<AuthError>) -> Subscription<AuthError> {
        self.on_authentication_error.subscribe(handler)
    }

    pub fn get_current_key(&self) -> Option<KeyInfo> {
        self.current.lock().clone()
    }

    /// Requests a fresh ephemeral key. Used both for the initial session
    /// start and, internally, by `renew_key`.
    pub async fn request_ephemeral_key(&self) -> KeyResult {
        {
            let mut in_flight = self.renewal_in_flight.lock();
            if *in_flight {
                return KeyResult {
                    success: false,
                    key: None,
                    error: Some(AuthError::InvalidCredential),
                };
            }
            *in_flight = true;
        }

        let result = self.fetch_key().await;

        *self.renewal_in_flight.lock() = false;

        match result {
            Ok(key) => {
                *self.current.lock() = Some(key.clone());
                info!(session_id = %key.session_id, "ephemeral key issued");
                self.on_key_renewed.emit(key.clone()).await;
                KeyResult {
                    success: true,
                    key: Some(key),
                    error: None,
                }
            }
            Err(err) => {
                warn!(error = %err, "ephemeral key request failed");
                self.on_authentication_error.emit(err.clone()).await;
                KeyResult {
                    success: false,
                    key: None,
                    error: Some(err),
                }
            }
        }
    }

    /// `renewKey` — identical wire contract to the initial request; kept as
    /// a distinct method so the Retry Executor can apply a renewal-specific
    /// envelope and so callers express intent clearly.
    pub async fn renew_key(&self) -> KeyResult {
        self.request_ephemeral_key().await
    }

    async fn fetch_key(&self) -> Result<KeyInfo, AuthError> {
        let response = self
            .http
            .post(&self.endpoint.credential_url)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "model": self.endpoint.deployment }))
            .send()
            .await
            .map_err(|e| AuthError::EndpointError {
                status: 0,
                body: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::InvalidCredential);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::EndpointError {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: CredentialResponse = response.json().await.map_err(|e| AuthError::EndpointError {
            status: status.as_u16(),
            body: e.to_string(),
        })?;

        let issued_at = now_ms();
        let expires_at = parsed.client_secret.expires_at * 1000;
        let refresh_at = expires_at.saturating_sub(self.renewal_margin_seconds * 1000);

        Ok(KeyInfo {
            key: parsed.client_secret.value,
            session_id: parsed.id,
            issued_at,
            expires_at,
            refresh_at,
            is_valid: true,
        })
    }

    /// Notifies listeners that the current key expired without successful
    /// renewal (invoked by the Session Manager after the Retry Executor
    /// exhausts `maxAttempts` on `renew_key`).
    pub async fn notify_key_expired(&self) {
        if let Some(mut key) = self.current.lock().clone() {
            key.is_valid = false;
            self.on_key_expired.emit(key).await;
        }
    }

    /// `endSession` counterpart: invalidates and drops the current key so no
    /// further renewal attempt can reuse it. Invoked by the Session Manager
    /// as part of its own `end_session`.
    pub async fn end_session(&self) {
        if let Some(key) = self.current.lock().take() {
            info!(session_id = %key.session_id, "credential service session ended");
        }
    }
}

pub type SharedCredentialService = Arc<CredentialService>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_at_is_before_expiry() {
        let info = KeyInfo {
            key: "k".into(),
            session_id: "s".into(),
            issued_at: 0,
            expires_at: 60_000,
            refresh_at: 50_000,
            is_valid: true,
        };
        assert!(info.refresh_at < info.expires_at);
    }

    #[tokio::test]
    async fn concurrent_request_is_rejected_while_one_in_flight() {
        let service = CredentialService::new(
            EndpointConfig::default(),
            "secret".to_string(),
            10,
        );
        *service.renewal_in_flight.lock() = true;
        let result = service.request_ephemeral_key().await;
        assert!(!result.success);
    }
}
