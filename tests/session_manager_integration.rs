//! Integration coverage for the Session Manager against a mocked credential
//! endpoint, exercising P1 (the concurrent-session cap) end-to-end rather
//! than against the counting helper alone.

use std::sync::Arc;

use serial_test::serial;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use voicecopilot_core::config::AssistantConfig;
use voicecopilot_core::core::session::SessionManager;
use voicecopilot_core::core::timers::TimerManager;
use voicecopilot_core::errors::{AppError, SessionError};

async fn mocked_config(server: &MockServer, max_concurrent_sessions: usize) -> AssistantConfig {
    let mut cfg = AssistantConfig::default();
    cfg.api_key = "test-secret".to_string();
    cfg.endpoint.credential_url = format!("{}/sessions", server.uri());
    cfg.session.max_concurrent_sessions = max_concurrent_sessions;
    cfg
}

fn credential_response_body(id: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "model": "gpt-4o-realtime-preview",
        "expires_at": 9_999_999_999u64,
        "client_secret": { "value": format!("ek_{id}"), "expires_at": 9_999_999_999u64 },
    })
}

#[tokio::test]
#[serial]
async fn p1_capacity_cap_rejects_beyond_n_max() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(credential_response_body("sess-1")))
        .mount(&server)
        .await;

    let config = mocked_config(&server, 2).await;
    let manager = SessionManager::new(&config, Arc::new(TimerManager::new()));

    let first = manager.start_session().await.expect("first session starts");
    let second = manager.start_session().await.expect("second session starts");
    assert_ne!(first.session_id, second.session_id);

    let third = manager.start_session().await;
    match third {
        Err(AppError::Session(SessionError::CapacityExceeded)) => {}
        other => panic!("expected capacity-exceeded, got {other:?}"),
    }

    manager.end_session(&first.session_id).await;
    let fourth = manager
        .start_session()
        .await
        .expect("a freed slot admits a new session");
    assert_ne!(fourth.session_id, second.session_id);
}

#[tokio::test]
#[serial]
async fn credential_endpoint_auth_failure_surfaces_as_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/sessions"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let config = mocked_config(&server, 1).await;
    let manager = SessionManager::new(&config, Arc::new(TimerManager::new()));
    let result = manager.start_session().await;
    assert!(result.is_err());
    assert!(!result.unwrap_err().is_retryable());
}
