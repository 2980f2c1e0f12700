//! Dev control server routes: a health check and a WebSocket endpoint that
//! lets a local harness exercise `SessionManager` without a real editor
//! host. Not part of the crate's library surface proper — see
//! [`crate::state::AppState`].

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Extension, State},
    response::IntoResponse,
    routing::{get, Router},
};
use std::sync::Arc;
use tower_governor::{governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::middleware::ClientIp;
use crate::state::AppState;

/// Requests per second and burst size for the dev control server's rate
/// limiter. Fixed, unlike the teacher's gateway, since this surface has no
/// public rate-limit configuration of its own.
const RATE_LIMIT_PER_SECOND: u64 = 20;
const RATE_LIMIT_BURST: u32 = 40;

pub fn router(state: Arc<AppState>) -> Router {
    let governor_config = GovernorConfigBuilder::default()
        .per_second(RATE_LIMIT_PER_SECOND)
        .burst_size(RATE_LIMIT_BURST)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .expect("rate limiter config is valid");

    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            http::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            http::HeaderValue::from_static("DENY"),
        ));

    Router::new()
        .route("/healthz", get(health))
        .route("/dev/ws", get(ws_upgrade))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::middleware::connection_limit_middleware,
        ))
        .layer(GovernorLayer::new(governor_config))
        .layer(security_headers)
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "activeSessions": state.sessions.get_all_sessions().len(),
    }))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(client_ip): Extension<ClientIp>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_ip))
}

/// Starts one session per connection and forwards lifecycle/transcript
/// events to the socket as JSON, releasing the connection slot on close.
async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, client_ip: ClientIp) {
    let session = match state.sessions.start_session().await {
        Ok(info) => info,
        Err(err) => {
            let _ = socket
                .send(Message::Text(
                    serde_json::to_string(&err.descriptor()).unwrap_or_default().into(),
                ))
                .await;
            state.release_connection(client_ip.0);
            return;
        }
    };
    info!(session_id = %session.session_id, "dev ws: session started");

    while let Some(Ok(msg)) = socket.recv().await {
        if let Message::Close(_) = msg {
            break;
        }
        state.sessions.record_activity(&session.session_id);
    }

    state.sessions.end_session(&session.session_id).await;
    state.release_connection(client_ip.0);
    warn!(session_id = %session.session_id, "dev ws: connection closed");
}
