//! Session Manager (C4): owns session records, orchestrates
//! start/end/renew, enforces the concurrent session cap, and brokers
//! realtime transcript events to subscribers.
//!
//! Grounded in the teacher's `AppState` connection-accounting pattern
//! (`middleware::connection_limit`) for the concurrency cap, and in
//! `core::realtime::base::BaseRealtime`'s callback style for lifecycle
//! events.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{AssistantConfig, SessionConfig};
use crate::core::credential::{CredentialService, KeyResult};
use crate::core::retry::{RetryContext, RetryEnvelope, RetryExecutor};
use crate::core::timers::TimerManager;
use crate::core::transcript::{TranscriptAggregator, TranscriptDeltaEvent, TranscriptFinalEvent};
use crate::errors::{AppError, AppResult, SessionError};
use crate::events::{AsyncHandler, Emitter, Subscription};

/// §3 `Session Record.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Renewing,
    Paused,
    Ending,
    Failed,
}

/// §3 `Session Record`.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub session_id: String,
    pub state: SessionState,
    pub started_at: u64,
    pub last_activity: u64,
    pub expires_at: Option<u64>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthCheck {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone)]
pub struct SessionDiagnostics {
    pub credential_validity: HealthCheck,
    pub timer_health: HealthCheck,
    pub session_age: HealthCheck,
}

/// Lifecycle events broadcast to external collaborators (§6.4).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Started(SessionInfo),
    Ended(String),
    RenewalStarted(String),
    RenewalCompleted(SessionInfo),
    RenewalFailed { session_id: String, reason: String },
}

/// §3 Recovery Snapshot. This crate defines only the shape and the commit
/// cadence (on each transcript final event, and once more at session end);
/// actually persisting it is an external storage collaborator's job, out of
/// scope here the same way the UI collaborator is in `controller.rs`.
#[derive(Debug, Clone)]
pub struct RecoverySnapshot {
    pub conversation_id: Option<String>,
    pub session_id: String,
    pub last_interaction_at: u64,
    pub pending_messages: Vec<String>,
    pub updated_at: u64,
}

struct SessionEntry {
    info: SessionInfo,
    credentials: Arc<CredentialService>,
    aggregator: Arc<TranscriptAggregator>,
    snapshot: RecoverySnapshot,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn new_session_id() -> String {
    format!("session-{}-{}", now_ms(), Uuid::new_v4())
}

/// C4. Created once per running assistant instance.
pub struct SessionManager {
    config: RwLock<SessionConfig>,
    endpoint: crate::config::EndpointConfig,
    api_key: String,
    sessions: RwLock<HashMap<String, SessionEntry>>,
    timers: Arc<TimerManager>,
    retry: RetryExecutor,
    on_lifecycle: Emitter<SessionEvent>,
    on_transcript_delta: Arc<Emitter<TranscriptDeltaEvent>>,
    on_transcript_final: Arc<Emitter<TranscriptFinalEvent>>,
    on_snapshot_commit: Emitter<RecoverySnapshot>,
    on_privacy_purge: Emitter<String>,
    /// Lets synchronous timer callbacks (see `schedule_timers`) spawn a task
    /// that calls back into this manager's own async methods.
    self_ref: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(config: &AssistantConfig, timers: Arc<TimerManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config: RwLock::new(config.session.clone()),
            endpoint: config.endpoint.clone(),
            api_key: config.api_key.clone(),
            sessions: RwLock::new(HashMap::new()),
            timers,
            retry: RetryExecutor::new(),
            on_lifecycle: Emitter::new(),
            on_transcript_delta: Arc::new(Emitter::new()),
            on_transcript_final: Arc::new(Emitter::new()),
            on_snapshot_commit: Emitter::new(),
            on_privacy_purge: Emitter::new(),
            self_ref: weak.clone(),
        })
    }

    pub fn on_lifecycle(&self, handler: AsyncHandler<SessionEvent>) -> Subscription<SessionEvent> {
        self.on_lifecycle.subscribe(handler)
    }

    pub fn on_realtime_transcript(
        &self,
        on_delta: AsyncHandler<TranscriptDeltaEvent>,
        on_final: AsyncHandler<TranscriptFinalEvent>,
    ) -> (Subscription<TranscriptDeltaEvent>, Subscription<TranscriptFinalEvent>) {
        (
            self.on_transcript_delta.subscribe(on_delta),
            self.on_transcript_final.subscribe(on_final),
        )
    }

    /// Subscribes to Recovery Snapshot commits (§3), emitted on each
    /// transcript final event and once more at session end.
    pub fn on_conversation_snapshot(
        &self,
        handler: AsyncHandler<RecoverySnapshot>,
    ) -> Subscription<RecoverySnapshot> {
        self.on_snapshot_commit.subscribe(handler)
    }

    /// Subscribes to the privacy-purge directive fired at `end_session`. The
    /// payload is the ended session's id; actually erasing any externally
    /// persisted data for it is the storage collaborator's job.
    pub fn on_privacy_purge(&self, handler: AsyncHandler<String>) -> Subscription<String> {
        self.on_privacy_purge.subscribe(handler)
    }

    /// Feeds a raw realtime event (typically decoded from a transport data
    /// channel message) into the named session's Transcript Aggregator.
    pub async fn handle_realtime_event(
        &self,
        session_id: &str,
        event: crate::core::transcript::RawRealtimeEvent,
    ) {
        let aggregator = {
            let sessions = self.sessions.read();
            sessions.get(session_id).map(|e| e.aggregator.clone())
        };
        if let Some(aggregator) = aggregator {
            aggregator.handle_event(event).await;
        }
    }

    fn active_or_starting_count(&self) -> usize {
        self.sessions
            .read()
            .values()
            .filter(|e| matches!(e.info.state, SessionState::Active | SessionState::Starting))
            .count()
    }

    /// `startSession`. Fails with `capacity-exceeded` (not retried) if the
    /// cap P1 (`N_max`, default 3) would be exceeded.
    pub async fn start_session(&self) -> AppResult<SessionInfo> {
        if self.active_or_starting_count() >= self.config.read().max_concurrent_sessions {
            return Err(SessionError::CapacityExceeded.into());
        }

        let session_id = new_session_id();
        let started_at = now_ms();

        {
            let mut sessions = self.sessions.write();
            sessions.insert(
                session_id.clone(),
                SessionEntry {
                    info: SessionInfo {
                        session_id: session_id.clone(),
                        state: SessionState::Starting,
                        started_at,
                        last_activity: started_at,
                        expires_at: None,
                        conversation_id: None,
                    },
                    credentials: Arc::new(CredentialService::new(
                        self.endpoint.clone(),
                        self.api_key.clone(),
                        self.config.read().renewal_margin_seconds,
                    )),
                    aggregator: Arc::new(TranscriptAggregator::new(session_id.clone())),
                    snapshot: RecoverySnapshot {
                        conversation_id: None,
                        session_id: session_id.clone(),
                        last_interaction_at: started_at,
                        pending_messages: Vec::new(),
                        updated_at: started_at,
                    },
                },
            );
        }

        let credentials = {
            let sessions = self.sessions.read();
            sessions.get(&session_id).unwrap().credentials.clone()
        };

        let envelope = RetryEnvelope::new("auth");
        let ctx = RetryContext::new(session_id.clone(), envelope);
        let key_result = self
            .retry
            .execute(
                || {
                    let credentials = credentials.clone();
                    async move {
                        let result: KeyResult = credentials.request_ephemeral_key().await;
                        if result.success {
                            Ok(result)
                        } else {
                            Err(result.error.unwrap_or(crate::errors::AuthError::InvalidCredential).into())
                        }
                    }
                },
                ctx,
            )
            .await;

        let key_result = match key_result {
            Ok(r) => r,
            Err(err) => {
                self.fail_session(&session_id).await;
                return Err(err);
            }
        };
        let key = key_result.key.expect("success implies key present");

        self.wire_transcript_broker(&session_id);

        let info = {
            let mut sessions = self.sessions.write();
            let entry = sessions.get_mut(&session_id).expect("just inserted");
            entry.info.state = SessionState::Active;
            entry.info.expires_at = Some(key.expires_at);
            entry.info.clone()
        };

        self.schedule_timers(&session_id, &key);

        self.on_lifecycle.emit(SessionEvent::Started(info.clone())).await;
        info!(session_id = %session_id, "session started");
        Ok(info)
    }

    /// Re-emits the per-session aggregator's delta/final events on the
    /// manager's own broker emitters, so a single `on_realtime_transcript`
    /// subscription sees events from every session.
    fn wire_transcript_broker(&self, session_id: &str) {
        let sessions = self.sessions.read();
        let Some(entry) = sessions.get(session_id) else {
            return;
        };

        let delta_broker = self.on_transcript_delta.clone();
        entry.aggregator.on_delta(Arc::new(move |event: TranscriptDeltaEvent| {
            let delta_broker = delta_broker.clone();
            Box::pin(async move {
                delta_broker.emit(event).await;
            })
        }));

        let final_broker = self.on_transcript_final.clone();
        let self_ref = self.self_ref.clone();
        let sid = session_id.to_string();
        entry.aggregator.on_final(Arc::new(move |event: TranscriptFinalEvent| {
            let final_broker = final_broker.clone();
            let self_ref = self_ref.clone();
            let sid = sid.clone();
            Box::pin(async move {
                if let Some(manager) = self_ref.upgrade() {
                    manager.commit_snapshot(&sid, event.content.clone()).await;
                }
                final_broker.emit(event).await;
            })
        }));
    }

    /// Commits a fresh `RecoverySnapshot` for `session_id`, per §3's
    /// "committed on each transcript final" cadence. "redo"/"cleared"
    /// transcript events have no counterpart in the realtime protocol this
    /// crate targets, so only the final-event commit is modeled.
    async fn commit_snapshot(&self, session_id: &str, final_content: String) {
        let snapshot = {
            let mut sessions = self.sessions.write();
            let Some(entry) = sessions.get_mut(session_id) else {
                return;
            };
            entry.snapshot.last_interaction_at = now_ms();
            entry.snapshot.updated_at = now_ms();
            entry.snapshot.pending_messages = vec![final_content];
            entry.snapshot.clone()
        };
        self.on_snapshot_commit.emit(snapshot).await;
    }

    /// Bridges the Timer Manager's synchronous callbacks to this manager's
    /// own async `renew_session`/`end_session` by spawning a task that
    /// upgrades `self_ref`. If the manager has already been dropped the
    /// upgrade fails and the callback is a no-op.
    fn schedule_timers(&self, session_id: &str, key: &crate::core::credential::KeyInfo) {
        let cfg = self.config.read().clone();
        let renew_in_ms = key.refresh_at.saturating_sub(now_ms());
        let renew_in = Duration::from_millis(renew_in_ms); // B1: 0 if margin >= TTL

        let self_for_renewal = self.self_ref.clone();
        let self_for_timeout = self.self_ref.clone();

        self.timers.schedule(
            session_id.to_string(),
            renew_in,
            Arc::new(move |sid| {
                let Some(manager) = self_for_renewal.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    if let Err(err) = manager.renew_session(&sid).await {
                        warn!(session_id = %sid, error = %err, "automatic renewal failed");
                    }
                });
            }),
            Duration::from_secs(cfg.inactivity_timeout_minutes * 60),
            Arc::new(move |sid| {
                let Some(manager) = self_for_timeout.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    warn!(session_id = %sid, "inactivity timeout, ending session");
                    manager.end_session(&sid).await;
                });
            }),
            Duration::from_secs(cfg.heartbeat_interval_seconds),
            Arc::new(move |sid| {
                info!(session_id = %sid, "heartbeat check");
            }),
        );
    }

    async fn fail_session(&self, session_id: &str) {
        self.timers.cancel(session_id);
        let mut sessions = self.sessions.write();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.info.state = SessionState::Failed;
        }
    }

    /// `renewSession`.
    pub async fn renew_session(&self, session_id: &str) -> AppResult<SessionInfo> {
        let credentials = {
            let mut sessions = self.sessions.write();
            let entry = sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            entry.info.state = SessionState::Renewing;
            entry.credentials.clone()
        };

        self.on_lifecycle
            .emit(SessionEvent::RenewalStarted(session_id.to_string()))
            .await;

        let envelope = RetryEnvelope::new("auth");
        let ctx = RetryContext::new(session_id.to_string(), envelope);
        let result = self
            .retry
            .execute(
                || {
                    let credentials = credentials.clone();
                    async move {
                        let r = credentials.renew_key().await;
                        if r.success {
                            Ok(r)
                        } else {
                            Err(r.error.unwrap_or(crate::errors::AuthError::TokenExpired).into())
                        }
                    }
                },
                ctx,
            )
            .await;

        match result {
            Ok(key_result) => {
                let key = key_result.key.expect("success implies key present");
                self.schedule_timers(session_id, &key);
                let info = {
                    let mut sessions = self.sessions.write();
                    let entry = sessions.get_mut(session_id).expect("checked above");
                    entry.info.state = SessionState::Active;
                    entry.info.expires_at = Some(key.expires_at);
                    entry.info.last_activity = now_ms();
                    entry.info.clone()
                };
                self.on_lifecycle
                    .emit(SessionEvent::RenewalCompleted(info.clone()))
                    .await;
                Ok(info)
            }
            Err(err) => {
                {
                    let mut sessions = self.sessions.write();
                    if let Some(entry) = sessions.get_mut(session_id) {
                        entry.info.state = SessionState::Failed;
                    }
                }
                self.on_lifecycle
                    .emit(SessionEvent::RenewalFailed {
                        session_id: session_id.to_string(),
                        reason: err.to_string(),
                    })
                    .await;
                credentials.notify_key_expired().await;
                Err(err)
            }
        }
    }

    /// `endSession`. A no-op for an unknown id (R2). Per §4.4, also ends the
    /// session's credential, finalizes its Recovery Snapshot, and fires a
    /// privacy-purge directive for any external collaborator holding data
    /// keyed by this session id.
    pub async fn end_session(&self, session_id: &str) {
        self.timers.cancel(session_id);
        let removed = self.sessions.write().remove(session_id);
        if let Some(entry) = removed {
            entry.credentials.end_session().await;

            let mut snapshot = entry.snapshot;
            snapshot.updated_at = now_ms();
            self.on_snapshot_commit.emit(snapshot).await;
            self.on_privacy_purge.emit(session_id.to_string()).await;

            self.on_lifecycle.emit(SessionEvent::Ended(session_id.to_string())).await;
            info!(session_id, "session ended");
        }
    }

    pub fn get_session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(session_id).map(|e| e.info.clone())
    }

    pub fn get_current_session(&self) -> Option<SessionInfo> {
        self.sessions
            .read()
            .values()
            .max_by_key(|e| e.info.last_activity)
            .map(|e| e.info.clone())
    }

    pub fn get_all_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().values().map(|e| e.info.clone()).collect()
    }

    pub fn is_session_active(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .get(session_id)
            .is_some_and(|e| e.info.state == SessionState::Active)
    }

    pub fn record_activity(&self, session_id: &str) {
        let inactivity_timeout = Duration::from_secs(self.config.read().inactivity_timeout_minutes * 60);
        if let Some(entry) = self.sessions.write().get_mut(session_id) {
            entry.info.last_activity = now_ms();
        }
        self.timers.notice_activity(session_id, inactivity_timeout);
    }

    pub fn update_config(&self, config: SessionConfig) {
        *self.config.write() = config;
    }

    /// Current ephemeral key for a session, used by the Extension Controller
    /// to establish the WebRTC Transport once the session reaches `Active`.
    pub fn get_session_credential_key(&self, session_id: &str) -> Option<crate::core::credential::KeyInfo> {
        self.sessions.read().get(session_id)?.credentials.get_current_key()
    }

    pub fn get_session_diagnostics(&self, session_id: &str) -> Option<SessionDiagnostics> {
        let sessions = self.sessions.read();
        let entry = sessions.get(session_id)?;
        Some(SessionDiagnostics {
            credential_validity: if entry.credentials.get_current_key().is_some_and(|k| k.is_valid) {
                HealthCheck::Pass
            } else {
                HealthCheck::Fail
            },
            timer_health: if self.timers.get_timer_status(session_id).is_some() {
                HealthCheck::Pass
            } else {
                HealthCheck::Warn
            },
            session_age: {
                let age_minutes = (now_ms().saturating_sub(entry.info.started_at)) / 60_000;
                if age_minutes < 60 {
                    HealthCheck::Pass
                } else if age_minutes < 240 {
                    HealthCheck::Warn
                } else {
                    HealthCheck::Fail
                }
            },
        })
    }

    pub async fn test_session_health(&self, session_id: &str) -> AppResult<SessionDiagnostics> {
        self.get_session_diagnostics(session_id)
            .ok_or_else(|| AppError::from(SessionError::NotFound(session_id.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AssistantConfig {
        let mut cfg = AssistantConfig::default();
        cfg.api_key = "test-key".to_string();
        cfg.session.max_concurrent_sessions = 3;
        cfg
    }

    #[test]
    fn session_id_format() {
        let id = new_session_id();
        assert!(id.starts_with("session-"));
        assert_eq!(id.split('-').count(), 7); // session-<ms>-<8-4-4-4-12 uuid segments>
    }

    #[tokio::test]
    async fn end_session_unknown_id_is_noop_r2() {
        let cfg = test_config();
        let manager = SessionManager::new(&cfg, Arc::new(TimerManager::new()));
        manager.end_session("does-not-exist").await;
        assert!(manager.get_session_info("does-not-exist").is_none());
    }

    #[test]
    fn capacity_cap_counts_only_active_and_starting() {
        let cfg = test_config();
        let manager = SessionManager::new(&cfg, Arc::new(TimerManager::new()));
        assert_eq!(manager.active_or_starting_count(), 0);
    }
}
