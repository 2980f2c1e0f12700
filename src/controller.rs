//! Extension Controller (C10): wires every component up in the strict
//! dependency order §4.10 mandates, and disposes them in reverse on failure
//! or shutdown.
//!
//! Grounded in the teacher's `main.rs` bring-up sequencing (config load →
//! state construction → route composition, each step logged and fallible)
//! and in [`crate::disposal`], whose own doc comment already names this
//! controller as its intended caller, for the teardown half.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tracing::{debug, error, info};

use crate::config::{AssistantConfig, PolicyProfile};
use crate::core::conversation::{ConversationInput, ConversationStateMachine};
use crate::core::interruption::{InterruptionEngine, InterruptionEvent, InterruptionSource};
use crate::core::recovery::RecoveryManager;
use crate::core::session::SessionManager;
use crate::core::timers::TimerManager;
use crate::core::transcript::RawRealtimeEvent;
use crate::core::transport::{TransportEvent, WebRtcTransport};
use crate::disposal::{ClosureDisposable, Disposable, DisposalRegistry};
use crate::errors::AppResult;

/// The live set of components the controller brought up, in the order
/// §4.10 names: credentials → configuration → ephemeral key service →
/// session → transport → interruption engine → UI collaborator. The
/// conversation state machine and recovery manager are constructed after
/// interruption and wired to events from the components above, rather than
/// occupying a position of their own in that ordering.
///
/// "UI collaborator" has no concrete type in this crate (it is the
/// embedding extension host, out of scope per §1) — the controller's public
/// fields and `session_id`/`set_policy_profile` accessors are the hand-off
/// surface a host wires into its own UI layer once `start` returns.
pub struct ExtensionController {
    pub config: AssistantConfig,
    pub sessions: Arc<SessionManager>,
    pub interruption: Arc<InterruptionEngine>,
    pub conversation: Arc<ConversationStateMachine>,
    pub recovery: Arc<RecoveryManager>,
    pub transport: Option<Arc<WebRtcTransport>>,
    session_id: String,
    registry: DisposalRegistry,
}

struct SessionDisposable {
    sessions: Arc<SessionManager>,
    session_id: String,
}

impl Disposable for SessionDisposable {
    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            self.sessions.end_session(&self.session_id).await;
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "session"
    }
}

struct TransportDisposable {
    transport: Arc<WebRtcTransport>,
}

impl Disposable for TransportDisposable {
    fn dispose<'a>(&'a self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            self.transport.close().await;
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "transport"
    }
}

impl ExtensionController {
    /// Brings up every component in §4.10's strict order. On any failure,
    /// every previously initialized step is disposed in reverse order before
    /// the error is returned.
    pub async fn start(config: AssistantConfig) -> AppResult<Self> {
        config.validate()?;
        let registry = DisposalRegistry::new();

        // credentials → configuration: the long-lived credential and
        // validated config are already in hand by this point; configuration
        // carries no separate disposable.
        info!("extension controller: configuration validated");

        // ephemeral key service → session: `SessionManager` owns its own
        // per-session `CredentialService` instances, so starting a session
        // folds both steps together.
        let timers = Arc::new(TimerManager::new());
        let sessions = SessionManager::new(&config, timers);
        let session_info = match sessions.start_session().await {
            Ok(info) => info,
            Err(err) => {
                Self::unwind(&registry).await;
                return Err(err);
            }
        };
        registry.register(Arc::new(SessionDisposable {
            sessions: sessions.clone(),
            session_id: session_info.session_id.clone(),
        }));
        info!(session_id = %session_info.session_id, "extension controller: session started");

        // transport
        let key = match sessions.get_session_credential_key(&session_info.session_id) {
            Some(k) => k,
            None => {
                Self::unwind(&registry).await;
                return Err(crate::errors::SessionError::NotFound(session_info.session_id.clone()).into());
            }
        };
        let transport = match WebRtcTransport::establish(
            &config.transport,
            &config.endpoint,
            &config.audio,
            &key.key,
        )
        .await
        {
            Ok(t) => t,
            Err(err) => {
                error!(error = %err, "extension controller: transport establishment failed");
                Self::unwind(&registry).await;
                return Err(err);
            }
        };
        registry.register(Arc::new(TransportDisposable { transport: transport.clone() }));
        info!("extension controller: transport established");

        // interruption engine (applies policy)
        let interruption = Arc::new(InterruptionEngine::new(config.conversation.policy_profile));
        registry.register(Arc::new(ClosureDisposable::new("interruption-engine", || {
            Box::pin(async move { Ok(()) })
        })));
        info!(profile = ?config.conversation.policy_profile, "extension controller: interruption policy applied");

        // conversation state machine (C8) + connection recovery manager (C7):
        // both are driven by events from components already brought up
        // above, so they're constructed last and wired to those sources
        // rather than the other way around.
        let conversation = Arc::new(ConversationStateMachine::new(
            config.conversation.fault_window_seconds,
            config.conversation.fault_threshold,
            config.conversation.fault_cooldown_seconds,
        ));
        let recovery = Arc::new(RecoveryManager::new());
        registry.register(Arc::new(ClosureDisposable::new("conversation-fsm", || {
            Box::pin(async move { Ok(()) })
        })));

        Self::wire_interruption(&interruption, &conversation);
        Self::wire_transport(&transport, &conversation, &recovery, &sessions, &session_info.session_id);
        Self::wire_transcript(&sessions, &conversation);
        info!("extension controller: conversation state machine and recovery manager wired");

        // UI collaborator: no concrete dependency here; a host calls
        // `on_ready`-equivalent wiring against the returned controller.
        Ok(Self {
            config,
            sessions,
            interruption,
            conversation,
            recovery,
            transport: Some(transport),
            session_id: session_info.session_id,
            registry,
        })
    }

    /// Forwards barge-in/turn-ended events from the Interruption Engine (C9)
    /// into the Conversation State Machine (C8) as `UserInterrupt`.
    fn wire_interruption(interruption: &Arc<InterruptionEngine>, conversation: &Arc<ConversationStateMachine>) {
        let conversation = conversation.clone();
        interruption.on_event(Arc::new(move |event: InterruptionEvent| {
            let conversation = conversation.clone();
            Box::pin(async move {
                match event {
                    InterruptionEvent::Interruption { source } => {
                        let source = match source {
                            InterruptionSource::Vad => "vad",
                            InterruptionSource::Explicit => "explicit",
                        };
                        conversation
                            .dispatch(ConversationInput::UserInterrupt(source.to_string()))
                            .await;
                    }
                    InterruptionEvent::TurnEnded => {
                        debug!("interruption engine: turn ended");
                    }
                }
            })
        }));
    }

    /// Drives the state machine's `SttFinal` input from the Session
    /// Manager's broker once an utterance is finalized, completing the
    /// transport → aggregator → state machine data flow.
    fn wire_transcript(sessions: &Arc<SessionManager>, conversation: &Arc<ConversationStateMachine>) {
        let conversation_for_final = conversation.clone();
        sessions.on_realtime_transcript(
            Arc::new(move |_event: crate::core::transcript::TranscriptDeltaEvent| Box::pin(async move {})),
            Arc::new(move |event: crate::core::transcript::TranscriptFinalEvent| {
                let conversation = conversation_for_final.clone();
                Box::pin(async move {
                    conversation.dispatch(ConversationInput::SttFinal(event.content)).await;
                })
            }),
        );
    }

    /// Forwards transport failures into the Connection Recovery Manager (C7)
    /// and the state machine's fault breaker, and decoded data-channel
    /// payloads into the Session Manager's Transcript Aggregator.
    fn wire_transport(
        transport: &Arc<WebRtcTransport>,
        conversation: &Arc<ConversationStateMachine>,
        recovery: &Arc<RecoveryManager>,
        sessions: &Arc<SessionManager>,
        session_id: &str,
    ) {
        let conversation = conversation.clone();
        let recovery = recovery.clone();
        let sessions = sessions.clone();
        let transport_for_recovery = transport.clone();
        let session_id = session_id.to_string();

        transport.on_event(Arc::new(move |event: TransportEvent| {
            let conversation = conversation.clone();
            let recovery = recovery.clone();
            let sessions = sessions.clone();
            let transport = transport_for_recovery.clone();
            let session_id = session_id.clone();
            Box::pin(async move {
                match event {
                    TransportEvent::Error(err) => {
                        conversation.dispatch(ConversationInput::Error(err.to_string())).await;
                        if let Err(recover_err) = recovery.recover(transport, &session_id, &err).await {
                            error!(error = %recover_err, "extension controller: connection recovery failed");
                        }
                    }
                    TransportEvent::DataChannelMessage(value) => {
                        let Some(kind) = value.get("type").and_then(|v| v.as_str()) else {
                            return;
                        };
                        let response_id = value
                            .get("response_id")
                            .and_then(|v| v.as_str())
                            .map(str::to_string)
                            .or_else(|| {
                                value
                                    .get("response")
                                    .and_then(|r| r.get("id"))
                                    .and_then(|v| v.as_str())
                                    .map(str::to_string)
                            });
                        let item_id = value.get("item_id").and_then(|v| v.as_str()).map(str::to_string);
                        sessions
                            .handle_realtime_event(
                                &session_id,
                                RawRealtimeEvent {
                                    kind: kind.to_string(),
                                    response_id,
                                    item_id,
                                    payload: value,
                                },
                            )
                            .await;
                    }
                    _ => {}
                }
            })
        }));
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Swaps the active interruption policy, as a host would when the user
    /// changes `conversation.policyProfile` at runtime.
    pub fn set_policy_profile(&self, profile: PolicyProfile) {
        self.interruption.set_policy(profile);
    }

    /// Disposes every initialized step in reverse order. Idempotent.
    pub async fn shutdown(&self) -> Vec<(String, String)> {
        self.registry.dispose_all().await
    }

    async fn unwind(registry: &DisposalRegistry) {
        let errors = registry.dispose_all().await;
        for (name, err) in errors {
            error!(component = %name, error = %err, "extension controller: unwind step failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AssistantConfig {
        let mut cfg = AssistantConfig::default();
        cfg.api_key = "test-key".to_string();
        cfg
    }

    #[test]
    fn validate_rejects_before_any_component_starts() {
        let mut cfg = test_config();
        cfg.audio.sample_rate = 1234;
        assert!(cfg.validate().is_err());
    }
}
