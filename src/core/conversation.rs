//! Conversation State Machine (C8): the turn-taking FSM driven by
//! STT/VAD/assistant/TTS/interrupt inputs, with a fault circuit breaker.
//!
//! Grounded in the teacher's realtime event-loop shape (a single mutable
//! state behind a lock, advanced only by a serialized set of inputs) and in
//! the Retry Executor's sliding-window circuit breaker pattern, reused here
//! for fault accumulation rather than retry backoff.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::events::{AsyncHandler, Emitter, Subscription};

/// §4.8 states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationState {
    Idle,
    Preparing,
    Listening,
    Processing,
    WaitingForCopilot,
    Speaking,
    Interrupted,
    Suspended,
    Faulted,
    Terminating,
}

/// §4.8 inputs.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationInput {
    SessionReady,
    SttPartial(String),
    SttFinal(String),
    VadEnd,
    CopilotRequest,
    CopilotResponseCompleted,
    TtsBufferReady,
    TtsComplete,
    UserStart,
    UserStop,
    /// Carries the interruption source (`"vad"`/`"explicit"`), surfaced on
    /// the resulting `state-changed` event's `metadata.pendingActions`.
    UserInterrupt(String),
    SystemSuspend,
    SystemResume,
    SessionRenewal,
    SessionTimeout,
    Error(String),
    TimerExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnRole {
    User,
    Assistant,
}

/// §3 `Turn Context`. Exactly one active at a time.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnContext {
    pub turn_id: String,
    pub turn_role: TurnRole,
    pub since: u64,
    pub transcript: String,
    pub confidence: Option<f32>,
    pub interruptions: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEventType {
    Created,
    Completed,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct TurnEvent {
    pub event_type: TurnEventType,
    pub turn: TurnContext,
    pub timestamp: u64,
}

#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub from: ConversationState,
    pub to: ConversationState,
    pub cause: String,
    pub timestamp: u64,
    pub turn: Option<TurnContext>,
    /// §4.8 side-channel data: `{"circuitOpen": true}` while the fault
    /// breaker absorbs inputs, `{"pendingActions": [source]}` on barge-in.
    /// `Value::Null` for every other transition.
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct TranscriptPassThroughEvent {
    pub content: String,
    pub metadata: Value,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_secs() -> u64 {
    now_ms() / 1000
}

/// Suspend/resume snapshot per §4.8: "current state and metadata stored;
/// resume restores to `listening` if snapshot was `suspended`, else to
/// snapshot."
#[derive(Debug, Clone)]
struct SuspendSnapshot {
    state: ConversationState,
    turn: Option<TurnContext>,
}

struct Inner {
    state: ConversationState,
    turn: Option<TurnContext>,
    suspend_snapshot: Option<SuspendSnapshot>,
    fault_timestamps: VecDeque<u64>,
    breaker_open_until: Option<u64>,
    next_turn_seq: u64,
}

/// C8. One instance per active session.
pub struct ConversationStateMachine {
    inner: Mutex<Inner>,
    fault_window_seconds: u64,
    fault_threshold: u32,
    fault_cooldown_seconds: u64,
    on_state_changed: Emitter<StateChangedEvent>,
    on_turn_event: Emitter<TurnEvent>,
    on_transcript_event: Emitter<TranscriptPassThroughEvent>,
}

impl ConversationStateMachine {
    pub fn new(fault_window_seconds: u64, fault_threshold: u32, fault_cooldown_seconds: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ConversationState::Idle,
                turn: None,
                suspend_snapshot: None,
                fault_timestamps: VecDeque::new(),
                breaker_open_until: None,
                next_turn_seq: 0,
            }),
            fault_window_seconds,
            fault_threshold,
            fault_cooldown_seconds,
            on_state_changed: Emitter::new(),
            on_turn_event: Emitter::new(),
            on_transcript_event: Emitter::new(),
        }
    }

    pub fn on_state_changed(&self, handler: AsyncHandler<StateChangedEvent>) -> Subscription<StateChangedEvent> {
        self.on_state_changed.subscribe(handler)
    }

    pub fn on_turn_event(&self, handler: AsyncHandler<TurnEvent>) -> Subscription<TurnEvent> {
        self.on_turn_event.subscribe(handler)
    }

    pub fn on_transcript_event(
        &self,
        handler: AsyncHandler<TranscriptPassThroughEvent>,
    ) -> Subscription<TranscriptPassThroughEvent> {
        self.on_transcript_event.subscribe(handler)
    }

    pub fn current_state(&self) -> ConversationState {
        self.inner.lock().state
    }

    pub fn current_turn(&self) -> Option<TurnContext> {
        self.inner.lock().turn.clone()
    }

    fn new_turn_id(inner: &mut Inner) -> String {
        let seq = inner.next_turn_seq;
        inner.next_turn_seq += 1;
        format!("turn-{seq}")
    }

    /// Applies a single input, advancing the FSM. Inputs are expected to be
    /// serialized by the caller onto a single queue (§5 ordering guarantee);
    /// this method itself holds the lock for its whole duration so
    /// concurrent calls are safe but not reordered usefully.
    pub async fn dispatch(&self, input: ConversationInput) {
        let transition = self.apply(input);
        if let Some(state_event) = transition.state_change {
            self.on_state_changed.emit(state_event).await;
        }
        for turn_event in transition.turn_events {
            self.on_turn_event.emit(turn_event).await;
        }
        if let Some(transcript_event) = transition.transcript_event {
            self.on_transcript_event.emit(transcript_event).await;
        }
    }

    fn record_fault(&self, inner: &mut Inner) -> bool {
        let now = now_secs();
        inner.fault_timestamps.push_back(now);
        while inner
            .fault_timestamps
            .front()
            .is_some_and(|t| now.saturating_sub(*t) > self.fault_window_seconds)
        {
            inner.fault_timestamps.pop_front();
        }
        if inner.fault_timestamps.len() as u32 >= self.fault_threshold {
            inner.breaker_open_until = Some(now + self.fault_cooldown_seconds);
            true
        } else {
            false
        }
    }

    fn breaker_is_open(&self, inner: &Inner) -> bool {
        inner.breaker_open_until.is_some_and(|until| now_secs() < until)
    }

    fn apply(&self, input: ConversationInput) -> Transition {
        let mut inner = self.inner.lock();
        let from = inner.state;

        // Fault circuit breaker: once the threshold is reached within the
        // window, the machine stays `faulted` regardless of input except
        // `system.resume` after cooldown expires. Before the threshold is
        // reached, a single fault still puts the FSM in `faulted` but
        // further inputs (including more faults) are processed normally so
        // the window can keep accumulating.
        if inner.breaker_open_until.is_some() {
            let still_open = self.breaker_is_open(&inner);
            if !still_open {
                if let ConversationInput::SystemResume = input {
                    inner.breaker_open_until = None;
                    inner.fault_timestamps.clear();
                    return self.transition(&mut inner, ConversationState::Listening, "system.resume");
                }
            } else if let ConversationInput::Error(_) = &input {
                // §7: signal the open breaker on every absorbed fault input
                // rather than dropping it silently.
                return Transition {
                    state_change: Some(StateChangedEvent {
                        from: inner.state,
                        to: inner.state,
                        cause: "circuit-open".to_string(),
                        timestamp: now_ms(),
                        turn: inner.turn.clone(),
                        metadata: serde_json::json!({ "circuitOpen": true }),
                    }),
                    turn_events: Vec::new(),
                    transcript_event: None,
                };
            }
            return Transition::none();
        }

        if let ConversationInput::Error(reason) = &input {
            let opened = self.record_fault(&mut inner);
            let cause = if opened {
                format!("error (circuit opened): {reason}")
            } else {
                format!("error: {reason}")
            };
            return self.transition(&mut inner, ConversationState::Faulted, &cause);
        }

        match (from, &input) {
            (ConversationState::Idle, ConversationInput::UserStart) => {
                self.transition(&mut inner, ConversationState::Preparing, "user.start")
            }
            (ConversationState::Preparing, ConversationInput::SessionReady) => {
                self.transition(&mut inner, ConversationState::Listening, "session.ready")
            }
            (ConversationState::Listening, ConversationInput::SttPartial(text)) => {
                let mut turn_events = Vec::new();
                if inner.turn.is_none() {
                    let turn_id = Self::new_turn_id(&mut inner);
                    let turn = TurnContext {
                        turn_id,
                        turn_role: TurnRole::User,
                        since: now_ms(),
                        transcript: String::new(),
                        confidence: None,
                        interruptions: 0,
                    };
                    inner.turn = Some(turn.clone());
                    turn_events.push(TurnEvent {
                        event_type: TurnEventType::Created,
                        turn,
                        timestamp: now_ms(),
                    });
                }
                if let Some(turn) = inner.turn.as_mut() {
                    turn.transcript.push_str(text);
                }
                Transition {
                    state_change: None,
                    turn_events,
                    transcript_event: Some(TranscriptPassThroughEvent {
                        content: text.clone(),
                        metadata: Value::Null,
                    }),
                }
            }
            (ConversationState::Listening, ConversationInput::VadEnd) => {
                self.transition(&mut inner, ConversationState::Processing, "vad.end")
            }
            (ConversationState::Processing, ConversationInput::SttFinal(text)) => {
                let mut turn_events = Vec::new();
                if let Some(turn) = inner.turn.take() {
                    let mut completed = turn;
                    completed.transcript = text.clone();
                    turn_events.push(TurnEvent {
                        event_type: TurnEventType::Completed,
                        turn: completed,
                        timestamp: now_ms(),
                    });
                }
                Transition {
                    state_change: None,
                    turn_events,
                    transcript_event: None,
                }
            }
            (ConversationState::Processing, ConversationInput::CopilotRequest) => {
                self.transition(&mut inner, ConversationState::WaitingForCopilot, "copilot.request")
            }
            (ConversationState::WaitingForCopilot, ConversationInput::CopilotResponseCompleted) => {
                self.transition(&mut inner, ConversationState::Processing, "copilot.response")
            }
            (ConversationState::Processing, ConversationInput::TtsBufferReady) => {
                let mut turn_events = Vec::new();
                if inner.turn.is_none() {
                    let turn_id = Self::new_turn_id(&mut inner);
                    let turn = TurnContext {
                        turn_id,
                        turn_role: TurnRole::Assistant,
                        since: now_ms(),
                        transcript: String::new(),
                        confidence: None,
                        interruptions: 0,
                    };
                    inner.turn = Some(turn.clone());
                    turn_events.push(TurnEvent {
                        event_type: TurnEventType::Created,
                        turn,
                        timestamp: now_ms(),
                    });
                }
                let mut t = self.transition(&mut inner, ConversationState::Speaking, "tts.bufferReady");
                t.turn_events.extend(turn_events);
                t
            }
            (ConversationState::Speaking, ConversationInput::TtsComplete) => {
                let mut turn_events = Vec::new();
                if let Some(turn) = inner.turn.take() {
                    turn_events.push(TurnEvent {
                        event_type: TurnEventType::Completed,
                        turn,
                        timestamp: now_ms(),
                    });
                }
                let mut t = self.transition(&mut inner, ConversationState::Listening, "tts.complete");
                t.turn_events.extend(turn_events);
                t
            }
            (ConversationState::Speaking, ConversationInput::UserInterrupt(source)) => {
                let mut turn_events = Vec::new();
                if let Some(turn) = inner.turn.as_mut() {
                    turn.interruptions += 1;
                    turn_events.push(TurnEvent {
                        event_type: TurnEventType::Interrupted,
                        turn: turn.clone(),
                        timestamp: now_ms(),
                    });
                }
                let mut t = self.transition_with_metadata(
                    &mut inner,
                    ConversationState::Interrupted,
                    "user.interrupt",
                    serde_json::json!({ "pendingActions": [source] }),
                );
                t.turn_events.extend(turn_events);
                t
            }
            (ConversationState::Interrupted, ConversationInput::SttPartial(text)) => {
                // The interrupted assistant turn was already replaced at
                // `turn-interrupted` time; a fresh user turn starts here.
                inner.turn = None;
                let mut turn_events = Vec::new();
                let turn_id = Self::new_turn_id(&mut inner);
                let mut turn = TurnContext {
                    turn_id,
                    turn_role: TurnRole::User,
                    since: now_ms(),
                    transcript: String::new(),
                    confidence: None,
                    interruptions: 0,
                };
                turn.transcript.push_str(text);
                turn_events.push(TurnEvent {
                    event_type: TurnEventType::Created,
                    turn: turn.clone(),
                    timestamp: now_ms(),
                });
                inner.turn = Some(turn);
                let mut t = self.transition(&mut inner, ConversationState::Listening, "stt.partial");
                t.turn_events.extend(turn_events);
                t.transcript_event = Some(TranscriptPassThroughEvent {
                    content: text.clone(),
                    metadata: Value::Null,
                });
                t
            }
            (_, ConversationInput::SystemSuspend) => {
                inner.suspend_snapshot = Some(SuspendSnapshot {
                    state: from,
                    turn: inner.turn.clone(),
                });
                self.transition(&mut inner, ConversationState::Suspended, "system.suspend")
            }
            (ConversationState::Suspended, ConversationInput::SystemResume) => {
                let snapshot = inner.suspend_snapshot.take();
                let restore_to = match &snapshot {
                    Some(s) if s.state == ConversationState::Suspended => ConversationState::Listening,
                    Some(s) => s.state,
                    None => ConversationState::Listening,
                };
                if let Some(s) = snapshot {
                    inner.turn = s.turn;
                }
                self.transition(&mut inner, restore_to, "system.resume")
            }
            (_, ConversationInput::SessionTimeout) => {
                self.transition(&mut inner, ConversationState::Terminating, "session.timeout")
            }
            _ => {
                debug!(?from, ?input, "input ignored in current state");
                Transition::none()
            }
        }
    }

    fn transition(&self, inner: &mut Inner, to: ConversationState, cause: &str) -> Transition {
        self.transition_with_metadata(inner, to, cause, Value::Null)
    }

    fn transition_with_metadata(
        &self,
        inner: &mut Inner,
        to: ConversationState,
        cause: &str,
        metadata: Value,
    ) -> Transition {
        let from = inner.state;
        if from == to {
            return Transition::none();
        }
        inner.state = to;
        Transition {
            state_change: Some(StateChangedEvent {
                from,
                to,
                cause: cause.to_string(),
                timestamp: now_ms(),
                turn: inner.turn.clone(),
                metadata,
            }),
            turn_events: Vec::new(),
            transcript_event: None,
        }
    }
}

struct Transition {
    state_change: Option<StateChangedEvent>,
    turn_events: Vec<TurnEvent>,
    transcript_event: Option<TranscriptPassThroughEvent>,
}

impl Transition {
    fn none() -> Self {
        Self {
            state_change: None,
            turn_events: Vec::new(),
            transcript_event: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn machine() -> ConversationStateMachine {
        ConversationStateMachine::new(60, 3, 120)
    }

    #[tokio::test]
    async fn happy_path_turn_scenario_1() {
        let fsm = machine();
        fsm.dispatch(ConversationInput::UserStart).await;
        fsm.dispatch(ConversationInput::SessionReady).await;
        assert_eq!(fsm.current_state(), ConversationState::Listening);

        fsm.dispatch(ConversationInput::SttPartial("hello ".to_string())).await;
        fsm.dispatch(ConversationInput::SttPartial("world".to_string())).await;
        assert_eq!(fsm.current_turn().unwrap().transcript, "hello world");

        fsm.dispatch(ConversationInput::VadEnd).await;
        assert_eq!(fsm.current_state(), ConversationState::Processing);

        fsm.dispatch(ConversationInput::SttFinal("hello world".to_string())).await;
        assert!(fsm.current_turn().is_none());

        fsm.dispatch(ConversationInput::CopilotRequest).await;
        assert_eq!(fsm.current_state(), ConversationState::WaitingForCopilot);

        fsm.dispatch(ConversationInput::CopilotResponseCompleted).await;
        assert_eq!(fsm.current_state(), ConversationState::Processing);

        fsm.dispatch(ConversationInput::TtsBufferReady).await;
        assert_eq!(fsm.current_state(), ConversationState::Speaking);
        assert_eq!(fsm.current_turn().unwrap().turn_role, TurnRole::Assistant);

        fsm.dispatch(ConversationInput::TtsComplete).await;
        assert_eq!(fsm.current_state(), ConversationState::Listening);
        assert!(fsm.current_turn().is_none());
    }

    #[tokio::test]
    async fn barge_in_scenario_2() {
        let fsm = machine();
        fsm.dispatch(ConversationInput::UserStart).await;
        fsm.dispatch(ConversationInput::SessionReady).await;
        fsm.dispatch(ConversationInput::VadEnd).await;
        fsm.dispatch(ConversationInput::CopilotRequest).await;
        fsm.dispatch(ConversationInput::CopilotResponseCompleted).await;
        fsm.dispatch(ConversationInput::TtsBufferReady).await;
        assert_eq!(fsm.current_state(), ConversationState::Speaking);

        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        fsm.on_state_changed(Arc::new(move |e: StateChangedEvent| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().push(e.metadata);
            })
        }));

        fsm.dispatch(ConversationInput::UserInterrupt("vad".to_string())).await;
        assert_eq!(fsm.current_state(), ConversationState::Interrupted);
        assert_eq!(fsm.current_turn().unwrap().interruptions, 1);
        assert_eq!(seen.lock().last().unwrap(), &serde_json::json!({ "pendingActions": ["vad"] }));

        fsm.dispatch(ConversationInput::SttPartial("wait".to_string())).await;
        assert_eq!(fsm.current_state(), ConversationState::Listening);
    }

    #[tokio::test]
    async fn fault_circuit_breaker_opens_after_threshold_p6() {
        let fsm = machine();
        fsm.dispatch(ConversationInput::Error("e1".to_string())).await;
        fsm.dispatch(ConversationInput::Error("e2".to_string())).await;
        assert_eq!(fsm.current_state(), ConversationState::Faulted);
        fsm.dispatch(ConversationInput::Error("e3".to_string())).await;
        assert_eq!(fsm.current_state(), ConversationState::Faulted);

        // system.resume before cooldown elapses must not clear the fault.
        fsm.dispatch(ConversationInput::SystemResume).await;
        assert_eq!(fsm.current_state(), ConversationState::Faulted);
    }

    #[tokio::test]
    async fn suspend_resume_restores_listening_when_snapshot_was_suspended() {
        let fsm = machine();
        fsm.dispatch(ConversationInput::UserStart).await;
        fsm.dispatch(ConversationInput::SessionReady).await;
        fsm.dispatch(ConversationInput::SystemSuspend).await;
        assert_eq!(fsm.current_state(), ConversationState::Suspended);
        fsm.dispatch(ConversationInput::SystemResume).await;
        assert_eq!(fsm.current_state(), ConversationState::Listening);
    }

    #[tokio::test]
    async fn state_changed_listeners_observe_causal_order() {
        let fsm = machine();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        fsm.on_state_changed(Arc::new(move |e: StateChangedEvent| {
            let seen = seen_clone.clone();
            Box::pin(async move {
                seen.lock().push(e.to);
            })
        }));

        fsm.dispatch(ConversationInput::UserStart).await;
        fsm.dispatch(ConversationInput::SessionReady).await;
        fsm.dispatch(ConversationInput::VadEnd).await;

        let order = seen.lock().clone();
        assert_eq!(
            order,
            vec![ConversationState::Preparing, ConversationState::Listening, ConversationState::Processing]
        );
    }

    #[tokio::test]
    async fn unrelated_input_in_idle_is_ignored() {
        let fsm = machine();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        fsm.on_state_changed(Arc::new(move |_: StateChangedEvent| {
            let calls = calls_clone.clone();
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        }));
        fsm.dispatch(ConversationInput::VadEnd).await;
        assert_eq!(fsm.current_state(), ConversationState::Idle);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
