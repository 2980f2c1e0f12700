//! Interruption Engine (C9): detects barge-in from VAD speech-start/stop
//! overlapping assistant `speaking`, applying a policy-profile-scoped
//! debounce before committing to an interruption.
//!
//! Grounded in the teacher's policy-profile parameter mapping pattern
//! (profile name → clamped tunables) reused from [`crate::config`]'s
//! `ConversationConfig::with_profile`, generalized here into the runtime
//! VAD-driven decision described in §4.9.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{ConversationConfig, PolicyProfile};
use crate::events::{AsyncHandler, Emitter, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackMode {
    /// Assistant audio ducks but continues; used when barge-in is disabled.
    Duck,
    /// Barge-in fully stops assistant playback.
    Stop,
}

/// §4.9 policy-profile parameter set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterruptionPolicy {
    pub allow_barge_in: bool,
    pub interruption_budget_ms: u64,
    pub completion_grace_ms: u64,
    pub speech_stop_debounce_ms: u64,
    pub fallback_mode: FallbackMode,
}

impl InterruptionPolicy {
    pub fn from_config(cfg: &ConversationConfig) -> Self {
        Self {
            allow_barge_in: cfg.allow_barge_in,
            interruption_budget_ms: cfg.interruption_budget_ms,
            completion_grace_ms: cfg.completion_grace_ms,
            speech_stop_debounce_ms: cfg.speech_stop_debounce_ms,
            fallback_mode: if cfg.allow_barge_in { FallbackMode::Stop } else { FallbackMode::Duck },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionSource {
    Vad,
    Explicit,
}

#[derive(Debug, Clone)]
pub enum InterruptionEvent {
    Interruption { source: InterruptionSource },
    TurnEnded,
}

struct Inner {
    assistant_speaking: bool,
    speech_start: Option<Instant>,
}

/// C9. One instance per active session; policy is swapped when the
/// configured profile changes (§4.9, applied by the Extension Controller).
pub struct InterruptionEngine {
    policy: Mutex<InterruptionPolicy>,
    inner: Mutex<Inner>,
    barge_in_fired: AtomicBool,
    on_event: Emitter<InterruptionEvent>,
}

impl InterruptionEngine {
    pub fn new(profile: PolicyProfile) -> Self {
        let cfg = ConversationConfig::default().with_profile(profile);
        Self {
            policy: Mutex::new(InterruptionPolicy::from_config(&cfg)),
            inner: Mutex::new(Inner {
                assistant_speaking: false,
                speech_start: None,
            }),
            barge_in_fired: AtomicBool::new(false),
            on_event: Emitter::new(),
        }
    }

    pub fn on_event(&self, handler: AsyncHandler<InterruptionEvent>) -> Subscription<InterruptionEvent> {
        self.on_event.subscribe(handler)
    }

    pub fn set_policy(&self, profile: PolicyProfile) {
        let cfg = ConversationConfig::default().with_profile(profile);
        *self.policy.lock() = InterruptionPolicy::from_config(&cfg);
    }

    pub fn policy(&self) -> InterruptionPolicy {
        *self.policy.lock()
    }

    pub fn notify_assistant_speaking(&self, speaking: bool) {
        let mut inner = self.inner.lock();
        inner.assistant_speaking = speaking;
        if !speaking {
            inner.speech_start = None;
            self.barge_in_fired.store(false, Ordering::SeqCst);
        }
    }

    pub fn notify_vad_speech_started(&self) {
        let mut inner = self.inner.lock();
        if inner.assistant_speaking && inner.speech_start.is_none() {
            inner.speech_start = Some(Instant::now());
        }
    }

    pub fn notify_vad_speech_stopped(&self) {
        self.inner.lock().speech_start = None;
    }

    /// §4.9 barge-in rule: sustained speech beyond `speechStopDebounceMs`
    /// while the assistant is speaking. Called on a tick (e.g. every VAD
    /// frame) so sustained-duration can be evaluated without a dedicated
    /// timer task.
    pub async fn evaluate(&self) {
        let policy = self.policy();
        if !policy.allow_barge_in {
            return;
        }

        let sustained = {
            let inner = self.inner.lock();
            inner.assistant_speaking
                && inner
                    .speech_start
                    .is_some_and(|start| start.elapsed() >= Duration::from_millis(policy.speech_stop_debounce_ms))
        };

        if sustained
            && self
                .barge_in_fired
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            debug!("barge-in threshold exceeded, emitting interruption");
            self.on_event
                .emit(InterruptionEvent::Interruption { source: InterruptionSource::Vad })
                .await;
            self.on_event.emit(InterruptionEvent::TurnEnded).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assertive_profile_clamps_as_spec_requires() {
        let engine = InterruptionEngine::new(PolicyProfile::Assertive);
        let p = engine.policy();
        assert!(p.interruption_budget_ms <= 220);
        assert!(p.completion_grace_ms <= 120);
    }

    #[test]
    fn hands_free_disables_barge_in_and_ducks() {
        let engine = InterruptionEngine::new(PolicyProfile::HandsFree);
        let p = engine.policy();
        assert!(!p.allow_barge_in);
        assert_eq!(p.fallback_mode, FallbackMode::Duck);
    }

    #[tokio::test]
    async fn no_barge_in_when_disallowed() {
        let engine = InterruptionEngine::new(PolicyProfile::HandsFree);
        engine.notify_assistant_speaking(true);
        engine.notify_vad_speech_started();
        tokio::time::sleep(Duration::from_millis(5)).await;
        engine.evaluate().await;
        assert!(!engine.barge_in_fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn barge_in_fires_once_after_sustained_speech() {
        let engine = InterruptionEngine::new(PolicyProfile::Standard);
        engine.set_policy(PolicyProfile::Standard);
        // shrink the debounce for a fast test via a fresh policy override
        {
            let mut p = engine.policy.lock();
            p.speech_stop_debounce_ms = 5;
            p.allow_barge_in = true;
        }
        engine.notify_assistant_speaking(true);
        engine.notify_vad_speech_started();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let fired = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_clone = fired.clone();
        engine.on_event(std::sync::Arc::new(move |_: InterruptionEvent| {
            let fired = fired_clone.clone();
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        }));

        engine.evaluate().await;
        engine.evaluate().await;
        assert_eq!(fired.load(Ordering::SeqCst), 2, "one interruption + one turn-ended event");
    }
}
