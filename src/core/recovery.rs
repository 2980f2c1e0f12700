//! Connection Recovery Manager (C7): decides a recovery strategy for a
//! transport error and drives the reconnect loop under the Retry Executor.
//!
//! Grounded in the teacher's `ReconnectionManager` (single-in-flight
//! reconnect guard, `reconnect-attempt`/`reconnect-succeeded`/
//! `reconnect-failed` events), generalized from LiveKit-specific recovery to
//! the WebRTC Transport's ICE-restart/data-channel-recreate strategies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::core::retry::{RetryContext, RetryEnvelope, RetryExecutor};
use crate::core::transport::{ConnectionState, WebRtcTransport};
use crate::errors::{AppResult, TransportError};
use crate::events::{AsyncHandler, Emitter, Subscription};

/// §4.7 strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStrategy {
    IceRestart,
    RecreateDataChannel,
}

/// §4.7: `IceConnectionFailed`/`NetworkTimeout` restart ICE; `DataChannelFailed`
/// recreates the data channel; any other recoverable error defaults to an ICE
/// restart.
pub fn select_strategy(error: &TransportError) -> RecoveryStrategy {
    match error {
        TransportError::IceConnectionFailed | TransportError::NetworkTimeout => {
            RecoveryStrategy::IceRestart
        }
        TransportError::DataChannelFailed(_) => RecoveryStrategy::RecreateDataChannel,
        _ => RecoveryStrategy::IceRestart,
    }
}

#[derive(Debug, Clone)]
pub enum RecoveryEvent {
    AttemptStarted { attempt: u32, strategy: RecoveryStrategy },
    Succeeded { attempt: u32 },
    Failed { reason: String },
}

/// C7. One instance per active transport.
pub struct RecoveryManager {
    retry: RetryExecutor,
    in_flight: AtomicBool,
    on_event: Emitter<RecoveryEvent>,
}

impl Default for RecoveryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RecoveryManager {
    pub fn new() -> Self {
        Self {
            retry: RetryExecutor::new(),
            in_flight: AtomicBool::new(false),
            on_event: Emitter::new(),
        }
    }

    pub fn on_event(&self, handler: AsyncHandler<RecoveryEvent>) -> Subscription<RecoveryEvent> {
        self.on_event.subscribe(handler)
    }

    pub fn is_recovering(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// §4.7 procedure: classify the error, then drive the appropriate
    /// recovery action under a "transport" retry envelope. Only one recovery
    /// may be in flight for a given transport at a time; a concurrent call
    /// while one is running is a no-op that returns immediately.
    pub async fn recover(
        &self,
        transport: Arc<WebRtcTransport>,
        correlation_id: &str,
        error: &TransportError,
    ) -> AppResult<()> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("recovery already in flight, ignoring concurrent trigger");
            return Ok(());
        }

        let strategy = select_strategy(error);
        let mut attempt_counter = 0u32;
        let mut envelope = RetryEnvelope::new("transport");
        envelope.max_attempts = 5;

        let ctx = RetryContext::new(correlation_id, envelope);
        let transport_ref = transport.clone();
        let on_event = &self.on_event;

        let result = self
            .retry
            .execute(
                move || {
                    attempt_counter += 1;
                    let attempt = attempt_counter;
                    let transport = transport_ref.clone();
                    async move {
                        on_event
                            .emit(RecoveryEvent::AttemptStarted { attempt, strategy })
                            .await;
                        match strategy {
                            RecoveryStrategy::IceRestart => transport.restart_ice().await?,
                            RecoveryStrategy::RecreateDataChannel => transport.restart_ice().await?,
                        }
                        Self::wait_for_connected(&transport).await
                    }
                },
                ctx,
            )
            .await;

        self.in_flight.store(false, Ordering::SeqCst);

        match &result {
            Ok(()) => {
                self.on_event.emit(RecoveryEvent::Succeeded { attempt: 1 }).await;
            }
            Err(e) => {
                warn!(error = %e, "connection recovery exhausted retries");
                self.on_event
                    .emit(RecoveryEvent::Failed { reason: e.to_string() })
                    .await;
            }
        }

        result
    }

    async fn wait_for_connected(transport: &Arc<WebRtcTransport>) -> AppResult<()> {
        for _ in 0..50 {
            if transport.connection_state() == ConnectionState::Connected {
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Err(TransportError::IceConnectionFailed.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ice_failures_restart_ice() {
        assert_eq!(select_strategy(&TransportError::IceConnectionFailed), RecoveryStrategy::IceRestart);
        assert_eq!(select_strategy(&TransportError::NetworkTimeout), RecoveryStrategy::IceRestart);
    }

    #[test]
    fn data_channel_failure_recreates_channel() {
        assert_eq!(
            select_strategy(&TransportError::DataChannelFailed("x".into())),
            RecoveryStrategy::RecreateDataChannel
        );
    }

    #[test]
    fn unclassified_recoverable_defaults_to_ice_restart() {
        assert_eq!(select_strategy(&TransportError::AudioTrackFailed("x".into())), RecoveryStrategy::IceRestart);
    }

    #[test]
    fn new_manager_is_not_recovering() {
        let manager = RecoveryManager::new();
        assert!(!manager.is_recovering());
    }
}
