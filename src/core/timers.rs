//! Session Timer Manager (C3): renewal, inactivity, and heartbeat timers
//! per session, registered with the disposal orchestrator so shutdown
//! cancels them deterministically.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::disposal::Disposable;

/// Diagnostics shape returned by `getTimerStatus`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerStatus {
    pub renewal_remaining_ms: Option<u64>,
    pub inactivity_remaining_ms: Option<u64>,
    pub heartbeat_active: bool,
}

struct SessionTimers {
    renewal: Option<JoinHandle<()>>,
    renewal_deadline: Option<Instant>,
    inactivity: Option<JoinHandle<()>>,
    inactivity_deadline: Option<Instant>,
    inactivity_reset: Arc<Notify>,
    heartbeat: Option<JoinHandle<()>>,
}

impl Drop for SessionTimers {
    fn drop(&mut self) {
        if let Some(h) = self.renewal.take() {
            h.abort();
        }
        if let Some(h) = self.inactivity.take() {
            h.abort();
        }
        if let Some(h) = self.heartbeat.take() {
            h.abort();
        }
    }
}

pub type RenewalCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type TimeoutCallback = Arc<dyn Fn(String) + Send + Sync>;
pub type HeartbeatCallback = Arc<dyn Fn(String) + Send + Sync>;

/// C3. One instance shared by the Session Manager across all sessions.
pub struct TimerManager {
    sessions: Mutex<HashMap<String, SessionTimers>>,
}

impl Default for TimerManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerManager {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Schedules all three timers for a freshly started session.
    #[allow(clippy::too_many_arguments)]
    pub fn schedule(
        &self,
        session_id: String,
        renew_in: Duration,
        on_renewal_required: RenewalCallback,
        inactivity_timeout: Duration,
        on_timeout_expired: TimeoutCallback,
        heartbeat_interval: Duration,
        on_heartbeat_check: HeartbeatCallback,
    ) {
        self.cancel(&session_id);

        let renewal_deadline = Instant::now() + renew_in;
        let sid = session_id.clone();
        let renewal = tokio::spawn(async move {
            tokio::time::sleep(renew_in).await;
            on_renewal_required(sid);
        });

        let inactivity_reset = Arc::new(Notify::new());
        let inactivity_deadline = Instant::now() + inactivity_timeout;
        let sid = session_id.clone();
        let reset = inactivity_reset.clone();
        let inactivity = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(inactivity_timeout) => {
                        on_timeout_expired(sid);
                        break;
                    }
                    _ = reset.notified() => {
                        continue;
                    }
                }
            }
        });

        let sid = session_id.clone();
        let heartbeat = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                on_heartbeat_check(sid.clone());
            }
        });

        self.sessions.lock().insert(
            session_id,
            SessionTimers {
                renewal: Some(renewal),
                renewal_deadline: Some(renewal_deadline),
                inactivity: Some(inactivity),
                inactivity_deadline: Some(inactivity_deadline),
                inactivity_reset,
                heartbeat: Some(heartbeat),
            },
        );
    }

    /// Resets the inactivity timer's deadline in response to user/transport
    /// activity, without disturbing the renewal or heartbeat timers.
    pub fn notice_activity(&self, session_id: &str, inactivity_timeout: Duration) {
        let mut sessions = self.sessions.lock();
        if let Some(timers) = sessions.get_mut(session_id) {
            timers.inactivity_deadline = Some(Instant::now() + inactivity_timeout);
            timers.inactivity_reset.notify_one();
        }
    }

    pub fn get_timer_status(&self, session_id: &str) -> Option<TimerStatus> {
        let sessions = self.sessions.lock();
        let timers = sessions.get(session_id)?;
        let now = Instant::now();
        Some(TimerStatus {
            renewal_remaining_ms: timers
                .renewal_deadline
                .map(|d| d.saturating_duration_since(now).as_millis() as u64),
            inactivity_remaining_ms: timers
                .inactivity_deadline
                .map(|d| d.saturating_duration_since(now).as_millis() as u64),
            heartbeat_active: timers.heartbeat.is_some(),
        })
    }

    pub fn cancel(&self, session_id: &str) {
        if self.sessions.lock().remove(session_id).is_some() {
            debug!(session_id, "session timers cancelled");
        }
    }
}

impl Disposable for TimerManager {
    fn dispose<'a>(
        &'a self,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), String>> + Send + 'a>> {
        Box::pin(async move {
            self.sessions.lock().clear();
            Ok(())
        })
    }

    fn name(&self) -> &str {
        "timer-manager"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn renewal_timer_fires_callback() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        manager.schedule(
            "s1".to_string(),
            Duration::from_millis(10),
            Arc::new(move |_| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::from_secs(3600),
            Arc::new(|_| {}),
            Duration::from_secs(3600),
            Arc::new(|_| {}),
        );

        tokio::time::advance(Duration::from_millis(20)).await;
        tokio::task::yield_now().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_removes_status() {
        let manager = TimerManager::new();
        manager.schedule(
            "s1".to_string(),
            Duration::from_secs(10),
            Arc::new(|_| {}),
            Duration::from_secs(10),
            Arc::new(|_| {}),
            Duration::from_secs(10),
            Arc::new(|_| {}),
        );
        assert!(manager.get_timer_status("s1").is_some());
        manager.cancel("s1");
        assert!(manager.get_timer_status("s1").is_none());
    }
}
