//! Shared state for the dev control server.
//!
//! Grounded in the teacher's `AppState` connection-accounting pattern
//! (`middleware::connection_limit`): a global WebSocket connection cap plus a
//! per-IP cap, here expressed directly in terms of the session cap (§3
//! `N_max`) rather than a separate unrelated limit, since the dev server's
//! only job is to let a local harness exercise one `SessionManager`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::AssistantConfig;
use crate::core::session::SessionManager;
use crate::core::timers::TimerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionLimitError {
    GlobalLimitReached,
    PerIpLimitReached,
}

pub struct AppState {
    pub config: AssistantConfig,
    pub sessions: Arc<SessionManager>,
    ws_connections: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
}

impl AppState {
    pub fn new(config: AssistantConfig) -> Self {
        let timers = Arc::new(TimerManager::new());
        let sessions = SessionManager::new(&config, timers);
        Self {
            config,
            sessions,
            ws_connections: AtomicUsize::new(0),
            per_ip: Mutex::new(HashMap::new()),
        }
    }

    pub fn ws_connection_count(&self) -> usize {
        self.ws_connections.load(Ordering::SeqCst)
    }

    pub fn ip_connection_count(&self, ip: &IpAddr) -> usize {
        self.per_ip.lock().get(ip).copied().unwrap_or(0)
    }

    /// Mirrors `SessionManager`'s own `N_max` cap (§3) for the dev server's
    /// WebSocket front door, plus a per-IP cap so one client can't alone
    /// exhaust the concurrent-session budget.
    pub fn try_acquire_connection(&self, ip: IpAddr) -> Result<(), ConnectionLimitError> {
        if self.ws_connections.load(Ordering::SeqCst) >= self.config.session.max_concurrent_sessions {
            return Err(ConnectionLimitError::GlobalLimitReached);
        }

        let mut per_ip = self.per_ip.lock();
        let count = per_ip.entry(ip).or_insert(0);
        if *count >= self.config.session.max_connections_per_ip {
            return Err(ConnectionLimitError::PerIpLimitReached);
        }
        *count += 1;
        self.ws_connections.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    pub fn release_connection(&self, ip: IpAddr) {
        self.ws_connections.fetch_sub(1, Ordering::SeqCst);
        let mut per_ip = self.per_ip.lock();
        if let Some(count) = per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                per_ip.remove(&ip);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_config(global: usize, per_ip: usize) -> AssistantConfig {
        let mut cfg = AssistantConfig::default();
        cfg.api_key = "test".to_string();
        cfg.session.max_concurrent_sessions = global;
        cfg.session.max_connections_per_ip = per_ip;
        cfg
    }

    #[test]
    fn per_ip_limit_rejects_beyond_cap() {
        let state = AppState::new(test_config(10, 2));
        let ip: IpAddr = Ipv4Addr::new(127, 0, 0, 1).into();
        assert!(state.try_acquire_connection(ip).is_ok());
        assert!(state.try_acquire_connection(ip).is_ok());
        assert_eq!(
            state.try_acquire_connection(ip),
            Err(ConnectionLimitError::PerIpLimitReached)
        );
    }

    #[test]
    fn global_limit_rejects_beyond_cap_across_ips() {
        let state = AppState::new(test_config(1, 10));
        let a: IpAddr = Ipv4Addr::new(127, 0, 0, 1).into();
        let b: IpAddr = Ipv4Addr::new(127, 0, 0, 2).into();
        assert!(state.try_acquire_connection(a).is_ok());
        assert_eq!(
            state.try_acquire_connection(b),
            Err(ConnectionLimitError::GlobalLimitReached)
        );
    }

    #[test]
    fn release_frees_both_counters() {
        let state = AppState::new(test_config(5, 5));
        let ip: IpAddr = Ipv4Addr::new(127, 0, 0, 1).into();
        state.try_acquire_connection(ip).unwrap();
        assert_eq!(state.ws_connection_count(), 1);
        state.release_connection(ip);
        assert_eq!(state.ws_connection_count(), 0);
        assert_eq!(state.ip_connection_count(&ip), 0);
    }
}
