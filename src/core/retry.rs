//! Retry Executor (C1): runs an async operation under a retry envelope,
//! driving a domain-keyed circuit breaker.
//!
//! Grounded in the teacher's `ReconnectionConfig::calculate_delay` backoff
//! shape, but the jitter source is replaced: the teacher seeds an LCG from
//! wall-clock time (non-deterministic), while delays here must be
//! deterministic given `(correlationId, attempt)` so retry schedules are
//! reproducible in tests and across restarts of a resumed operation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult, StateError};

/// Backoff shape, §3 `Retry Envelope.policy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    None,
    Immediate,
    Linear,
    Exponential,
    Hybrid,
}

/// §4.1 step 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterStrategy {
    None,
    DeterministicFull,
    DeterministicEqual,
}

/// §3 `Retry Envelope`.
#[derive(Debug, Clone)]
pub struct RetryEnvelope {
    pub domain: String,
    pub policy: RetryPolicy,
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
    pub jitter_strategy: JitterStrategy,
    pub cool_down_ms: u64,
    pub failure_budget_ms: u64,
    /// Circuit breaker opens once successive failures reach this count
    /// within the domain. Domain-specific; defaults to 3 per §4.1 step 3.
    pub breaker_threshold: u32,
}

impl RetryEnvelope {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            policy: RetryPolicy::Exponential,
            initial_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 5000,
            max_attempts: 5,
            jitter_strategy: JitterStrategy::DeterministicFull,
            cool_down_ms: 30_000,
            failure_budget_ms: 120_000,
            breaker_threshold: 3,
        }
    }
}

/// §3 `Circuit Breaker State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct CircuitBreaker {
    state: BreakerState,
    successive_failures: u32,
    opened_at: Option<u64>,
    cooldown_until: Option<u64>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            successive_failures: 0,
            opened_at: None,
            cooldown_until: None,
        }
    }
}

/// Domain-keyed circuit breaker registry shared across retry calls for the
/// same component (e.g. all credential renewals share the `auth` breaker).
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: parking_lot::Mutex<HashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, domain: &str) -> BreakerState {
        self.breakers
            .lock()
            .get(domain)
            .map(|b| b.state)
            .unwrap_or(BreakerState::Closed)
    }
}

/// A scheduled retry, handed to `on_retry_scheduled`.
#[derive(Debug, Clone)]
pub struct RetryPlan {
    pub attempt: u32,
    pub delay_ms: u64,
}

pub type OnFailure = Arc<dyn Fn(u32, &AppError) -> bool + Send + Sync>;
pub type OnRetryScheduled = Arc<dyn Fn(&RetryPlan) + Send + Sync>;
pub type OnCircuitOpen = Arc<dyn Fn() + Send + Sync>;
pub type OnComplete = Arc<dyn Fn() + Send + Sync>;

/// `ctx` of the `execute(op, ctx)` contract in §4.1.
pub struct RetryContext {
    pub correlation_id: String,
    pub envelope: RetryEnvelope,
    /// Returns `true` if the operation should be retried after this
    /// failure. Defaults to the error's own `is_retryable()` classification
    /// when absent.
    pub on_failure: Option<OnFailure>,
    pub on_retry_scheduled: Option<OnRetryScheduled>,
    pub on_circuit_open: Option<OnCircuitOpen>,
    pub on_complete: Option<OnComplete>,
}

impl RetryContext {
    pub fn new(correlation_id: impl Into<String>, envelope: RetryEnvelope) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            envelope,
            on_failure: None,
            on_retry_scheduled: None,
            on_circuit_open: None,
            on_complete: None,
        }
    }
}

/// Deterministic `hash(correlationId, attempt)` used for jitter, per §4.1
/// step 5 and the `P5`/scenario-3 testable properties. SHA-256 over
/// `"{correlationId}:{attempt}"`, taking the leading 4 bytes big-endian.
pub fn hash_u32(correlation_id: &str, attempt: u32) -> u32 {
    let mut hasher = Sha256::new();
    hasher.update(correlation_id.as_bytes());
    hasher.update(b":");
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

fn deterministic_unit(correlation_id: &str, attempt: u32) -> f64 {
    hash_u32(correlation_id, attempt) as f64 / (u32::MAX as f64 + 1.0)
}

/// §4.1 step 4: base delay before jitter, for `attempt` (1-based).
fn base_delay_ms(envelope: &RetryEnvelope, attempt: u32) -> u64 {
    match envelope.policy {
        RetryPolicy::None | RetryPolicy::Immediate => 0,
        RetryPolicy::Exponential => {
            let raw = envelope.initial_delay_ms as f64 * envelope.multiplier.powi(attempt as i32 - 1);
            (raw as u64).min(envelope.max_delay_ms)
        }
        RetryPolicy::Linear => {
            let raw =
                envelope.initial_delay_ms as f64 + (attempt as f64 - 1.0) * envelope.multiplier;
            (raw as u64).min(envelope.max_delay_ms)
        }
        RetryPolicy::Hybrid => match attempt {
            1 => 0,
            2 => envelope.initial_delay_ms,
            k => {
                let raw = envelope.initial_delay_ms as f64 * envelope.multiplier.powi((k - 2) as i32 - 1);
                (raw as u64).min(envelope.max_delay_ms)
            }
        },
    }
}

/// §4.1 step 5: apply deterministic jitter to a base delay.
fn apply_jitter(base: u64, strategy: JitterStrategy, correlation_id: &str, attempt: u32) -> u64 {
    if base == 0 {
        return 0;
    }
    match strategy {
        JitterStrategy::None => base,
        JitterStrategy::DeterministicFull => {
            let u = deterministic_unit(correlation_id, attempt);
            (base as f64 * u) as u64
        }
        JitterStrategy::DeterministicEqual => {
            let u = deterministic_unit(correlation_id, attempt);
            let half = base / 2;
            half + (half as f64 * u) as u64
        }
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Executes operations under retry envelopes, owning one circuit breaker
/// registry shared by all calls against the same `RetryExecutor` instance
/// (a component typically keeps one executor per fault domain family).
pub struct RetryExecutor {
    breakers: CircuitBreakerRegistry,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryExecutor {
    pub fn new() -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(),
        }
    }

    pub fn breaker_state(&self, domain: &str) -> BreakerState {
        self.breakers.state(domain)
    }

    /// §4.1 full algorithm.
    pub async fn execute<T, Op, Fut>(&self, mut op: Op, ctx: RetryContext) -> AppResult<T>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let domain = ctx.envelope.domain.clone();
        let start = now_ms();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            // Step 1: consult circuit breaker.
            {
                let mut breakers = self.breakers.breakers.lock();
                let breaker = breakers.entry(domain.clone()).or_default();
                if breaker.state == BreakerState::Open {
                    let cooldown_elapsed = breaker.cooldown_until.is_none_or(|until| now_ms() >= until);
                    if cooldown_elapsed {
                        breaker.state = BreakerState::HalfOpen;
                        debug!(domain, "circuit breaker half-open after cooldown");
                    } else {
                        drop(breakers);
                        if let Some(cb) = &ctx.on_circuit_open {
                            cb();
                        }
                        return Err(StateError::CircuitOpen.into());
                    }
                }
            }

            // Step 2: run the operation.
            match op().await {
                Ok(value) => {
                    let mut breakers = self.breakers.breakers.lock();
                    let breaker = breakers.entry(domain.clone()).or_default();
                    if breaker.state == BreakerState::HalfOpen {
                        debug!(domain, "circuit breaker closed after successful half-open probe");
                    }
                    breaker.state = BreakerState::Closed;
                    breaker.successive_failures = 0;
                    breaker.opened_at = None;
                    breaker.cooldown_until = None;
                    drop(breakers);
                    if let Some(cb) = &ctx.on_complete {
                        cb();
                    }
                    return Ok(value);
                }
                Err(error) => {
                    // Step 3: bump the breaker's failure count on every failed
                    // attempt, not only when giving up, so a run of failures
                    // can trip the breaker mid-loop.
                    let breaker_opened = {
                        let mut breakers = self.breakers.breakers.lock();
                        let breaker = breakers.entry(domain.clone()).or_default();
                        breaker.successive_failures += 1;
                        if breaker.successive_failures >= ctx.envelope.breaker_threshold {
                            breaker.state = BreakerState::Open;
                            breaker.opened_at = Some(now_ms());
                            breaker.cooldown_until = Some(now_ms() + ctx.envelope.cool_down_ms);
                            warn!(domain, failures = breaker.successive_failures, "circuit breaker opened");
                            true
                        } else {
                            false
                        }
                    };

                    if breaker_opened {
                        return Err(error);
                    }

                    // Step 4: classify and decide whether to retry.
                    let default_retryable = error.is_retryable();
                    let should_retry = ctx
                        .on_failure
                        .as_ref()
                        .map(|f| f(attempt, &error))
                        .unwrap_or(default_retryable)
                        && attempt < ctx.envelope.max_attempts;

                    if !should_retry {
                        return Err(error);
                    }

                    // Step 5 + 6: compute delay with deterministic jitter.
                    let base = base_delay_ms(&ctx.envelope, attempt);
                    let jittered =
                        apply_jitter(base, ctx.envelope.jitter_strategy, &ctx.correlation_id, attempt);

                    // Step 6: clamp to the cumulative failure budget (B2).
                    let elapsed = now_ms().saturating_sub(start);
                    let remaining_budget = ctx.envelope.failure_budget_ms.saturating_sub(elapsed);
                    let delay = jittered.min(remaining_budget);

                    let plan = RetryPlan { attempt, delay_ms: delay };
                    if let Some(cb) = &ctx.on_retry_scheduled {
                        cb(&plan);
                    }

                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn hash_is_deterministic() {
        assert_eq!(hash_u32("cid", 1), hash_u32("cid", 1));
        assert_ne!(hash_u32("cid", 1), hash_u32("cid", 2));
    }

    #[test]
    fn exponential_delay_matches_formula() {
        let mut env = RetryEnvelope::new("transport");
        env.policy = RetryPolicy::Exponential;
        env.initial_delay_ms = 200;
        env.multiplier = 2.0;
        env.max_delay_ms = 5000;
        assert_eq!(base_delay_ms(&env, 1), 200);
        assert_eq!(base_delay_ms(&env, 2), 400);
        assert_eq!(base_delay_ms(&env, 3), 800);
    }

    #[test]
    fn hybrid_delay_schedule() {
        let mut env = RetryEnvelope::new("transport");
        env.policy = RetryPolicy::Hybrid;
        env.initial_delay_ms = 200;
        env.multiplier = 2.0;
        assert_eq!(base_delay_ms(&env, 1), 0);
        assert_eq!(base_delay_ms(&env, 2), 200);
        assert_eq!(base_delay_ms(&env, 3), 200);
        assert_eq!(base_delay_ms(&env, 4), 400);
    }

    #[test]
    fn deterministic_full_jitter_matches_scenario_formula() {
        let correlation_id = "retry-correlation-001";
        for attempt in 1..=2u32 {
            let base = 200u64 * 2u64.pow(attempt - 1);
            let expected = (base as f64 * hash_u32(correlation_id, attempt) as f64
                / (u32::MAX as f64 + 1.0)) as u64;
            let actual = apply_jitter(base, JitterStrategy::DeterministicFull, correlation_id, attempt);
            assert_eq!(actual, expected);
        }
    }

    #[tokio::test]
    async fn retries_transient_errors_and_succeeds() {
        let executor = RetryExecutor::new();
        let calls = AtomicU32::new(0);

        let mut env = RetryEnvelope::new("transport");
        env.policy = RetryPolicy::Exponential;
        env.initial_delay_ms = 1;
        env.max_delay_ms = 2;
        env.jitter_strategy = JitterStrategy::None;
        env.max_attempts = 5;

        let ctx = RetryContext::new("scenario-3", env);
        let result = executor
            .execute(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(crate::errors::TransportError::IceConnectionFailed.into())
                        } else {
                            Ok(42)
                        }
                    }
                },
                ctx,
            )
            .await
            .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_without_invoking_op() {
        let executor = RetryExecutor::new();
        let calls = AtomicU32::new(0);

        let mut env = RetryEnvelope::new("auth");
        env.max_attempts = 4;
        env.jitter_strategy = JitterStrategy::None;
        env.breaker_threshold = 2;
        env.initial_delay_ms = 0;

        let ctx = RetryContext::new("scenario-4", env.clone());
        let _ = executor
            .execute::<(), _, _>(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(crate::errors::AuthError::EndpointError { status: 500, body: "x".into() }.into()) }
                },
                ctx,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.breaker_state("auth"), BreakerState::Open);

        let ctx2 = RetryContext::new("scenario-4b", env);
        let result = executor
            .execute::<(), _, _>(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
                ctx2,
            )
            .await;

        assert!(matches!(result, Err(AppError::State(StateError::CircuitOpen))));
        assert_eq!(calls.load(Ordering::SeqCst), 2, "op must not be invoked while circuit is open");
    }
}
