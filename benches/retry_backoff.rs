//! Retry/backoff micro-benchmarks.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use voicecopilot_core::core::retry::{hash_u32, RetryContext, RetryEnvelope, RetryExecutor};
use voicecopilot_core::errors::{AppResult, SessionError};

/// Benchmarks the deterministic jitter hash used on every retry attempt.
fn bench_hash_u32(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_u32");
    group.throughput(Throughput::Elements(1));

    for attempt in [1u32, 5, 20] {
        group.bench_with_input(
            BenchmarkId::new("attempt", attempt),
            &attempt,
            |b, &attempt| {
                b.iter(|| black_box(hash_u32(black_box("session-bench-correlation"), attempt)));
            },
        );
    }

    group.finish();
}

/// Benchmarks a full retry-executor pass against an operation that always
/// succeeds on the first attempt, isolating the envelope/context bookkeeping
/// overhead from any actual backoff sleep.
fn bench_execute_immediate_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executor = RetryExecutor::new();

    c.bench_function("execute_immediate_success", |b| {
        b.to_async(&rt).iter(|| {
            let ctx = RetryContext::new("bench-correlation", RetryEnvelope::new("bench"));
            async {
                let result: AppResult<u32> = executor
                    .execute(|| async { Ok::<u32, voicecopilot_core::errors::AppError>(1) }, ctx)
                    .await;
                black_box(result.unwrap_or_else(|_| 0));
            }
        });
    });
}

/// Benchmarks the non-retried fast-fail path (a non-retryable error returns
/// immediately without consulting the backoff schedule at all).
fn bench_execute_non_retryable_failure(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let executor = RetryExecutor::new();

    c.bench_function("execute_non_retryable_failure", |b| {
        b.to_async(&rt).iter(|| {
            let ctx = RetryContext::new("bench-correlation-fail", RetryEnvelope::new("bench-fail"));
            async {
                let result: AppResult<()> = executor
                    .execute(
                        || async { Err(SessionError::CapacityExceeded.into()) },
                        ctx,
                    )
                    .await;
                black_box(result.is_err());
            }
        });
    });
}

criterion_group!(
    benches,
    bench_hash_u32,
    bench_execute_immediate_success,
    bench_execute_non_retryable_failure
);
criterion_main!(benches);
