//! Microbenchmarks of the admission hot path under low contention: the
//! cost callers pay on every request regardless of whether it is
//! ultimately admitted or rejected.

use criterion::{criterion_group, criterion_main, Criterion};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use loadshed::{Breaker, BreakerConfig, DoneInfo, Limiter, LimiterConfig, RateLimiter};

fn breaker_allow(c: &mut Criterion) {
    let breaker = Breaker::with_seed(BreakerConfig::default(), 1);
    breaker.mark_success();
    c.bench_function("breaker_allow_closed", |b| {
        b.iter(|| {
            let _ = breaker.allow();
            breaker.mark_success();
        })
    });
}

fn limiter_allow_admit(c: &mut Criterion) {
    let cpu = Arc::new(AtomicI64::new(100));
    let limiter = Limiter::new(LimiterConfig {
        window: Duration::from_secs(1),
        bucket: 10,
        cpu_threshold: 800,
        cpu_quota: None,
        cpu_fn: Some(Arc::new(move || cpu.load(Ordering::Relaxed))),
    });
    c.bench_function("limiter_allow_admit", |b| {
        b.iter(|| {
            if let Ok(done) = limiter.allow() {
                done(DoneInfo::default());
            }
        })
    });
}

criterion_group!(benches, breaker_allow, limiter_allow_admit);
criterion_main!(benches);
