//! Integration tests exercising the breaker and the limiter together,
//! the way a caller wiring both into a single request path would.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use loadshed::{Breaker, BreakerConfig, DoneInfo, Limiter, LimiterConfig, RateLimiter};

fn fast_breaker(seed: u64) -> Breaker {
    Breaker::with_seed(
        BreakerConfig {
            window: Duration::from_millis(200),
            bucket: 8,
            request: 50,
            success: 0.5,
        },
        seed,
    )
}

fn fast_limiter(cpu: Arc<AtomicI64>) -> Limiter {
    Limiter::new(LimiterConfig {
        window: Duration::from_millis(500),
        bucket: 5,
        cpu_threshold: 800,
        cpu_quota: None,
        cpu_fn: Some(Arc::new(move || cpu.load(Ordering::Relaxed))),
    })
}

#[test]
fn breaker_and_limiter_compose_on_the_same_call() {
    let breaker = fast_breaker(7);
    let cpu = Arc::new(AtomicI64::new(100));
    let limiter = fast_limiter(cpu);

    for _ in 0..100 {
        assert!(breaker.allow().is_ok());
        let done = limiter.allow().expect("low cpu admits");
        breaker.mark_success();
        done(DoneInfo { failed: false });
    }
}

#[test]
fn limiter_sheds_under_concurrent_load_while_cpu_is_high() {
    let breaker = fast_breaker(11);
    let cpu = Arc::new(AtomicI64::new(900));
    let limiter = Arc::new(fast_limiter(Arc::clone(&cpu)));

    // Warm up the window with fast, sequential completions: a cold
    // limiter's minRT is the `NO_RT_SENTINEL_MS` default, which makes
    // maxInFlight() enormous regardless of in-flight count. A handful
    // of near-instant round-trips pulls minRT down to a realistic
    // value so the capacity estimate is actually small.
    for _ in 0..20 {
        let done = limiter.allow().expect("a lone caller is never rejected on capacity alone");
        breaker.mark_success();
        done(DoneInfo::default());
    }
    // Let the warmed-up bucket close so its samples leave the
    // currently-forming bucket and feed maxPass()/minRT().
    std::thread::sleep(Duration::from_millis(120));

    // Drive genuine concurrent in-flight load: every thread blocks on
    // a barrier so `Allow()` is called by all of them at once, then
    // holds its `done` open for a while before releasing it. With
    // maxInFlight() now small (near-zero observed RT), this many
    // concurrent callers must exceed it.
    const CONCURRENT_CALLERS: usize = 32;
    let barrier = Arc::new(Barrier::new(CONCURRENT_CALLERS));
    let rejected = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..CONCURRENT_CALLERS)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            let barrier = Arc::clone(&barrier);
            let rejected = Arc::clone(&rejected);
            std::thread::spawn(move || {
                barrier.wait();
                match limiter.allow() {
                    Ok(done) => {
                        std::thread::sleep(Duration::from_millis(50));
                        done(DoneInfo::default());
                    }
                    Err(_) => {
                        rejected.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("caller thread panicked");
    }

    assert!(
        rejected.load(Ordering::Relaxed) > 0,
        "high cpu plus genuine concurrent in-flight load should shed some callers"
    );
    assert!(breaker.allow().is_ok(), "breaker stays closed: every admitted call succeeded");
}

#[test]
fn breaker_opens_independently_of_limiter_admission() {
    let breaker = fast_breaker(13);
    let cpu = Arc::new(AtomicI64::new(0));
    let limiter = fast_limiter(cpu);

    for _ in 0..10_000_000 {
        breaker.mark_failed();
    }
    // The limiter has no opinion on outcome ratios; it still admits.
    assert!(limiter.allow().is_ok());
    assert!(breaker.allow().is_err(), "breaker sheds on its own success-ratio signal");
}

#[test]
fn limiter_done_callback_releases_in_flight_even_when_marked_failed() {
    let cpu = Arc::new(AtomicI64::new(0));
    let limiter = fast_limiter(cpu);
    let before = limiter.stat().in_flight;
    let done = limiter.allow().expect("low cpu admits");
    assert_eq!(limiter.stat().in_flight, before + 1);
    done(DoneInfo { failed: true });
    assert_eq!(limiter.stat().in_flight, before);
}
