//! Sliding-window circuit breaker (C3): a success-ratio admission
//! control with probabilistic half-open recovery. Decisions are
//! derived fresh from the rolling window on every call — there is no
//! materialized `Closed`/`Open`/`HalfOpen` state variable, matching the
//! counter-derived contract in spec.md §3.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::LoadShedError;
use crate::window::RollingCounter;

/// Breaker construction parameters. Defaults match spec.md §4.3.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Total rolling-window horizon.
    pub window: Duration,
    /// Number of buckets the window is divided into.
    pub bucket: usize,
    /// Minimum sample count below which the breaker always admits.
    pub request: u64,
    /// Target success ratio in `(0, 1]`. `k = 1 / success`.
    pub success: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(3),
            bucket: 10,
            request: 100,
            success: 0.6,
        }
    }
}

/// Success-ratio circuit breaker.
///
/// Outcomes are recorded into two rolling counters sharing the same
/// bucket cadence — `total_stat` incremented on every outcome,
/// `success_stat` incremented only on success — which together realize
/// the spec's "one counter holding two parallel sums"
/// (`totalCount`/`successCount`) without needing a bucket type with
/// two independent numeric fields.
pub struct Breaker {
    success_stat: RollingCounter,
    total_stat: RollingCounter,
    request_threshold: u64,
    k: f64,
    rng: Mutex<StdRng>,
    warned: AtomicBool,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    /// Construct with a deterministically-seeded RNG, for reproducible
    /// tests of the probabilistic admission path.
    pub fn with_seed(config: BreakerConfig, seed: u64) -> Self {
        Self::with_rng(config, StdRng::seed_from_u64(seed))
    }

    fn with_rng(config: BreakerConfig, rng: StdRng) -> Self {
        assert!(
            config.success > 0.0 && config.success <= 1.0,
            "success ratio must be in (0, 1]"
        );
        let bucket_duration = config.window / config.bucket as u32;
        Self {
            success_stat: RollingCounter::new(config.bucket, bucket_duration),
            total_stat: RollingCounter::new(config.bucket, bucket_duration),
            request_threshold: config.request,
            k: 1.0 / config.success,
            rng: Mutex::new(rng),
            warned: AtomicBool::new(false),
        }
    }

    /// Record a successful outcome.
    pub fn mark_success(&self) {
        self.success_stat.add(1.0);
        self.total_stat.add(1.0);
    }

    /// Record a failed outcome.
    pub fn mark_failed(&self) {
        self.total_stat.add(1.0);
    }

    /// `(successCount, totalCount)` summarized over the live window.
    fn summary(&self) -> (u64, u64) {
        (self.success_stat.sum() as u64, self.total_stat.sum() as u64)
    }

    /// Draw `u ~ Uniform[0, 1)` and return `u < p`.
    fn true_on_proba(&self, p: f64) -> bool {
        let mut rng = self.rng.lock().unwrap();
        let u: f64 = rng.gen();
        u < p
    }

    /// Decide whether to admit the next request.
    pub fn allow(&self) -> Result<(), LoadShedError> {
        let (s, t) = self.summary();
        if t == 0 {
            return Ok(());
        }
        let k_s = self.k * s as f64;
        if (t as f64) < self.request_threshold as f64 || (t as f64) < k_s {
            self.warned.store(false, Ordering::Relaxed);
            return Ok(());
        }

        let p = ((t as f64 - k_s) / (t as f64 + 1.0)).max(0.0);
        if p >= 0.5 {
            if !self.warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(success = s, total = t, drop_probability = p, "circuit breaker under sustained failure");
            }
        } else {
            self.warned.store(false, Ordering::Relaxed);
        }

        if self.true_on_proba(p) {
            tracing::debug!(drop_probability = p, "circuit breaker rejected request");
            Err(LoadShedError::NotAllowed)
        } else {
            Ok(())
        }
    }
}
