//! CPU-aware adaptive concurrency limiter (C4): a BBR-style admission
//! control that rejects requests once estimated in-flight concurrency
//! exceeds the system's estimated service capacity *and* CPU pressure
//! is high, with a 1s cool-down once it starts shedding.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cpu;
use crate::error::{DoneFunc, DoneInfo, LoadShedError, RateLimiter};
use crate::window::RollingCounter;

/// "No RT samples yet" sentinel, standing in for the spec's
/// `ceil(MAX_FLOAT64)` default without risking overflow when it is
/// multiplied into [`Limiter::max_in_flight`].
const NO_RT_SENTINEL_MS: f64 = 1.0e15;

/// Limiter construction parameters. Defaults match spec.md §4.4.
#[derive(Clone)]
pub struct LimiterConfig {
    /// Total rolling-window horizon for both the pass-count and RT counters.
    pub window: Duration,
    /// Number of buckets the window is divided into.
    pub bucket: usize,
    /// CPU usage (per-mille) above which the limiter starts enforcing
    /// its in-flight guard.
    pub cpu_threshold: i64,
    /// Override for the CPU reader's quota denominator, for
    /// environments where the quota can't be auto-discovered (e.g. a
    /// container runtime that hides cgroup files from this process).
    /// Expressed in whole cores.
    pub cpu_quota: Option<f64>,
    /// Injectable CPU source, for tests. When `None`, binds to the
    /// global CPU sampler (C2), starting it if it isn't running yet.
    pub cpu_fn: Option<Arc<dyn Fn() -> i64 + Send + Sync>>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            bucket: 100,
            cpu_threshold: 800,
            cpu_quota: None,
            cpu_fn: None,
        }
    }
}

/// Read-only snapshot of the limiter's internal state, for diagnostics
/// and metrics exporters that live outside this crate.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct LimiterStat {
    pub cpu: i64,
    pub in_flight: i64,
    pub max_in_flight: i64,
    pub min_rt: i64,
    pub max_pass: i64,
}

/// CPU-aware BBR-style adaptive concurrency limiter.
pub struct Limiter {
    pass_stat: Arc<RollingCounter>,
    rt_stat: Arc<RollingCounter>,
    in_flight: Arc<AtomicI64>,
    prev_drop_time: Mutex<Option<Instant>>,
    buckets_per_second: f64,
    cpu_threshold: i64,
    cpu_fn: Arc<dyn Fn() -> i64 + Send + Sync>,
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Self {
        let bucket_duration = config.window / config.bucket as u32;
        let buckets_per_second = config.bucket as f64 / config.window.as_secs_f64();
        let cpu_fn = config
            .cpu_fn
            .clone()
            .unwrap_or_else(|| default_cpu_fn(config.cpu_quota));
        Self {
            pass_stat: Arc::new(RollingCounter::new(config.bucket, bucket_duration)),
            rt_stat: Arc::new(RollingCounter::new(config.bucket, bucket_duration)),
            in_flight: Arc::new(AtomicI64::new(0)),
            prev_drop_time: Mutex::new(None),
            buckets_per_second,
            cpu_threshold: config.cpu_threshold,
            cpu_fn,
        }
    }

    fn cpu(&self) -> i64 {
        (self.cpu_fn)()
    }

    /// Largest per-bucket pass count observed over the window,
    /// excluding the currently-forming bucket. Defaults to `1` at cold
    /// start (open question #2: kept conservative, matching
    /// `original_source/ratelimiter/lbbr`'s `TestMaxPass`).
    fn max_pass(&self) -> f64 {
        self.pass_stat
            .live_buckets_excluding_current()
            .into_iter()
            .map(|b| b.sum)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))))
            .unwrap_or(1.0)
    }

    /// Smallest per-bucket average RT (ms) observed over the window,
    /// excluding the currently-forming bucket. Ceiled to match
    /// `original_source/ratelimiter/lbbr`'s `minRT()` (`math.Ceil` over
    /// the raw average, per `TestMinRt`'s `ceil(5.5) == 6`), so a
    /// sub-millisecond average still counts as a whole millisecond of
    /// latency rather than rounding the capacity estimate down to zero.
    fn min_rt(&self) -> f64 {
        self.rt_stat
            .live_buckets_excluding_current()
            .into_iter()
            .filter_map(|b| b.avg())
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.min(v))))
            .map(f64::ceil)
            .unwrap_or(NO_RT_SENTINEL_MS)
    }

    /// `ceil(maxPass * minRT * bucketsPerSecond / 1000)`, floored at 1.
    pub fn max_in_flight(&self) -> i64 {
        let raw = (self.max_pass() * self.min_rt() * self.buckets_per_second / 1000.0).ceil();
        if !raw.is_finite() || raw > i64::MAX as f64 {
            i64::MAX
        } else {
            (raw as i64).max(1)
        }
    }

    fn should_drop(&self) -> bool {
        let cpu = self.cpu();
        if cpu < self.cpu_threshold {
            let in_cold_period = match *self.prev_drop_time.lock().unwrap() {
                Some(t) => Instant::now().saturating_duration_since(t) <= Duration::from_secs(1),
                None => false,
            };
            if !in_cold_period {
                return false;
            }
        }

        let max_in_flight = self.max_in_flight();
        let in_flight = self.in_flight.load(Ordering::Relaxed);
        if in_flight + 1 > max_in_flight {
            let was_already_dropping = self.prev_drop_time.lock().unwrap().is_some_and(|t| {
                Instant::now().saturating_duration_since(t) <= Duration::from_secs(1)
            });
            *self.prev_drop_time.lock().unwrap() = Some(Instant::now());
            if !was_already_dropping {
                tracing::warn!(cpu, in_flight, max_in_flight, "limiter entering cold period");
            }
            true
        } else {
            false
        }
    }

    /// Read-only snapshot of the limiter's internal state.
    pub fn stat(&self) -> LimiterStat {
        LimiterStat {
            cpu: self.cpu(),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            max_in_flight: self.max_in_flight(),
            min_rt: self.min_rt().min(i64::MAX as f64) as i64,
            max_pass: self.max_pass() as i64,
        }
    }
}

impl RateLimiter for Limiter {
    fn allow(&self) -> Result<DoneFunc, LoadShedError> {
        if self.should_drop() {
            tracing::debug!("limiter rejected request");
            return Err(LoadShedError::LimitExceeded);
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let start = Instant::now();
        let in_flight = Arc::clone(&self.in_flight);
        let pass_stat = Arc::clone(&self.pass_stat);
        let rt_stat = Arc::clone(&self.rt_stat);

        Ok(Box::new(move |info: DoneInfo| {
            let rt_ms = start.elapsed().as_millis() as f64;
            rt_stat.add(rt_ms);
            if !info.failed {
                pass_stat.add(1.0);
            }
            in_flight.fetch_sub(1, Ordering::Relaxed);
        }))
    }
}

/// Build the CPU source bound to the global sampler, applying the
/// quota-override rescale when the caller has told us the auto-
/// discovered quota can't be trusted: `usage_per_mille_of_host *
/// (host_cores / quota_cores)` approximates usage relative to the
/// caller-supplied quota.
fn default_cpu_fn(cpu_quota: Option<f64>) -> Arc<dyn Fn() -> i64 + Send + Sync> {
    cpu::start_global_sampler();
    match cpu_quota {
        Some(quota) if quota > 0.0 => {
            let host_cores = std::thread::available_parallelism()
                .map(|n| n.get() as f64)
                .unwrap_or(1.0);
            let scale = host_cores / quota;
            Arc::new(move || {
                let raw = cpu::global_cpu_permille() as f64 * scale;
                raw.round().clamp(0.0, 1000.0) as i64
            })
        }
        _ => Arc::new(cpu::global_cpu_permille),
    }
}
