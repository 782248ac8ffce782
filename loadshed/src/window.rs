//! Rolling-window counter (C1): a fixed-size ring of time-bucketed
//! aggregates that the breaker and the limiter both build their
//! admission decisions on top of.
//!
//! Bucket rotation is lazy: a bucket is only reset when it is next
//! written to, after its recorded period has gone stale. Reads never
//! mutate state; they simply skip any bucket whose recorded period
//! falls outside the live window. This gives the same observable
//! behavior as eagerly zeroing elapsed buckets on every `add`, without
//! a write needing to touch more than the one bucket it targets.

use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Absolute bucket-duration-sized period this bucket currently
    /// represents, or `None` if it has never been written.
    period: Option<u64>,
    count: u64,
    sum: f64,
    max: f64,
    min: f64,
}

impl Bucket {
    const fn empty() -> Self {
        Self {
            period: None,
            count: 0,
            sum: 0.0,
            max: f64::NEG_INFINITY,
            min: f64::INFINITY,
        }
    }

    fn reset_to(&mut self, period: u64) {
        self.period = Some(period);
        self.count = 0;
        self.sum = 0.0;
        self.max = f64::NEG_INFINITY;
        self.min = f64::INFINITY;
    }

    fn add(&mut self, v: f64) {
        self.count += 1;
        self.sum += v;
        if v > self.max {
            self.max = v;
        }
        if v < self.min {
            self.min = v;
        }
    }
}

/// Point-in-time view of one live bucket, returned by reductions that
/// need per-bucket (rather than whole-window) aggregates.
#[derive(Debug, Clone, Copy)]
pub struct BucketSnapshot {
    pub count: u64,
    pub sum: f64,
    pub max: f64,
    pub min: f64,
}

impl BucketSnapshot {
    /// Bucket average, or `None` if the bucket received no samples.
    pub fn avg(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }
}

struct State {
    buckets: Vec<Bucket>,
}

/// Fixed-size ring of bucketed sample aggregates covering a rolling
/// window `W = size * bucket_duration`.
pub struct RollingCounter {
    anchor: Instant,
    bucket_duration: Duration,
    size: u64,
    state: Mutex<State>,
}

impl RollingCounter {
    pub fn new(size: usize, bucket_duration: Duration) -> Self {
        assert!(size >= 1, "rolling counter size must be >= 1");
        assert!(
            !bucket_duration.is_zero(),
            "bucket duration must be > 0"
        );
        Self {
            anchor: Instant::now(),
            bucket_duration,
            size: size as u64,
            state: Mutex::new(State {
                buckets: vec![Bucket::empty(); size],
            }),
        }
    }

    pub fn window(&self) -> Duration {
        self.bucket_duration * self.size as u32
    }

    pub fn bucket_duration(&self) -> Duration {
        self.bucket_duration
    }

    fn current_period(&self) -> u64 {
        let elapsed = Instant::now().saturating_duration_since(self.anchor);
        (elapsed.as_nanos() / self.bucket_duration.as_nanos().max(1)) as u64
    }

    fn index_of(&self, period: u64) -> usize {
        (period % self.size) as usize
    }

    /// Record one sample at the current bucket, rotating it first if
    /// its previous period has gone stale.
    pub fn add(&self, v: f64) {
        let period = self.current_period();
        let idx = self.index_of(period);
        let mut state = self.state.lock().unwrap();
        let bucket = &mut state.buckets[idx];
        if bucket.period != Some(period) {
            bucket.reset_to(period);
        }
        bucket.add(v);
    }

    /// Fold over every bucket still inside the live window.
    fn reduce<T>(&self, init: T, mut f: impl FnMut(T, &Bucket) -> T) -> T {
        let current = self.current_period();
        let floor = current.saturating_sub(self.size - 1);
        let state = self.state.lock().unwrap();
        let mut acc = init;
        for bucket in state.buckets.iter() {
            if let Some(p) = bucket.period {
                if p >= floor && p <= current {
                    acc = f(acc, bucket);
                }
            }
        }
        acc
    }

    pub fn sum(&self) -> f64 {
        self.reduce(0.0, |acc, b| acc + b.sum)
    }

    /// Alias for [`RollingCounter::sum`], matching the spec's `Value`
    /// reduction (sum of all per-bucket sums).
    pub fn value(&self) -> f64 {
        self.sum()
    }

    pub fn count(&self) -> u64 {
        self.reduce(0, |acc, b| acc + b.count)
    }

    pub fn max(&self) -> f64 {
        self.reduce(f64::NEG_INFINITY, |acc, b| acc.max(b.max))
    }

    pub fn avg(&self) -> f64 {
        let (sum, count) = self.reduce((0.0, 0u64), |(s, c), b| (s + b.sum, c + b.count));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Snapshot every live bucket, excluding the one currently being
    /// written to — its count is not yet representative of a full
    /// bucket duration. Used by the limiter's `maxPass`/`minRT` caches.
    pub fn live_buckets_excluding_current(&self) -> Vec<BucketSnapshot> {
        let current = self.current_period();
        let floor = current.saturating_sub(self.size - 1);
        let state = self.state.lock().unwrap();
        state
            .buckets
            .iter()
            .filter_map(|b| match b.period {
                Some(p) if p >= floor && p < current => Some(BucketSnapshot {
                    count: b.count,
                    sum: b.sum,
                    max: b.max,
                    min: b.min,
                }),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn rc(size: usize, bucket_ms: u64) -> RollingCounter {
        RollingCounter::new(size, Duration::from_millis(bucket_ms))
    }

    #[test]
    fn sum_and_count_accumulate_within_a_bucket() {
        let c = rc(10, 100);
        c.add(1.0);
        c.add(2.0);
        c.add(3.0);
        assert_eq!(c.sum(), 6.0);
        assert_eq!(c.count(), 3);
        assert_eq!(c.max(), 3.0);
        assert_eq!(c.avg(), 2.0);
    }

    #[test]
    fn idle_period_at_least_window_zeroes_all_reductions() {
        let c = rc(5, 20);
        c.add(10.0);
        assert_eq!(c.sum(), 10.0);
        sleep(Duration::from_millis(5 * 20 + 30));
        assert_eq!(c.sum(), 0.0);
        assert_eq!(c.count(), 0);
        assert_eq!(c.avg(), 0.0);
    }

    #[test]
    fn stale_bucket_resets_on_next_write_not_leaking_old_value() {
        let c = rc(4, 20);
        c.add(100.0);
        sleep(Duration::from_millis(4 * 20 + 30));
        c.add(1.0);
        // the only surviving sample is the fresh 1.0 — the stale 100.0
        // bucket either fell out of the window or was overwritten.
        assert_eq!(c.sum(), 1.0);
        assert_eq!(c.count(), 1);
    }

    #[test]
    fn live_buckets_excluding_current_omits_the_forming_bucket() {
        let c = rc(10, 40);
        c.add(100.0);
        let live = c.live_buckets_excluding_current();
        assert!(live.is_empty(), "current bucket must be excluded");
        sleep(Duration::from_millis(45));
        let live = c.live_buckets_excluding_current();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].sum, 100.0);
    }

    #[test]
    fn count_upper_bounded_by_size_times_adds_per_bucket() {
        let c = rc(3, 200);
        for _ in 0..50 {
            c.add(1.0);
        }
        assert!(c.count() <= 3 * 50);
    }
}
