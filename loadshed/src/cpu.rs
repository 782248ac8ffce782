//! Decayed CPU usage sampler (C2): a process-wide singleton that
//! reads OS/cgroup CPU statistics on a fixed 500ms cadence and
//! maintains an exponentially-weighted moving average, in per-mille
//! units (0..1000).
//!
//! Modeled on `rust-executor/src/runtime/shared_runtime.rs`'s
//! `OnceLock`-guarded singleton plus `RuntimeManager` accessor
//! functions, but running a plain `std::thread` instead of a tokio
//! task — `Allow()`/`done()` must work for callers with no async
//! runtime in the process.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const DECAY: f64 = 0.95;

/// Process-wide EWMA of CPU usage, in per-mille of the available quota.
struct Sampler {
    gcpu: AtomicI64,
}

impl Sampler {
    fn new() -> Self {
        Self {
            gcpu: AtomicI64::new(0),
        }
    }

    fn read(&self) -> i64 {
        self.gcpu.load(Ordering::Relaxed)
    }

    /// `cpu_t = decay * cpu_{t-1} + (1 - decay) * raw_t`, raw clamped
    /// to the valid per-mille range before blending.
    fn update(&self, raw: i64) {
        let raw = raw.clamp(0, 1000);
        let prev = self.gcpu.load(Ordering::Relaxed);
        let next = (prev as f64 * DECAY + raw as f64 * (1.0 - DECAY)).round() as i64;
        self.gcpu.store(next, Ordering::Relaxed);
    }
}

static SAMPLER: OnceLock<&'static Sampler> = OnceLock::new();

fn sampler() -> &'static Sampler {
    *SAMPLER.get_or_init(|| {
        let sampler: &'static Sampler = Box::leak(Box::new(Sampler::new()));
        std::thread::Builder::new()
            .name("loadshed-cpu-sampler".into())
            .spawn(move || supervised_loop(sampler))
            .expect("failed to spawn CPU sampler thread");
        sampler
    })
}

/// Start the background sampler, if it hasn't been already. Safe to
/// call more than once or concurrently; only the first call spawns a
/// thread. The limiter calls this implicitly on first use; the
/// breaker never needs CPU, so it never triggers this.
pub fn start_global_sampler() {
    let _ = sampler();
}

/// Current process-wide CPU usage estimate, per-mille. Starts the
/// sampler thread on first call if it is not already running.
pub fn global_cpu_permille() -> i64 {
    sampler().read()
}

/// Run the sample loop, respawning on panic exactly as the spec's
/// supervised-ticker requirement describes. `catch_unwind` stands in
/// for the reference implementation's `recover()` inside a deferred
/// ticker-stop.
fn supervised_loop(sampler: &'static Sampler) {
    loop {
        let result = catch_unwind(AssertUnwindSafe(|| sample_forever(sampler)));
        if let Err(_panic) = result {
            tracing::error!("CPU sampler thread panicked; respawning");
            continue;
        }
        break;
    }
}

fn sample_forever(sampler: &'static Sampler) -> ! {
    let mut reader = CpuReader::new();
    loop {
        std::thread::sleep(SAMPLE_INTERVAL);
        let raw = reader.sample_permille();
        sampler.update(raw);
    }
}

/// Platform CPU reader. On Linux this honors cgroup v1/v2 quotas when
/// discoverable, falling back to whole-machine `/proc/stat` deltas.
/// On other platforms it delegates to `sysinfo`'s global CPU load.
struct CpuReader {
    #[cfg(target_os = "linux")]
    linux: linux::LinuxReader,
    #[cfg(not(target_os = "linux"))]
    other: other::OtherReader,
}

impl CpuReader {
    fn new() -> Self {
        Self {
            #[cfg(target_os = "linux")]
            linux: linux::LinuxReader::new(),
            #[cfg(not(target_os = "linux"))]
            other: other::OtherReader::new(),
        }
    }

    fn sample_permille(&mut self) -> i64 {
        #[cfg(target_os = "linux")]
        {
            self.linux.sample_permille()
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.other.sample_permille()
        }
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use super::Instant;
    use std::fs;

    pub struct LinuxReader {
        quota_cores: Option<f64>,
        cgroup_usage_path: Option<&'static str>,
        prev: Option<(Instant, u64)>,
        prev_global: Option<(u64, u64)>,
    }

    impl LinuxReader {
        pub fn new() -> Self {
            let (quota_cores, cgroup_usage_path) = discover_cgroup();
            Self {
                quota_cores,
                cgroup_usage_path,
                prev: None,
                prev_global: None,
            }
        }

        pub fn sample_permille(&mut self) -> i64 {
            if let (Some(quota_cores), Some(path)) = (self.quota_cores, self.cgroup_usage_path) {
                if let Some(permille) = self.sample_cgroup(quota_cores, path) {
                    return permille;
                }
            }
            self.sample_proc_stat()
        }

        fn sample_cgroup(&mut self, quota_cores: f64, path: &'static str) -> Option<i64> {
            let usage_ns = read_cgroup_usage_ns(path)?;
            let now = Instant::now();
            let permille = match self.prev {
                Some((prev_time, prev_usage)) => {
                    let elapsed_ns = now.saturating_duration_since(prev_time).as_nanos() as f64;
                    if elapsed_ns <= 0.0 {
                        0
                    } else {
                        let delta_ns = usage_ns.saturating_sub(prev_usage) as f64;
                        let capacity_ns = elapsed_ns * quota_cores;
                        ((delta_ns / capacity_ns) * 1000.0).round() as i64
                    }
                }
                None => 0,
            };
            self.prev = Some((now, usage_ns));
            Some(permille.clamp(0, 1000))
        }

        fn sample_proc_stat(&mut self) -> i64 {
            let Some((busy, total)) = read_proc_stat_totals() else {
                return 0;
            };
            let permille = match self.prev_global {
                Some((prev_busy, prev_total)) => {
                    let d_busy = busy.saturating_sub(prev_busy) as f64;
                    let d_total = total.saturating_sub(prev_total) as f64;
                    if d_total <= 0.0 {
                        0
                    } else {
                        ((d_busy / d_total) * 1000.0).round() as i64
                    }
                }
                None => 0,
            };
            self.prev_global = Some((busy, total));
            permille.clamp(0, 1000)
        }
    }

    /// Returns (quota in cores, path to the usage accounting file) if
    /// a cgroup quota is discoverable.
    fn discover_cgroup() -> (Option<f64>, Option<&'static str>) {
        if let Some(quota) = read_cgroup_v2_quota() {
            return (Some(quota), Some("/sys/fs/cgroup/cpu.stat"));
        }
        if let Some(quota) = read_cgroup_v1_quota() {
            return (Some(quota), Some("/sys/fs/cgroup/cpuacct/cpuacct.usage"));
        }
        (None, None)
    }

    fn read_cgroup_v2_quota() -> Option<f64> {
        let content = fs::read_to_string("/sys/fs/cgroup/cpu.max").ok()?;
        let mut parts = content.split_whitespace();
        let quota = parts.next()?;
        if quota == "max" {
            return None;
        }
        let period: f64 = parts.next()?.parse().ok()?;
        let quota: f64 = quota.parse().ok()?;
        if period <= 0.0 {
            return None;
        }
        Some(quota / period)
    }

    fn read_cgroup_v1_quota() -> Option<f64> {
        let quota: f64 = fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_quota_us")
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if quota <= 0.0 {
            return None;
        }
        let period: f64 = fs::read_to_string("/sys/fs/cgroup/cpu/cpu.cfs_period_us")
            .ok()?
            .trim()
            .parse()
            .ok()?;
        if period <= 0.0 {
            return None;
        }
        Some(quota / period)
    }

    fn read_cgroup_usage_ns(path: &str) -> Option<u64> {
        let content = fs::read_to_string(path).ok()?;
        if path.ends_with("cpu.stat") {
            for line in content.lines() {
                if let Some(usec) = line.strip_prefix("usage_usec ") {
                    return usec.trim().parse::<u64>().ok().map(|v| v * 1000);
                }
            }
            None
        } else {
            content.trim().parse().ok()
        }
    }

    /// Sum of the aggregate `cpu` line in `/proc/stat`: returns
    /// `(busy_jiffies, total_jiffies)`.
    fn read_proc_stat_totals() -> Option<(u64, u64)> {
        let content = fs::read_to_string("/proc/stat").ok()?;
        let line = content.lines().next()?;
        if !line.starts_with("cpu ") {
            return None;
        }
        let fields: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .filter_map(|f| f.parse().ok())
            .collect();
        if fields.len() < 4 {
            return None;
        }
        let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
        let total: u64 = fields.iter().sum();
        let busy = total.saturating_sub(idle);
        Some((busy, total))
    }
}

#[cfg(not(target_os = "linux"))]
mod other {
    use sysinfo::System;

    pub struct OtherReader {
        system: System,
    }

    impl OtherReader {
        pub fn new() -> Self {
            let mut system = System::new_all();
            system.refresh_cpu();
            Self { system }
        }

        pub fn sample_permille(&mut self) -> i64 {
            self.system.refresh_cpu();
            let usage = self.system.global_cpu_info().cpu_usage();
            (usage as f64 * 10.0).round().clamp(0.0, 1000.0) as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ewma_decays_toward_raw_sample() {
        let s = Sampler::new();
        s.update(1000);
        let after_one = s.read();
        assert!(after_one > 0 && after_one <= 50);
        for _ in 0..200 {
            s.update(1000);
        }
        assert_eq!(s.read(), 1000);
    }

    #[test]
    fn raw_sample_is_clamped_to_1000() {
        let s = Sampler::new();
        s.update(5000);
        assert!(s.read() <= 1000);
    }

    #[test]
    fn global_sampler_starts_and_reads_without_panicking() {
        start_global_sampler();
        let v = global_cpu_permille();
        assert!((0..=1000).contains(&v));
    }
}
