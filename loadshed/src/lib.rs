//! Adaptive load-shedding primitives.
//!
//! Two independent admission controls, both built on the same rolling
//! bucketed counter ([`window::RollingCounter`]):
//!
//! - [`breaker::Breaker`] sheds load probabilistically once the
//!   observed success ratio over a rolling window falls below a
//!   target, with organic half-open recovery as failures age out of
//!   the window.
//! - [`limiter::Limiter`] sheds load once estimated in-flight
//!   concurrency exceeds a BBR-style capacity estimate derived from
//!   the window's observed throughput and latency, gated on CPU
//!   pressure.
//!
//! Neither primitive owns a connection, a transport, or a retry
//! policy — they only answer "admit or reject", and hand back a
//! completion callback the caller is responsible for invoking.

pub mod breaker;
pub mod cpu;
pub mod error;
pub mod limiter;
pub mod window;

pub use breaker::{Breaker, BreakerConfig};
pub use error::{DoneFunc, DoneInfo, LoadShedError, RateLimiter};
pub use limiter::{Limiter, LimiterConfig, LimiterStat};
