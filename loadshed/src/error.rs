//! Common contracts shared by the breaker and the limiter: the
//! `Allow`/`done` admission protocol and the two sentinel error kinds.

use thiserror::Error;

/// Errors raised by the admission-control primitives in this crate.
///
/// Both variants are unit variants so callers can match on kind with
/// `matches!(err, LoadShedError::NotAllowed)` instead of relying on
/// pointer identity the way the reference implementation's sentinel
/// `error.New(...)` values are compared.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadShedError {
    /// Raised by [`crate::limiter::Limiter::allow`] when the estimated
    /// in-flight concurrency exceeds capacity, or CPU pressure persists
    /// through a cold period.
    #[error("concurrency limit exceeded")]
    LimitExceeded,

    /// Raised by [`crate::breaker::Breaker::allow`] when the request is
    /// probabilistically rejected due to the observed failure rate.
    #[error("request not allowed by circuit breaker")]
    NotAllowed,
}

/// Outcome reported back to a breaker/limiter when a unit of work
/// finishes, mirroring the reference implementation's `DoneInfo`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DoneInfo {
    /// `true` if the admitted request ultimately failed. The limiter
    /// only credits `passStat` on success; the breaker instead expects
    /// the caller to invoke [`crate::breaker::Breaker::mark_success`] /
    /// [`crate::breaker::Breaker::mark_failed`] directly, since its
    /// window tracks a success ratio rather than a pass count.
    pub failed: bool,
}

/// Callback returned by a successful [`RateLimiter::allow`] call.
///
/// MUST be invoked exactly once per admitted request: skipping it
/// leaks the limiter's in-flight counter and causes progressive
/// under-admission, since `maxInFlight` is derived from the same
/// window the leaked slot never released capacity back into.
pub type DoneFunc = Box<dyn FnOnce(DoneInfo) + Send>;

/// Capability implemented by the adaptive limiter (C4).
///
/// A breaker additionally exposes `mark_success`/`mark_failed` instead
/// of folding outcome recording into `done`, because its admission
/// decision is a function of a success ratio, not of concurrency.
pub trait RateLimiter {
    /// Attempt to admit one unit of work. On success, returns a
    /// [`DoneFunc`] that the caller must invoke exactly once when the
    /// work completes. On rejection, returns
    /// [`LoadShedError::LimitExceeded`].
    fn allow(&self) -> Result<DoneFunc, LoadShedError>;
}
