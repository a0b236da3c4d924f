use rand::{Rng, rng};

/// Exponential retry delay with a ceiling.
///
/// Attempt `n` (1-based) waits up to `base * 2^(n-1)` milliseconds, capped at
/// `max`. With jitter enabled the delay is drawn from the upper half of that
/// window ("equal jitter"), so retries spread out without ever collapsing to
/// zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 60_000,
            jitter: true,
        }
    }
}

impl Backoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter: true,
        }
    }

    #[must_use]
    pub const fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Upper bound of the delay after `attempt` attempts.
    pub fn ceiling_ms(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1);
        let factor = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    /// Delay for `attempt`, using `sample` in `[0, 1)` as the jitter draw.
    pub fn delay_with_sample(&self, attempt: u32, sample: f64) -> u64 {
        let ceiling = self.ceiling_ms(attempt);
        if !self.jitter {
            return ceiling;
        }
        let half = ceiling / 2;
        let spread = ceiling - half;
        half + (spread as f64 * sample.clamp(0.0, 1.0)) as u64
    }

    /// Delay for `attempt` with a fresh jitter draw.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let sample = if self.jitter { rng().random::<f64>() } else { 0.0 };
        self.delay_with_sample(attempt, sample)
    }
}

/// How many attempts an operation gets and how long it waits between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::default(),
        }
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Returns `true` once `attempt_count` attempts leave no room for another.
    pub const fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}
