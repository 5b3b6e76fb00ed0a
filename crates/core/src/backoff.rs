use chrono::Duration;

/// Exponential retry delay: `base * multiplier^(n - 1)`, capped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryBackoff {
    pub base_seconds: u64,
    pub multiplier: u32,
    pub cap_seconds: u64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self { base_seconds: 15 * 60, multiplier: 2, cap_seconds: 4 * 60 * 60 }
    }
}

impl RetryBackoff {
    /// Delay before the retry that follows the `failures`-th failed attempt.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1);
        let factor = u64::from(self.multiplier).checked_pow(exponent).unwrap_or(u64::MAX);
        let seconds = self.base_seconds.saturating_mul(factor).min(self.cap_seconds);
        Duration::seconds(i64::try_from(seconds).unwrap_or(i64::MAX))
    }
}
