//! Retry delays: base, doubling per attempt, capped

use std::time::Duration;

use crate::engine::config::BackoffConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::from(&BackoffConfig::default())
    }
}

impl From<&BackoffConfig> for BackoffPolicy {
    fn from(config: &BackoffConfig) -> Self {
        Self {
            base: config.base_delay(),
            max: config.max_delay(),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before the retry following `attempt` (zero-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doubles_then_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(10), Duration::from_secs(300));
        assert_eq!(policy.delay(0), Duration::from_secs(10));
        assert_eq!(policy.delay(1), Duration::from_secs(20));
        assert_eq!(policy.delay(4), Duration::from_secs(160));
        assert_eq!(policy.delay(5), Duration::from_secs(300));
        assert_eq!(policy.delay(64), Duration::from_secs(300));
    }

    #[test]
    fn test_from_config() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.base, Duration::from_secs(10));
        assert_eq!(policy.max, Duration::from_secs(300));
    }
}
