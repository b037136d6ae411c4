//! Reconnect backoff policy
//!
//! Capped exponential delay between store connection attempts. Attempts are
//! unbounded: the agent never stops trying to reach its store.

use std::time::Duration;

use tracing::{error, info, warn, Level};

/// Attempts logged at info before escalating.
const INFO_ATTEMPTS: u32 = 3;
/// Attempts logged at warn before escalating to error.
const WARN_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub min: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Growth factor between consecutive attempts.
    pub multiplier: f64,
    /// Add up to 25% random jitter. Delays are no longer monotonic when set.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_secs(2),
            max: Duration::from_secs(120),
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.min.as_secs_f64() * self.multiplier.max(1.0).powi(exp);
        let capped = base.min(self.max.as_secs_f64());
        let delay = Duration::from_secs_f64(capped);

        if self.jitter {
            let factor = 1.0 + jitter_fraction() * 0.25;
            Duration::from_secs_f64(capped * factor).min(self.max)
        } else {
            delay
        }
    }
}

/// Severity for the log line announcing retry number `attempt`.
pub fn retry_level(attempt: u32) -> Level {
    if attempt <= INFO_ATTEMPTS {
        Level::INFO
    } else if attempt <= WARN_ATTEMPTS {
        Level::WARN
    } else {
        Level::ERROR
    }
}

/// Log a scheduled retry, escalating severity with the attempt count.
pub fn log_retry(attempt: u32, delay: Duration, reason: &str) {
    let delay_ms = delay.as_millis() as u64;
    match retry_level(attempt) {
        Level::INFO => info!(attempt, delay_ms, reason, "store: will retry connection"),
        Level::WARN => {
            warn!(attempt, delay_ms, reason, "store: still unable to connect; will retry")
        }
        _ => error!(attempt, delay_ms, reason, "store: unreachable; will keep retrying"),
    }
}

// 0.0..1.0 from the clock's sub-second nanos; good enough to spread a fleet
fn jitter_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_bounds() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(120));
        assert_eq!(policy.delay_for_attempt(1_000), Duration::from_secs(120));
    }

    #[test]
    fn test_delays_non_decreasing_up_to_cap() {
        let policy = BackoffPolicy {
            min: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 1.5,
            jitter: false,
        };
        let delays: Vec<_> = (1..50).map(|n| policy.delay_for_attempt(n)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_fixed_delay_with_unit_multiplier() {
        let policy = BackoffPolicy {
            min: Duration::from_secs(5),
            max: Duration::from_secs(60),
            multiplier: 1.0,
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(5));
    }

    #[test]
    fn test_retry_level_escalates() {
        assert_eq!(retry_level(1), Level::INFO);
        assert_eq!(retry_level(3), Level::INFO);
        assert_eq!(retry_level(4), Level::WARN);
        assert_eq!(retry_level(10), Level::WARN);
        assert_eq!(retry_level(11), Level::ERROR);
        assert_eq!(retry_level(u32::MAX), Level::ERROR);
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let policy = BackoffPolicy {
            jitter: true,
            ..BackoffPolicy::default()
        };
        for attempt in 1..20 {
            let delay = policy.delay_for_attempt(attempt);
            assert!(delay >= policy.min);
            assert!(delay <= policy.max);
        }
    }
}
