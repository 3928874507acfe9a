//! Backoff schedules for repeated recovery attempts

use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder};
use serde::{Deserialize, Serialize};

/// How the delay between attempts grows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Base delay doubled per attempt, capped at the max delay
    #[default]
    Exponential,
    /// Base delay plus a fixed increment per attempt, capped at the max delay
    Linear,
    /// Base delay every time
    Fixed,
}

/// Concrete delay policy for one playbook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Growth strategy
    pub strategy: BackoffStrategy,
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Ceiling for exponential and linear growth
    pub max_delay: Duration,
    /// Per-attempt increment for linear growth
    pub increment: Duration,
}

impl BackoffPolicy {
    /// Delays slept before attempts 2, 3, 4, ... in order
    pub fn delays(&self) -> Box<dyn Iterator<Item = Duration> + Send> {
        match self.strategy {
            BackoffStrategy::Exponential => Box::new(
                ExponentialBuilder::default()
                    .with_min_delay(self.base_delay)
                    .with_max_delay(self.max_delay.max(self.base_delay))
                    .with_factor(2.0)
                    .without_max_times()
                    .build(),
            ),
            BackoffStrategy::Fixed => Box::new(
                ConstantBuilder::default()
                    .with_delay(self.base_delay)
                    .without_max_times()
                    .build(),
            ),
            BackoffStrategy::Linear => {
                let (base, step, cap) = (self.base_delay, self.increment, self.max_delay);
                Box::new((0u32..).map(move |n| {
                    base.saturating_add(step.saturating_mul(n))
                        .min(cap.max(base))
                }))
            }
        }
    }

    /// Delay to sleep before `attempt` (1-based). The first attempt never waits.
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.delays()
            .nth((attempt - 2) as usize)
            .unwrap_or(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: BackoffStrategy) -> BackoffPolicy {
        BackoffPolicy {
            strategy,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            increment: Duration::from_secs(45),
        }
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let p = policy(BackoffStrategy::Exponential);
        assert_eq!(p.delay_before(1), Duration::ZERO);
        assert_eq!(p.delay_before(2), Duration::from_secs(30));
        assert_eq!(p.delay_before(3), Duration::from_secs(60));
        assert_eq!(p.delay_before(4), Duration::from_secs(120));
        assert_eq!(p.delay_before(5), Duration::from_secs(240));
        assert_eq!(p.delay_before(6), Duration::from_secs(300));
        assert_eq!(p.delay_before(10), Duration::from_secs(300));
    }

    #[test]
    fn linear_adds_increment_and_caps() {
        let p = policy(BackoffStrategy::Linear);
        let delays: Vec<u64> = p.delays().take(8).map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![30, 75, 120, 165, 210, 255, 300, 300]);
    }

    #[test]
    fn fixed_ignores_attempt_number() {
        let p = policy(BackoffStrategy::Fixed);
        for attempt in 2..8 {
            assert_eq!(p.delay_before(attempt), Duration::from_secs(30));
        }
    }

    #[test]
    fn strategy_deserializes_lowercase() {
        let s: BackoffStrategy = serde_yaml::from_str("linear").unwrap();
        assert_eq!(s, BackoffStrategy::Linear);
        assert!(serde_yaml::from_str::<BackoffStrategy>("jittered").is_err());
    }
}
