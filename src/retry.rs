//! Retry policy: eligibility, backoff delays, contention jitter.
//!
//! Each task kind carries its own policy. The defaults deliberately give
//! cheap, latency-sensitive work a tighter budget than scraping: a stuck
//! interactive task should give up sooner, a remote site deserves a
//! longer breath between knocks.

use std::collections::HashMap;
use std::time::Duration;

use rand::Rng;

use crate::model::{Task, TaskKind};

/// True iff the task has budget for another attempt.
pub fn should_retry(task: &Task) -> bool {
    task.attempt_count < task.max_attempts
}

/// Backoff policy for one task kind.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Backoff multiplier for subsequent retries.
    pub multiplier: f64,
    /// Attempts allowed before the task fails terminally.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            base_delay,
            multiplier,
            max_attempts,
        }
    }

    /// Backoff delay after the given attempt number (1-indexed):
    /// base · multiplier^(attempt − 1). Strictly increasing for any
    /// multiplier > 1.
    pub fn delay(&self, attempt_count: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let delay_secs = base_secs * self.multiplier.powi(attempt_count.saturating_sub(1) as i32);
        Duration::from_secs_f64(delay_secs)
    }
}

/// Per-kind policy table, resolved at dispatch time.
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    policies: HashMap<TaskKind, RetryPolicy>,
}

impl RetryPolicies {
    /// Build a table from per-kind overrides; kinds not named fall back
    /// to the defaults, so the table is always complete.
    pub fn new(overrides: HashMap<TaskKind, RetryPolicy>) -> Self {
        let mut table = Self::default();
        table.policies.extend(overrides);
        table
    }

    pub fn for_kind(&self, kind: TaskKind) -> &RetryPolicy {
        // Constructors guarantee a policy per kind.
        &self.policies[&kind]
    }
}

impl Default for RetryPolicies {
    /// Interactive kinds: 60s base, 3 attempts. Scraping kinds: 120s
    /// base, 2 attempts. Tunable via configuration.
    fn default() -> Self {
        let interactive = RetryPolicy::new(Duration::from_secs(60), 2.0, 3);
        let scraping = RetryPolicy::new(Duration::from_secs(120), 2.0, 2);

        let mut policies = HashMap::new();
        for kind in TaskKind::ALL {
            let policy = match kind {
                TaskKind::Scrape | TaskKind::Extract => scraping.clone(),
                _ => interactive.clone(),
            };
            policies.insert(kind, policy);
        }
        Self { policies }
    }
}

/// Small randomized pause before retrying a lost store-level race
/// (StaleStatus). Contention reflects a sibling worker, not an external
/// fault, so there is no backoff — just enough spread to avoid
/// re-colliding in lockstep.
pub fn contention_jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(5..50))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_strictly_increasing() {
        let policy = RetryPolicy::new(Duration::from_secs(60), 2.0, 3);

        let d1 = policy.delay(1);
        let d2 = policy.delay(2);
        let d3 = policy.delay(3);

        assert!(d2 > d1);
        assert!(d3 > d2);
        assert_eq!(d1, Duration::from_secs(60));
        assert_eq!(d2, Duration::from_secs(120));
        assert_eq!(d3, Duration::from_secs(240));
    }

    #[test]
    fn defaults_keep_the_kind_asymmetry() {
        let policies = RetryPolicies::default();

        let scrape = policies.for_kind(TaskKind::Scrape);
        assert_eq!(scrape.base_delay, Duration::from_secs(120));
        assert_eq!(scrape.max_attempts, 2);

        let respond = policies.for_kind(TaskKind::GenerateResponse);
        assert_eq!(respond.base_delay, Duration::from_secs(60));
        assert_eq!(respond.max_attempts, 3);
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..100 {
            let j = contention_jitter();
            assert!(j >= Duration::from_millis(5));
            assert!(j < Duration::from_millis(50));
        }
    }
}
