//! Bounded client-side retry schedule.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: u32,
    /// Total time after which retrying stops. Clients tie this to the
    /// broker's session lifetime.
    pub ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2,
            ceiling: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn start(&self) -> Backoff {
        Backoff::new(self.clone(), Instant::now())
    }
}

/// Exponential backoff iterator with an elapsed-time ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    started: Instant,
    next: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy, started: Instant) -> Self {
        let next = policy.initial_delay;
        Self {
            policy,
            started,
            next,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay before the next attempt, or `None` once the ceiling would be
    /// crossed.
    pub fn next_delay(&mut self, now: Instant) -> Option<Duration> {
        let elapsed = now.saturating_duration_since(self.started);
        let remaining = self.policy.ceiling.checked_sub(elapsed)?;
        if remaining.is_zero() {
            return None;
        }

        let delay = self.next.min(remaining);
        self.next = self
            .next
            .saturating_mul(self.policy.multiplier.max(1))
            .min(self.policy.max_delay);
        self.attempts += 1;
        Some(delay)
    }

    /// Whether an immediate re-issue (no delay) is still within the ceiling.
    pub fn within_ceiling(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.started) < self.policy.ceiling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(800),
            multiplier: 2,
            ceiling: Duration::from_secs(5),
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn delays_grow_then_cap() {
        let start = Instant::now();
        let mut backoff = Backoff::new(policy(), start);
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_delay(start).unwrap().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800, 800]);
        assert_eq!(backoff.attempts(), 6);
    }

    #[test_timeout::tokio_timeout_test]
    async fn stops_at_the_ceiling() {
        let start = Instant::now();
        let mut backoff = Backoff::new(policy(), start);

        let near_end = start + Duration::from_millis(4_950);
        assert_eq!(backoff.next_delay(near_end), Some(Duration::from_millis(50)));
        assert!(backoff.within_ceiling(near_end));

        let past_end = start + Duration::from_secs(5);
        assert_eq!(backoff.next_delay(past_end), None);
        assert!(!backoff.within_ceiling(past_end));
    }
}
