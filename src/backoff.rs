use std::time::Duration;

use crate::config::RetryPolicy;

/// Consecutive-failure counter driving the reconnect delay.
///
/// `delay = min(min_ms * 2^attempts, max_ms)`. The counter saturates, so
/// it stays bounded however long a subscription keeps failing.
#[derive(Debug, Clone)]
pub struct RetryState {
    attempts: u32,
    policy: RetryPolicy,
}

impl RetryState {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            attempts: 0,
            policy: policy.normalized(),
        }
    }

    /// Failures since the last received event.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Delay for the next reconnect, without recording a failure.
    pub fn current_delay(&self) -> Duration {
        let max = self.policy.max_ms;
        let exp = 2u64
            .checked_pow(self.attempts)
            .and_then(|pow| self.policy.min_ms.checked_mul(pow))
            .unwrap_or(max);
        Duration::from_millis(exp.min(max))
    }

    /// Record a connection failure and return how long to wait.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_delay();
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Clear the counter after an event arrives. Returns whether there were
    /// failures to clear.
    pub fn reset(&mut self) -> bool {
        let had_failures = self.attempts > 0;
        self.attempts = 0;
        had_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(delays: &[Duration]) -> Vec<u64> {
        delays.iter().map(|d| d.as_millis() as u64).collect()
    }

    #[test]
    fn doubles_until_capped() {
        let mut state = RetryState::new(RetryPolicy::new(100, 1_000));
        let delays: Vec<_> = (0..7).map(|_| state.next_delay()).collect();

        assert_eq!(millis(&delays), vec![100, 200, 400, 800, 1_000, 1_000, 1_000]);
        assert_eq!(state.attempts(), 7);
    }

    #[test]
    fn reset_restarts_from_minimum() {
        let mut state = RetryState::new(RetryPolicy::new(100, 1_000));
        state.next_delay();
        state.next_delay();
        state.next_delay();

        assert!(state.reset());
        assert!(!state.reset());
        assert_eq!(state.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn huge_attempt_counts_stay_capped() {
        let mut state = RetryState::new(RetryPolicy::new(250, 30_000));
        state.attempts = u32::MAX - 1;

        assert_eq!(state.next_delay(), Duration::from_millis(30_000));
        assert_eq!(state.next_delay(), Duration::from_millis(30_000));
        assert_eq!(state.attempts(), u32::MAX);
    }

    #[test]
    fn inverted_bounds_are_normalized() {
        let mut state = RetryState::new(RetryPolicy { min_ms: 500, max_ms: 10 });
        assert_eq!(state.next_delay(), Duration::from_millis(500));
        assert_eq!(state.next_delay(), Duration::from_millis(500));
    }
}
