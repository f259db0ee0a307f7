//! Capped linear backoff for the handler's dial loop.

use std::time::Duration;

/// Growth per failed attempt, multiplied by the attempt count.
const STEP: Duration = Duration::from_millis(500);

/// Failures after which the delay stops growing.
const MAX_GROWTH_ATTEMPTS: u32 = 5;

/// Delay grows by `STEP * attempts` on every failure until it reaches its
/// ceiling (5s after five failures), then stays there.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    attempts: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self) {
        if self.attempts < MAX_GROWTH_ATTEMPTS {
            self.delay += STEP * self.attempts;
            self.attempts += 1;
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.delay = Duration::ZERO;
    }

    /// Whether the next attempt has to wait.
    pub fn is_retrying(&self) -> bool {
        self.attempts > 0
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let mut backoff = Backoff::new();
        assert!(!backoff.is_retrying());

        let mut delays = Vec::new();
        for _ in 0..8 {
            backoff.record_failure();
            delays.push(backoff.delay().as_millis());
        }
        assert_eq!(delays, vec![0, 500, 1500, 3000, 5000, 5000, 5000, 5000]);
        assert!(backoff.is_retrying());
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::new();
        backoff.record_failure();
        backoff.record_failure();
        backoff.reset();
        assert!(!backoff.is_retrying());
        assert_eq!(backoff.delay(), Duration::ZERO);
    }
}
