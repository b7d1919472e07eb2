//! Bounded retry with backoff, for callers polling `Engine::resume`.
//!
//! The engine never retries internally; a caller that wants to wait for
//! space to come back wraps `resume` in a [`RetryPolicy`]:
//!
//! ```no_run
//! # use kelp_lsm::{Engine, EngineConfig, retry::RetryPolicy};
//! # use std::time::Duration;
//! # fn demo(engine: &Engine) -> kelp_lsm::Result<()> {
//! let policy = RetryPolicy::exponential(5, Duration::from_millis(100)).with_jitter(0.2);
//! policy.run(|| engine.resume(), |e| e.is_recoverable())?;
//! # Ok(())
//! # }
//! ```

use rand::{thread_rng, Rng};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryStrategy {
    Linear,
    Exponential,
}

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Option<Duration>,
    jitter_fraction: f64,
    time_budget: Option<Duration>,
}

impl RetryPolicy {
    pub fn linear(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Linear, max_attempts, base_delay)
    }

    pub fn exponential(max_attempts: usize, base_delay: Duration) -> Self {
        Self::new(RetryStrategy::Exponential, max_attempts, base_delay)
    }

    fn new(strategy: RetryStrategy, max_attempts: usize, base_delay: Duration) -> Self {
        Self {
            strategy,
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: None,
            jitter_fraction: 0.0,
            time_budget: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = if max_delay.is_zero() {
            None
        } else {
            Some(max_delay)
        };
        self
    }

    /// Scales each delay by a random factor in `[1 - fraction, 1 + fraction]`.
    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    /// Stops retrying once `budget` has elapsed since the first attempt.
    pub fn with_time_budget(mut self, budget: Option<Duration>) -> Self {
        self.time_budget = budget.filter(|d| !d.is_zero());
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn handle(&self) -> RetryHandle {
        let deadline = self
            .time_budget
            .and_then(|budget| Instant::now().checked_add(budget));
        RetryHandle {
            policy: self.clone(),
            attempts: 0,
            deadline,
        }
    }

    /// Calls `op` until it succeeds, `retryable` rejects its error, or the
    /// policy runs out of attempts. Sleeps between attempts on the calling
    /// thread. Returns the last error on give-up.
    pub fn run<T, E, F, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut handle = self.handle();
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if !retryable(&e) => return Err(e),
                Err(e) => match handle.next_delay() {
                    Some(delay) => {
                        tracing::debug!(
                            "Attempt {} failed ({}), retrying in {:?}",
                            handle.attempts(),
                            e,
                            delay
                        );
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                    None => {
                        tracing::warn!(
                            "Giving up after {} attempts: {}",
                            handle.attempts() + 1,
                            e
                        );
                        return Err(e);
                    }
                },
            }
        }
    }

    fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let raw = match self.strategy {
            RetryStrategy::Linear => self.base_delay.saturating_mul(attempt as u32),
            RetryStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(31) as u32;
                self.base_delay.saturating_mul(1u32 << shift)
            }
        };
        let bounded = match self.max_delay {
            Some(max) => raw.min(max),
            None => raw,
        };
        if bounded.is_zero() || self.jitter_fraction <= 0.0 {
            return bounded;
        }
        let jitter = self.jitter_fraction;
        let factor = thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        bounded.mul_f64(factor)
    }
}

/// Attempt counter for one retry sequence.
pub struct RetryHandle {
    policy: RetryPolicy,
    attempts: usize,
    deadline: Option<Instant>,
}

impl RetryHandle {
    /// Delay before the next attempt, or `None` when the sequence is over.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts + 1 >= self.policy.max_attempts {
            return None;
        }
        let next = self.attempts + 1;
        let delay = self.policy.delay_for_attempt(next);
        if let Some(deadline) = self.deadline {
            let now = Instant::now();
            match now.checked_add(delay) {
                Some(at) if at <= deadline => {}
                _ => return None,
            }
        }
        self.attempts = next;
        Some(delay)
    }

    /// Retries handed out so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_exponential_delays() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(10));
        let mut handle = policy.handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(handle.next_delay(), None);
        assert_eq!(handle.attempts(), 3);
    }

    #[test]
    fn test_linear_capped() {
        let policy = RetryPolicy::linear(10, Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(25));
        let mut handle = policy.handle();
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(handle.next_delay(), Some(Duration::from_millis(25)));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::linear(50, Duration::from_millis(100)).with_jitter(0.5);
        let mut handle = policy.handle();
        for attempt in 1..50u64 {
            let d = handle.next_delay().unwrap();
            let base = 100 * attempt;
            assert!(d + Duration::from_millis(1) >= Duration::from_millis(base / 2));
            assert!(d <= Duration::from_millis(base * 3 / 2 + 1));
        }
    }

    #[test]
    fn test_time_budget_stops_early() {
        let policy = RetryPolicy::linear(100, Duration::from_secs(10))
            .with_time_budget(Some(Duration::from_secs(15)));
        let mut handle = policy.handle();
        assert!(handle.next_delay().is_some());
        assert!(handle.next_delay().is_none());
    }

    #[test]
    fn test_run_bounded() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::exponential(3, Duration::ZERO);
        let result: Result<(), String> = policy.run(
            || {
                calls.set(calls.get() + 1);
                Err("still full".to_string())
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_run_stops_on_fatal_and_success() {
        let calls = Cell::new(0);
        let policy = RetryPolicy::linear(5, Duration::ZERO);
        let result: Result<(), &str> = policy.run(
            || {
                calls.set(calls.get() + 1);
                Err("fatal")
            },
            |e| *e != "fatal",
        );
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.get(), 1);

        calls.set(0);
        let result: Result<u32, &str> = policy.run(
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("busy")
                } else {
                    Ok(7)
                }
            },
            |_| true,
        );
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }
}
