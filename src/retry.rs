//! Shared retry loop for collaborator calls that can report a busy resource.
//!
//! Only errors for which [`BuildError::is_retryable`] holds are retried;
//! anything else ends the loop after the attempt that produced it.

use std::sync::Mutex;
use std::time::Duration;

use crate::error::{BuildError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay after every failed attempt.
    Fixed(Duration),
    /// `base × attempt` after the n-th failed attempt.
    Linear(Duration),
}

impl Backoff {
    /// Delay to observe after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Linear(base) => base.saturating_mul(attempt.max(1)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn linear(max_attempts: u32, base: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Linear(base),
        }
    }

    /// A single attempt, no retry.
    pub fn once() -> Self {
        Self::fixed(1, Duration::ZERO)
    }
}

/// Sleeping is behind a trait so retry timing can be observed in tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            std::thread::sleep(duration);
        }
    }
}

/// Records requested sleeps without sleeping.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<Duration> {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(duration);
    }
}

#[derive(Debug)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
    /// Backoff delays observed between attempts, in order.
    pub backoffs: Vec<Duration>,
}

#[derive(Debug)]
pub struct Exhausted {
    pub attempts: u32,
    pub backoffs: Vec<Duration>,
    pub last: BuildError,
}

impl Exhausted {
    /// True when the budget ran out on busy reports rather than a hard error.
    pub fn ran_out_busy(&self) -> bool {
        self.last.is_retryable()
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is reached. `op` receives the 1-based attempt number;
/// `on_retry` is called with the failed attempt, its error and the delay
/// about to be observed.
pub fn retry_with_backoff<T>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut op: impl FnMut(u32) -> Result<T>,
    mut on_retry: impl FnMut(u32, &BuildError, Duration),
) -> std::result::Result<Retried<T>, Exhausted> {
    let max_attempts = policy.max_attempts.max(1);
    let mut backoffs = Vec::new();
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                    backoffs,
                })
            }
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff.delay_after(attempt);
                on_retry(attempt, &err, delay);
                sleeper.sleep(delay);
                backoffs.push(delay);
                attempt += 1;
            }
            Err(last) => {
                return Err(Exhausted {
                    attempts: attempt,
                    backoffs,
                    last,
                })
            }
        }
    }
}
