//! Retry policy for the per-record lookup
//!
//! The policy is a pure table from (outcome, attempt) to an action so it can
//! be tested without a transport. The caller owns the loop and the sleeping.

use crate::config::RetryConfig;
use crate::error::EnrichError;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

/// What one attempt produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The server answered with this HTTP status
    Status(u16),
    /// The request timed out
    Timeout,
    /// Connection refused, DNS failure, TLS error, ...
    Transport(String),
}

/// What to do about it
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// 200: stop retrying and extract
    Accept,
    /// Sleep, then try again
    Backoff(Duration),
    /// Replace the credential unconditionally, then try again
    RefreshAndRetry,
    /// Give up on this record now
    Abandon(String),
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub rate_limit_base_secs: f64,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            backoff_factor: config.backoff_factor,
            rate_limit_base_secs: config.rate_limit_base_secs,
        }
    }
}

impl RetryPolicy {
    /// Transition table. `attempt` is zero-based.
    ///
    /// | outcome        | action                                   |
    /// |----------------|------------------------------------------|
    /// | 200            | accept                                   |
    /// | 429            | backoff `factor^attempt * rate_limit_base` |
    /// | 401            | refresh and retry                        |
    /// | timeout        | backoff `factor^attempt`                 |
    /// | other status   | abandon                                  |
    /// | transport      | abandon                                  |
    pub fn action(&self, outcome: &Outcome, attempt: u32) -> Action {
        match outcome {
            Outcome::Status(200) => Action::Accept,
            Outcome::Status(429) => {
                Action::Backoff(self.wait(attempt, self.rate_limit_base_secs))
            }
            Outcome::Status(401) => Action::RefreshAndRetry,
            Outcome::Status(code) => Action::Abandon(format!("HTTP {}", code)),
            Outcome::Timeout => Action::Backoff(self.wait(attempt, 1.0)),
            Outcome::Transport(reason) => {
                Action::Abandon(EnrichError::Transport(reason.clone()).to_string())
            }
        }
    }

    /// Whether another attempt follows `attempt`; backoff sleeps are skipped after the last.
    pub fn has_next(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    fn wait(&self, attempt: u32, base_secs: f64) -> Duration {
        let secs = self.backoff_factor.powi(attempt as i32) * base_secs;
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Blocking waits on the single processing stream (backoff and pacing)
pub trait Sleeper {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()>;
}

/// Real wall-clock sleeps
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Records requested sleeps without waiting
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.sleeps().iter().sum()
    }
}

impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}

impl<T: Sleeper> Sleeper for &T {
    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> {
        (**self).sleep(duration)
    }
}
