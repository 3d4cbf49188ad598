//! Retry orchestration around handler calls
//!
//! The policy is classifier-driven: transient failures back off and retry,
//! user errors fail immediately, unknown errors get one more chance. The
//! orchestrator owns nothing but the policy; attempt counts live on the
//! node and are threaded through by the executor.

use crate::config::env_parse;
use crate::error::{BuildResult, ErrorClass};
use rand::Rng;
use std::time::Duration;
use tracing::debug;

/// Backoff and attempt budget for handler retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempt budget for transient failures
    pub max_attempts: u32,
    /// First backoff delay
    pub base_delay: Duration,
    /// Multiplier applied per attempt
    pub backoff_factor: f64,
    /// Ceiling on any single delay
    pub max_delay: Duration,
    /// Fraction of jitter applied around each delay
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Defaults overridden by `BUILDER_RETRY_MAX_ATTEMPTS` and
    /// `BUILDER_RETRY_BASE_DELAY_MS`
    pub fn from_environment() -> Self {
        let mut policy = Self::default();
        if let Some(attempts) = env_parse::<u32>("BUILDER_RETRY_MAX_ATTEMPTS") {
            policy.max_attempts = attempts.max(1);
        }
        if let Some(ms) = env_parse::<u64>("BUILDER_RETRY_BASE_DELAY_MS") {
            policy.base_delay = Duration::from_millis(ms);
        }
        policy
    }

    /// Attempt budget for one error class
    pub fn attempts_for(&self, class: ErrorClass) -> u32 {
        match class {
            ErrorClass::Transient => self.max_attempts,
            ErrorClass::User => 1,
            ErrorClass::Unknown => 2,
        }
    }

    /// Backoff before the next try, after `attempt` failures
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(exponent);
        let capped = raw.min(self.max_delay.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
            capped * (1.0 + spread)
        } else {
            capped
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }
}

/// Wraps a handler call with the retry policy
#[derive(Debug, Clone, Default)]
pub struct RetryOrchestrator {
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    /// Create an orchestrator with the given policy
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in effect
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` under the policy
    ///
    /// `attempts` is incremented per invocation and reset to zero on
    /// success, matching the per-node counter semantics.
    pub fn execute<T, F>(&self, attempts: &mut u32, mut op: F) -> BuildResult<T>
    where
        F: FnMut() -> BuildResult<T>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            *attempts += 1;
            match op() {
                Ok(value) => {
                    *attempts = 0;
                    return Ok(value);
                }
                Err(error) => {
                    let budget = self.policy.attempts_for(error.classify());
                    if attempt >= budget {
                        return Err(error);
                    }
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        attempt,
                        budget,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }
}
