//! Retry/backoff controller: a pure decision over one attempt's outcome.

use std::time::Duration;

use crate::core::types::StepSpec;

/// Knobs that drive the local retry decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum local executions of a transient step per repair round.
    pub max_attempts: u32,
    /// Base of the exponential backoff, in seconds.
    pub base_backoff_secs: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_secs: 2.0,
        }
    }
}

/// What the driver does after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Exit code 0: the step is done.
    Succeed,
    /// Sleep for `delay`, then run again as `next_attempt`.
    Retry { next_attempt: u32, delay: Duration },
    /// Hand the failure to the repair path.
    Escalate,
}

/// Decide the next move for `step` after attempt `attempt` exited with `exit_code`.
///
/// Only transient steps retry locally, and only while `attempt < max_attempts`.
/// The delay is `base_backoff ^ attempt` seconds, without jitter or cap.
pub fn decide(step: &StepSpec, attempt: u32, exit_code: i32, policy: &RetryPolicy) -> Decision {
    if exit_code == 0 {
        return Decision::Succeed;
    }
    if step.transient && attempt < policy.max_attempts {
        return Decision::Retry {
            next_attempt: attempt + 1,
            delay: backoff_delay(policy.base_backoff_secs, attempt),
        };
    }
    Decision::Escalate
}

/// `base ^ attempt` seconds. Saturates at `Duration::MAX` instead of panicking.
pub fn backoff_delay(base_secs: f64, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = base_secs.powi(exponent);
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}
