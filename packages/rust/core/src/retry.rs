//! Retry and dead-letter policy.
//!
//! `delay(n) = min(base * multiplier^(n-1), cap)` where `n` is the attempt
//! count after the failure, so the first retry waits `base`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use linkflow_shared::{FailureKind, StagePolicy};

use crate::clock;

/// Why an item is being dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadReason {
    /// The stage's attempt limit was reached.
    AttemptsExhausted { attempts: u32, max: u32 },
    /// The pipeline-wide attempt cap was reached.
    PipelineCapReached { attempts: u32, max: u32 },
    /// The worker reported a permanent failure.
    Permanent,
    /// The worker asked for immediate dead-lettering.
    Requested,
}

impl std::fmt::Display for DeadReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttemptsExhausted { attempts, max } => {
                write!(f, "attempts exhausted ({attempts}/{max})")
            }
            Self::PipelineCapReached { attempts, max } => {
                write!(f, "pipeline attempt cap reached ({attempts}/{max})")
            }
            Self::Permanent => f.write_str("permanent failure"),
            Self::Requested => f.write_str("dead-letter requested by worker"),
        }
    }
}

/// What happens to an item after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait in `error(stage)` until `next_eligible_at`.
    Retry { next_eligible_at: DateTime<Utc> },
    DeadLetter(DeadReason),
}

/// Inputs to [`decide`], with counters already incremented for this failure.
#[derive(Debug, Clone, Copy)]
pub struct FailedAttempt {
    pub kind: FailureKind,
    pub dead_letter: bool,
    pub attempt_count: u32,
    pub total_attempts: u32,
}

/// Backoff before retry number `attempt` (1-based). Non-decreasing in
/// `attempt` and never above the policy's cap.
pub fn backoff_delay(policy: &StagePolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = policy.base_delay.as_secs_f64() * policy.multiplier.powi(exponent);
    let cap = policy.max_delay.as_secs_f64();
    if !secs.is_finite() || secs >= cap {
        policy.max_delay
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Decide between retry and dead-letter for a failed attempt.
pub fn decide(
    policy: &StagePolicy,
    pipeline_max_attempts: Option<u32>,
    failure: FailedAttempt,
    now: DateTime<Utc>,
) -> RetryDecision {
    if failure.dead_letter {
        return RetryDecision::DeadLetter(DeadReason::Requested);
    }
    if failure.kind == FailureKind::Permanent {
        return RetryDecision::DeadLetter(DeadReason::Permanent);
    }
    if failure.attempt_count >= policy.max_attempts {
        return RetryDecision::DeadLetter(DeadReason::AttemptsExhausted {
            attempts: failure.attempt_count,
            max: policy.max_attempts,
        });
    }
    if let Some(max) = pipeline_max_attempts {
        if failure.total_attempts >= max {
            return RetryDecision::DeadLetter(DeadReason::PipelineCapReached {
                attempts: failure.total_attempts,
                max,
            });
        }
    }

    RetryDecision::Retry {
        next_eligible_at: clock::after(now, backoff_delay(policy, failure.attempt_count)),
    }
}
