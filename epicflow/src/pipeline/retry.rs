//! Retry budgets for stages that may rerun a tool.
//!
//! Retries are immediate, without backoff. Budgets count total attempts,
//! the first one included.

use crate::inspect;
use serde::Serialize;

/// What makes an attempt eligible for a rerun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "marker")]
pub enum RetryTrigger {
    /// The attempt's log contains this marker.
    LogMarker(&'static str),
    /// The attempt's expected artifact is absent.
    MissingArtifact,
    /// Never rerun.
    Never,
}

/// A declared retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Condition that asks for another attempt.
    pub trigger: RetryTrigger,
}

impl RetryPolicy {
    /// Creates a policy.
    #[must_use]
    pub fn new(max_attempts: usize, trigger: RetryTrigger) -> Self {
        Self {
            max_attempts,
            trigger,
        }
    }

    /// A single attempt, never rerun.
    #[must_use]
    pub fn none() -> Self {
        Self::new(1, RetryTrigger::Never)
    }

    /// Evaluates the trigger against what an attempt left behind.
    #[must_use]
    pub fn is_triggered(&self, log: &str, artifact_present: bool) -> bool {
        match self.trigger {
            RetryTrigger::LogMarker(marker) => inspect::has_marker(log, marker),
            RetryTrigger::MissingArtifact => !artifact_present,
            RetryTrigger::Never => false,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

/// Attempts made so far for one retried unit of work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    attempts: usize,
}

impl RetryState {
    /// Creates a state with no attempts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the start of an attempt and returns its 1-based number.
    pub fn begin_attempt(&mut self) -> usize {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts started so far.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Reruns consumed (attempts beyond the first).
    #[must_use]
    pub fn retries(&self) -> usize {
        self.attempts.saturating_sub(1)
    }

    /// Returns true once the policy allows no further attempt.
    #[must_use]
    pub fn is_exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempts >= policy.max_attempts
    }
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run another attempt.
    Retry,
    /// The trigger fired but the budget is spent.
    GiveUp,
    /// The trigger did not fire; the attempt stands.
    NotRetryable,
}

/// Decides whether the attempt just finished should be followed by another.
#[must_use]
pub fn should_retry(state: &RetryState, policy: &RetryPolicy, triggered: bool) -> RetryDecision {
    if !triggered {
        return RetryDecision::NotRetryable;
    }
    if state.is_exhausted(policy) {
        return RetryDecision::GiveUp;
    }
    RetryDecision::Retry
}
