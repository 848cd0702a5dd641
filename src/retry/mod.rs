//! Retry decision logic for failed story attempts.
//!
//! The policy is a pure function from `(attempts, configuration)` to the
//! next action; execution (delays, notifications, requeueing) lives with
//! the caller. Failed attempts wait `attempts` minutes, then a single
//! final attempt after an extended wait, then the story is dropped.

use std::time::Duration;

use crate::config::RetryConfig;

/// Minutes of delay added per failed attempt.
const BASE_DELAY_MINUTES: u64 = 1;

/// Next action for a story whose attempt just failed.
///
/// `attempts` is read post-increment: the first failure consults the
/// policy with `attempts == 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after the given delay. Silent.
    RequeueAfter(Duration),
    /// Normal retries are exhausted: announce it, then make one last
    /// attempt after the extended wait. The caller promotes the story to
    /// a force update unless the configured update method forbids it.
    FinalAttemptAfter(Duration),
    /// Nothing left to try.
    GiveUp,
}

impl RetryDecision {
    pub fn is_give_up(&self) -> bool {
        matches!(self, RetryDecision::GiveUp)
    }
}

/// Decides what happens to a story after a failed attempt.
pub fn decide(attempts: u32, config: &RetryConfig) -> RetryDecision {
    if attempts < config.max_normal_retries {
        let minutes = u64::from(attempts) * BASE_DELAY_MINUTES;
        RetryDecision::RequeueAfter(Duration::from_secs(minutes * 60))
    } else if attempts == config.max_normal_retries && config.final_attempt_enabled {
        RetryDecision::FinalAttemptAfter(config.final_attempt_wait())
    } else {
        RetryDecision::GiveUp
    }
}
