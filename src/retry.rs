//! Retry policy for failed refreshes
//!
//! Pure decision logic: given a message whose refresh just failed, either
//! requeue it with `retryCount + 1` after an exponential delay, or
//! dead-letter it once the retry budget is spent. The consumer loop performs
//! the actual queue mutation.

use crate::message::RefreshMessage;

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default number of retries before dead-lettering
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default exponential backoff base, in seconds
pub const DEFAULT_BACKOFF_BASE: u64 = 2;

/// What to do with a message after a failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Push `message` back to the main queue after `delay`
    Requeue {
        message: RefreshMessage,
        delay: Duration,
    },
    /// Push the message to the dead-letter queue; nothing further
    DeadLetter(RefreshMessage),
}

/// Retry ceiling and backoff law
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base: DEFAULT_BACKOFF_BASE,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: u64) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    /// Delay before pushing a message whose pre-increment retry count is `k`
    pub fn backoff_for(&self, k: u32) -> Duration {
        Duration::from_secs(self.backoff_base.saturating_pow(k))
    }

    /// Decide the fate of a message whose refresh failed at `now`
    pub fn on_failure(&self, message: &RefreshMessage, now: DateTime<Utc>) -> RetryDecision {
        if message.retry_count < self.max_retries {
            RetryDecision::Requeue {
                delay: self.backoff_for(message.retry_count),
                message: message.next_attempt(now),
            }
        } else {
            RetryDecision::DeadLetter(message.clone())
        }
    }
}
