//! Stats refresh messages
//!
//! A `RefreshMessage` is the unit of work on the queue: "refresh the stats of
//! this user". Producers push them as JSON objects; the codec turns raw queue
//! payloads into validated messages and back.

mod codec;

pub use codec::{decode, MessageCodec};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A request to refresh one user's statistics
///
/// Serializes to the wire shape. Decoding goes through `decode`, which
/// reports which field is wrong instead of a generic serde error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshMessage {
    /// Target user (always > 0)
    pub user_id: u64,
    /// When the refresh was originally requested; informational only
    pub requested_at: DateTime<Utc>,
    /// Number of prior failed attempts
    pub retry_count: u32,
    /// When the consumer last re-queued this message after a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl RefreshMessage {
    /// Create a fresh message as a producer would
    pub fn new(user_id: u64, requested_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            requested_at,
            retry_count: 0,
            last_attempt_at: None,
        }
    }

    /// Copy of this message for the next attempt
    pub fn next_attempt(&self, attempted_at: DateTime<Utc>) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            last_attempt_at: Some(attempted_at),
            ..self.clone()
        }
    }

    /// Copy with the retry budget restored, used when an operator replays a
    /// dead-lettered message
    pub fn reset_retries(&self) -> Self {
        Self {
            retry_count: 0,
            last_attempt_at: None,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for RefreshMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "user_id={} requested_at={} retry={}",
            self.user_id,
            self.requested_at.to_rfc3339(),
            self.retry_count
        )
    }
}
