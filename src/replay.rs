//! Move dead-lettered messages back onto the main queue
//!
//! Each replayed message gets a fresh retry budget. Entries that no longer
//! decode are rotated back onto the failed list so nothing is lost.

use crate::error::Result;
use crate::message::MessageCodec;
use crate::queue::{QueueNames, QueueTransport};

use std::time::Duration;

/// The failed list is only popped after its length was read, so the pop
/// never actually blocks for long
const REPLAY_POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Result of one replay run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Messages moved to the main queue
    pub replayed: u64,
    /// Undecodable entries left in the failed queue
    pub skipped: u64,
}

/// Replay up to `limit` messages from the failed list, oldest first.
///
/// A popped entry that cannot be pushed to `main` goes back onto `failed`
/// before the error is returned.
pub async fn replay_failed<Q: QueueTransport + ?Sized>(
    queue: &Q,
    names: &QueueNames,
    codec: &MessageCodec,
    limit: u64,
) -> Result<ReplaySummary> {
    let available = queue.length(&names.failed).await?;
    let mut summary = ReplaySummary::default();

    for _ in 0..available.min(limit) {
        let Some(raw) = queue.pop_blocking(&names.failed, REPLAY_POP_TIMEOUT).await? else {
            break;
        };

        match codec.decode(raw.as_bytes()) {
            Ok(message) => {
                let fresh = message.reset_retries();
                let pushed = match codec.encode(&fresh) {
                    Ok(payload) => queue
                        .push_to_tail(&names.main, &payload)
                        .await
                        .map_err(Into::into),
                    Err(e) => Err(e.into()),
                };
                if let Err(e) = pushed {
                    restore(queue, names, &raw).await;
                    return Err(e);
                }
                tracing::info!(user_id = fresh.user_id, "Replayed failed message");
                summary.replayed += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Keeping undecodable entry in failed queue");
                queue.push_to_tail(&names.failed, &raw).await?;
                summary.skipped += 1;
            }
        }
    }

    Ok(summary)
}

/// Put a popped entry back at the tail of `failed`
async fn restore<Q: QueueTransport + ?Sized>(queue: &Q, names: &QueueNames, raw: &str) {
    if let Err(e) = queue.push_to_tail(&names.failed, raw).await {
        tracing::error!(
            queue = %names.failed,
            payload = %raw,
            error = %e,
            "Could not return entry to failed queue; message is lost"
        );
    }
}
