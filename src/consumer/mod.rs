//! Consumer module for stats refresh processing
//!
//! The consumer loop pulls refresh requests from the main list and runs them
//! one at a time. `supervise` wraps a loop run with the graceful shutdown
//! ceiling: once shutdown is requested the loop gets at most the grace
//! period to finish its current message.

mod shutdown;
mod stats;
mod worker;

pub use shutdown::ShutdownSignal;
pub use stats::{StatsSnapshot, StatsTracker};
pub use worker::{
    ConsumerConfig, ConsumerState, ProcessOutcome, StatsRefreshConsumer,
    DEFAULT_MAX_CONSECUTIVE_ERRORS, DEFAULT_MAX_FAILED_QUEUE_SIZE,
};

use crate::error::{ConsumerError, Result, ShutdownTimeoutExceeded};
use crate::queue::QueueTransport;
use crate::refresh::RefreshInvoker;

use std::time::Duration;
use tracing::Instrument;

/// Default ceiling on draining
pub const DEFAULT_GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Run the consumer on its own task until it stops.
///
/// After `shutdown` fires, the loop has `grace` to finish. If it does not,
/// the task is aborted and `ShutdownTimeoutExceeded` is returned; the
/// message in flight at that moment may be lost.
pub async fn supervise<Q, R>(
    consumer: StatsRefreshConsumer<Q, R>,
    shutdown: ShutdownSignal,
    grace: Duration,
) -> Result<StatsSnapshot>
where
    Q: QueueTransport + 'static,
    R: RefreshInvoker + 'static,
{
    let stats_rx = consumer.subscribe_stats();
    let span = tracing::info_span!("consumer", id = %consumer.consumer_id());
    let mut handle = tokio::spawn(consumer.run().instrument(span));

    tokio::select! {
        joined = &mut handle => return flatten(joined),
        _ = shutdown.wait() => {}
    }

    tracing::info!(grace_secs = grace.as_secs(), "Waiting for current message to finish");
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(joined) => flatten(joined),
        Err(_) => {
            handle.abort();
            let err = ShutdownTimeoutExceeded { grace };
            let last = *stats_rx.borrow();
            tracing::warn!(stats = %last, "{}", err);
            Err(err.into())
        }
    }
}

fn flatten(joined: std::result::Result<Result<StatsSnapshot>, tokio::task::JoinError>) -> Result<StatsSnapshot> {
    joined.map_err(|e| ConsumerError::Internal(format!("consumer task failed: {}", e)))?
}
