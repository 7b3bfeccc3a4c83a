//! Consumer loop for the stats refresh queue
//!
//! Pops one message at a time from the main list, runs the refresh, and
//! routes failures through the retry policy. Exactly one message is in
//! flight per process; horizontal scaling means running more processes.

use super::shutdown::ShutdownSignal;
use super::stats::{StatsSnapshot, StatsTracker};
use crate::error::{ConsumerError, Result};
use crate::message::{MessageCodec, RefreshMessage};
use crate::queue::{QueueNames, QueueTransport, DEFAULT_POP_TIMEOUT};
use crate::refresh::RefreshInvoker;
use crate::retry::{RetryDecision, RetryPolicy};

use chrono::Utc;
use std::time::Duration;
use tokio::sync::watch;

/// Consecutive transport errors tolerated before giving up
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Default cap on the failed list
pub const DEFAULT_MAX_FAILED_QUEUE_SIZE: u64 = 10_000;

/// Cap on the transport-error backoff exponent (2^5 = 32s)
const MAX_ERROR_BACKOFF_EXPONENT: u32 = 5;

/// Payload bytes included in malformed-message logs
const LOGGED_PAYLOAD_BYTES: usize = 256;

/// Lifecycle state of the consumer loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    /// Popping and processing messages
    Running,
    /// Shutdown requested; finishing the current message, no new pop
    Draining,
    /// Transport closed
    Stopped,
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsumerState::Running => write!(f, "running"),
            ConsumerState::Draining => write!(f, "draining"),
            ConsumerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Terminal outcome of one popped message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Refresh succeeded; the message is gone
    Succeeded,
    /// Refresh failed; pushed back with the new retry count after `delay`
    Requeued { retry_count: u32, delay: Duration },
    /// Retries exhausted; pushed to the failed list
    DeadLettered,
    /// Payload did not decode; dropped
    Malformed,
}

/// Loop configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Identifier attached to log lines
    pub consumer_id: String,
    /// List names
    pub queues: QueueNames,
    /// Blocking pop timeout; bounds shutdown latency while idle
    pub pop_timeout: Duration,
    /// Retry ceiling and backoff law
    pub retry_policy: RetryPolicy,
    /// Cap on the failed list
    pub max_failed_queue_size: u64,
    /// Consecutive transport errors tolerated mid-run
    pub max_consecutive_errors: u32,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            consumer_id: "stats-refresh-consumer".to_string(),
            queues: QueueNames::default(),
            pop_timeout: DEFAULT_POP_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            max_failed_queue_size: DEFAULT_MAX_FAILED_QUEUE_SIZE,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }
}

/// Long-running consumer of stats refresh requests
pub struct StatsRefreshConsumer<Q, R> {
    queue: Q,
    invoker: R,
    codec: MessageCodec,
    config: ConsumerConfig,
    shutdown: ShutdownSignal,
    state: ConsumerState,
    stats: StatsTracker,
    stats_tx: watch::Sender<StatsSnapshot>,
}

impl<Q: QueueTransport, R: RefreshInvoker> StatsRefreshConsumer<Q, R> {
    pub fn new(queue: Q, invoker: R, config: ConsumerConfig, shutdown: ShutdownSignal) -> Self {
        let stats = StatsTracker::new();
        let (stats_tx, _) = watch::channel(stats.snapshot());
        Self {
            queue,
            invoker,
            codec: MessageCodec::new(config.retry_policy.max_retries),
            config,
            shutdown,
            state: ConsumerState::Running,
            stats,
            stats_tx,
        }
    }

    pub fn consumer_id(&self) -> &str {
        &self.config.consumer_id
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    /// Current counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Receiver that sees a fresh snapshot after every processed message
    pub fn subscribe_stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.stats_tx.subscribe()
    }

    /// Run until shutdown is requested or the store keeps failing.
    /// The transport is closed on the way out.
    pub async fn run(mut self) -> Result<StatsSnapshot> {
        tracing::info!(
            consumer_id = %self.config.consumer_id,
            queue = %self.config.queues.main,
            "Consumer started"
        );

        let result = self.consume_loop().await;

        if let Err(e) = self.queue.close().await {
            tracing::warn!(error = %e, "Error closing transport");
        }
        self.state = ConsumerState::Stopped;

        let snapshot = self.stats.snapshot();
        self.stats_tx.send_replace(snapshot);
        match &result {
            Ok(()) => tracing::info!(stats = %snapshot, "Consumer stopped"),
            Err(e) => tracing::error!(stats = %snapshot, error = %e, "Consumer stopped with error"),
        }
        result.map(|()| snapshot)
    }

    async fn consume_loop(&mut self) -> Result<()> {
        let mut consecutive_errors = 0u32;

        loop {
            if self.shutdown.is_triggered() {
                self.enter_draining();
                return Ok(());
            }

            match self.poll_once().await {
                Ok(_) => consecutive_errors = 0,
                Err(ConsumerError::Transport(e)) => {
                    consecutive_errors += 1;
                    tracing::error!(
                        consecutive = consecutive_errors,
                        error = %e,
                        "Error in consume loop"
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        return Err(ConsumerError::TooManyTransportErrors {
                            count: consecutive_errors,
                            last: e,
                        });
                    }
                    self.sleep_unless_shutdown(error_backoff(consecutive_errors))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pop at most one message and carry it to a terminal outcome.
    /// Returns `None` when the pop timed out.
    pub async fn poll_once(&mut self) -> Result<Option<ProcessOutcome>> {
        let popped = self
            .queue
            .pop_blocking(&self.config.queues.main, self.config.pop_timeout)
            .await?;

        let Some(raw) = popped else {
            return Ok(None);
        };

        // A message that raced with the shutdown request is already ours
        if self.shutdown.is_triggered() {
            self.enter_draining();
        }

        self.process(raw).await.map(Some)
    }

    async fn process(&mut self, raw: String) -> Result<ProcessOutcome> {
        let mirrored = self.mirror_processing(&raw).await;

        let outcome = match self.codec.decode(raw.as_bytes()) {
            Ok(message) => self.refresh(message).await,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    payload = %truncate(&raw, LOGGED_PAYLOAD_BYTES),
                    "Dropping malformed message"
                );
                self.stats.record_malformed();
                Ok(ProcessOutcome::Malformed)
            }
        };

        if mirrored {
            match &outcome {
                Ok(_) => self.clear_processing(&raw).await,
                Err(e) => tracing::error!(
                    queue = %self.config.queues.processing,
                    payload = %truncate(&raw, LOGGED_PAYLOAD_BYTES),
                    error = %e,
                    "Message could not be routed; keeping its processing entry for inspection"
                ),
            }
        }

        let snapshot = self.stats.snapshot();
        self.stats_tx.send_replace(snapshot);
        if outcome.is_ok() {
            tracing::info!(stats = %snapshot, "Message handled");
        }
        outcome
    }

    async fn refresh(&mut self, message: RefreshMessage) -> Result<ProcessOutcome> {
        tracing::info!(
            user_id = message.user_id,
            requested_at = %message.requested_at.to_rfc3339(),
            retry = message.retry_count,
            "Processing stats refresh"
        );

        let failure = match self.invoker.refresh(message.user_id).await {
            Ok(()) => {
                self.stats.record_success();
                return Ok(ProcessOutcome::Succeeded);
            }
            Err(failure) => failure,
        };

        let policy = self.config.retry_policy;
        tracing::warn!(
            user_id = message.user_id,
            attempt = message.retry_count + 1,
            max_attempts = policy.max_retries + 1,
            error = %failure,
            "Refresh attempt failed"
        );

        match policy.on_failure(&message, Utc::now()) {
            RetryDecision::Requeue { message: next, delay } => {
                tracing::info!(
                    user_id = next.user_id,
                    retry_count = next.retry_count,
                    delay_secs = delay.as_secs(),
                    "Requeueing after backoff"
                );
                self.sleep_unless_shutdown(delay).await;

                let payload = self.codec.encode(&next)?;
                let main = self.config.queues.main.clone();
                self.push_with_retry(&main, &payload).await?;
                self.stats.record_retry();
                Ok(ProcessOutcome::Requeued {
                    retry_count: next.retry_count,
                    delay,
                })
            }
            RetryDecision::DeadLetter(spent) => {
                let payload = self.codec.encode(&spent)?;
                let failed = self.config.queues.failed.clone();
                self.push_with_retry(&failed, &payload).await?;
                if let Err(e) = self
                    .queue
                    .trim(&failed, self.config.max_failed_queue_size)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to trim failed queue");
                }
                tracing::warn!(
                    user_id = spent.user_id,
                    retry_count = spent.retry_count,
                    queue = %failed,
                    "Retries exhausted, moved to failed queue"
                );
                self.stats.record_dead_letter();
                Ok(ProcessOutcome::DeadLettered)
            }
        }
    }

    /// Push a message that is owned by nobody else; keep trying while the
    /// store is flaky rather than dropping it.
    ///
    /// The waits do not end early on shutdown: the message exists only in
    /// this process, so a drain keeps trying until the grace ceiling cuts it
    /// off. With the default five attempts the waits add up to 30s.
    async fn push_with_retry(&self, queue: &str, payload: &str) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.queue.push_to_tail(queue, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.config.max_consecutive_errors {
                        tracing::error!(
                            queue,
                            payload = %payload,
                            error = %e,
                            "Giving up on push; message is lost"
                        );
                        return Err(ConsumerError::TooManyTransportErrors {
                            count: attempt,
                            last: e,
                        });
                    }
                    tracing::warn!(
                        queue,
                        attempt,
                        draining = self.shutdown.is_triggered(),
                        error = %e,
                        "Push failed, retrying"
                    );
                    tokio::time::sleep(error_backoff(attempt)).await;
                }
            }
        }
    }

    async fn mirror_processing(&self, raw: &str) -> bool {
        match self
            .queue
            .push_to_tail(&self.config.queues.processing, raw)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to record message in processing queue");
                false
            }
        }
    }

    async fn clear_processing(&self, raw: &str) {
        if let Err(e) = self.queue.remove(&self.config.queues.processing, raw).await {
            tracing::warn!(error = %e, "Failed to remove message from processing queue");
        }
    }

    /// Sleep for `delay`, returning early if shutdown is requested
    async fn sleep_unless_shutdown(&self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.wait() => {
                tracing::info!("Shutdown requested, cutting wait short");
            }
        }
    }

    fn enter_draining(&mut self) {
        if self.state == ConsumerState::Running {
            self.state = ConsumerState::Draining;
            tracing::info!("Shutdown requested, no further messages will be taken");
        }
    }
}

fn error_backoff(consecutive: u32) -> Duration {
    Duration::from_secs(2u64.pow(consecutive.min(MAX_ERROR_BACKOFF_EXPONENT)))
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RefreshFailure;
    use crate::queue::MemoryQueue;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Invoker that replays a fixed script of outcomes, then succeeds
    #[derive(Default)]
    struct Scripted {
        outcomes: Mutex<VecDeque<bool>>,
        calls: Mutex<Vec<u64>>,
    }

    impl Scripted {
        fn new(outcomes: &[bool]) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.iter().copied().collect()),
                calls: Mutex::default(),
            })
        }

        fn calls(&self) -> Vec<u64> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl RefreshInvoker for Scripted {
        async fn refresh(&self, user_id: u64) -> std::result::Result<(), RefreshFailure> {
            self.calls.lock().unwrap().push(user_id);
            match self.outcomes.lock().unwrap().pop_front() {
                Some(false) => Err(RefreshFailure::new(user_id, "scripted failure")),
                _ => Ok(()),
            }
        }
    }

    const MSG: &str = r#"{"userId":1,"requestedAt":"2025-01-01T00:00:00Z","retryCount":0}"#;

    fn consumer(
        queue: &Arc<MemoryQueue>,
        invoker: &Arc<Scripted>,
    ) -> StatsRefreshConsumer<Arc<MemoryQueue>, Arc<Scripted>> {
        StatsRefreshConsumer::new(
            queue.clone(),
            invoker.clone(),
            ConsumerConfig::default(),
            ShutdownSignal::new(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_once_timeout() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[]);
        let mut consumer = consumer(&queue, &invoker);

        assert_eq!(consumer.poll_once().await.unwrap(), None);
        assert!(invoker.calls().is_empty());
        assert_eq!(consumer.state(), ConsumerState::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_leaves_no_trace() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[true]);
        queue.push_to_tail(MAIN, MSG).await.unwrap();
        let mut consumer = consumer(&queue, &invoker);

        let outcome = consumer.poll_once().await.unwrap();
        assert_eq!(outcome, Some(ProcessOutcome::Succeeded));
        assert!(queue.contents(MAIN).is_empty());
        assert!(queue.contents(PROCESSING).is_empty());
        assert!(queue.contents(FAILED).is_empty());
        assert_eq!(consumer.stats().succeeded, 1);
        assert_eq!(invoker.calls(), vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_requeues_with_backoff() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[false]);
        queue.push_to_tail(MAIN, MSG).await.unwrap();
        let mut consumer = consumer(&queue, &invoker);

        let start = tokio::time::Instant::now();
        let outcome = consumer.poll_once().await.unwrap();

        assert_eq!(
            outcome,
            Some(ProcessOutcome::Requeued {
                retry_count: 1,
                delay: Duration::from_secs(1)
            })
        );
        assert!(start.elapsed() >= Duration::from_secs(1));

        let main = queue.contents(MAIN);
        assert_eq!(main.len(), 1);
        let requeued = crate::message::decode(main[0].as_bytes(), 3).unwrap();
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued.last_attempt_at.is_some());
        assert!(queue.contents(PROCESSING).is_empty());

        let stats = consumer.stats();
        assert_eq!((stats.failed, stats.retried), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spent_message_is_dead_lettered() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[false]);
        queue
            .push_to_tail(
                MAIN,
                r#"{"userId":5,"requestedAt":"2025-01-01T00:00:00Z","retryCount":3}"#,
            )
            .await
            .unwrap();
        let mut consumer = consumer(&queue, &invoker);

        let start = tokio::time::Instant::now();
        let outcome = consumer.poll_once().await.unwrap();

        assert_eq!(outcome, Some(ProcessOutcome::DeadLettered));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(queue.contents(MAIN).is_empty());
        let failed = queue.contents(FAILED);
        assert_eq!(failed.len(), 1);
        assert_eq!(crate::message::decode(failed[0].as_bytes(), 3).unwrap().retry_count, 3);
        assert_eq!(consumer.stats().dead_lettered, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_queue_is_capped() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[false, false, false]);
        for user in 1..=3 {
            let payload = format!(
                r#"{{"userId":{},"requestedAt":"2025-01-01T00:00:00Z","retryCount":3}}"#,
                user
            );
            queue.push_to_tail(MAIN, &payload).await.unwrap();
        }
        let config = ConsumerConfig {
            max_failed_queue_size: 2,
            ..Default::default()
        };
        let mut consumer =
            StatsRefreshConsumer::new(queue.clone(), invoker.clone(), config, ShutdownSignal::new());

        for _ in 0..3 {
            consumer.poll_once().await.unwrap();
        }
        let kept: Vec<u64> = queue
            .contents(FAILED)
            .iter()
            .map(|p| crate::message::decode(p.as_bytes(), 3).unwrap().user_id)
            .collect();
        assert_eq!(kept, vec![2, 3]);
        assert_eq!(consumer.stats().dead_lettered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_is_dropped_without_delay() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[]);
        queue
            .push_to_tail(MAIN, r#"{"requestedAt":"2025-12-12T10:30:00Z"}"#)
            .await
            .unwrap();
        let mut consumer = consumer(&queue, &invoker);

        let start = tokio::time::Instant::now();
        assert_eq!(consumer.poll_once().await.unwrap(), Some(ProcessOutcome::Malformed));
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(invoker.calls().is_empty());
        assert!(queue.contents(MAIN).is_empty());
        assert!(queue.contents(PROCESSING).is_empty());
        assert!(queue.contents(FAILED).is_empty());

        let stats = consumer.stats();
        assert_eq!((stats.failed, stats.malformed), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_survives_transient_errors() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[]);
        let consumer = consumer(&queue, &invoker);

        queue.fail_next(2);
        consumer.push_with_retry(MAIN, MSG).await.unwrap();
        assert_eq!(queue.contents(MAIN), vec![MSG.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_keeps_retrying_while_draining() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[]);
        let shutdown = ShutdownSignal::new();
        let consumer = StatsRefreshConsumer::new(
            queue.clone(),
            invoker.clone(),
            ConsumerConfig::default(),
            shutdown.clone(),
        );
        shutdown.trigger();

        queue.fail_next(2);
        let start = tokio::time::Instant::now();
        consumer.push_with_retry(MAIN, MSG).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(6));
        assert_eq!(queue.contents(MAIN), vec![MSG.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unroutable_message_stays_in_processing() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[false]);
        queue.push_to_tail(MAIN, MSG).await.unwrap();
        queue.reject_pushes(MAIN);
        let mut consumer = consumer(&queue, &invoker);

        let err = consumer.poll_once().await.unwrap_err();

        assert!(matches!(
            err,
            ConsumerError::TooManyTransportErrors { count: 5, .. }
        ));
        assert!(queue.contents(MAIN).is_empty());
        assert!(queue.contents(FAILED).is_empty());
        assert_eq!(queue.contents(PROCESSING), vec![MSG.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_consecutive_transport_errors() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[]);
        queue.fail_next(100);
        let consumer = consumer(&queue, &invoker);

        let err = consumer.run().await.unwrap_err();
        assert!(matches!(
            err,
            ConsumerError::TooManyTransportErrors { count: 5, .. }
        ));
        assert!(queue.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_recovers_from_transient_pop_errors() {
        let queue = Arc::new(MemoryQueue::new());
        let invoker = Scripted::new(&[true]);
        queue.push_to_tail(MAIN, MSG).await.unwrap();
        queue.fail_next(2);

        let shutdown = ShutdownSignal::new();
        let consumer = StatsRefreshConsumer::new(
            queue.clone(),
            invoker.clone(),
            ConsumerConfig::default(),
            shutdown.clone(),
        );
        let mut stats_rx = consumer.subscribe_stats();
        let handle = tokio::spawn(consumer.run());

        stats_rx.wait_for(|s| s.succeeded == 1).await.unwrap();
        shutdown.trigger();
        let stats = handle.await.unwrap().unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(invoker.calls(), vec![1]);
    }

    #[test]
    fn test_error_backoff_is_capped() {
        assert_eq!(error_backoff(1), Duration::from_secs(2));
        assert_eq!(error_backoff(3), Duration::from_secs(8));
        assert_eq!(error_backoff(9), Duration::from_secs(32));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "h");
        assert_eq!(truncate("short", 64), "short");
    }

    const MAIN: &str = crate::queue::MAIN_QUEUE_KEY;
    const PROCESSING: &str = crate::queue::PROCESSING_QUEUE_KEY;
    const FAILED: &str = crate::queue::FAILED_QUEUE_KEY;
}
