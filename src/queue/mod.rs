//! Queue module for the stats refresh work lists
//!
//! Provides a list-store abstraction backed by Redis, plus an in-memory
//! implementation with the same blocking-pop semantics.
//!
//! Every list is FIFO: items enter at the tail and leave from the head.
//! On Redis the tail is the left end (`LPUSH`) and the head is the right
//! end (`BRPOP`).

pub mod memory;
mod redis_queue;

pub use memory::MemoryQueue;
pub use redis_queue::{RedisQueue, RedisQueueConfig, STARTUP_CONNECT_ATTEMPTS};

use crate::error::TransportResult;
use std::time::Duration;

/// Redis key for pending refresh requests
pub const MAIN_QUEUE_KEY: &str = "vd2:queue:stats-refresh";

/// Redis key mirroring messages currently being handled
pub const PROCESSING_QUEUE_KEY: &str = "vd2:queue:stats-refresh:processing";

/// Redis key for dead-lettered messages
pub const FAILED_QUEUE_KEY: &str = "vd2:queue:stats-refresh:failed";

/// Default blocking pop timeout
pub const DEFAULT_POP_TIMEOUT: Duration = Duration::from_secs(5);

/// Names of the three lists the consumer works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    pub main: String,
    pub processing: String,
    pub failed: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            main: MAIN_QUEUE_KEY.to_string(),
            processing: PROCESSING_QUEUE_KEY.to_string(),
            failed: FAILED_QUEUE_KEY.to_string(),
        }
    }
}

impl QueueNames {
    /// All three names, in main/processing/failed order
    pub fn all(&self) -> [&str; 3] {
        [&self.main, &self.processing, &self.failed]
    }
}

/// Trait for list-store transports
#[async_trait::async_trait]
pub trait QueueTransport: Send + Sync {
    /// Check that the store is reachable
    async fn ping(&self) -> TransportResult<()>;

    /// Remove and return the head item, waiting up to `timeout`.
    /// Returns `None` when the wait times out.
    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> TransportResult<Option<String>>;

    /// Append an item at the tail
    async fn push_to_tail(&self, queue: &str, payload: &str) -> TransportResult<()>;

    /// Number of items in a list
    async fn length(&self, queue: &str) -> TransportResult<u64>;

    /// Remove one occurrence of `payload`; returns how many were removed
    async fn remove(&self, queue: &str, payload: &str) -> TransportResult<u64>;

    /// Keep only the `max_len` most recently pushed items
    async fn trim(&self, queue: &str, max_len: u64) -> TransportResult<()>;

    /// Release the connection; later calls fail with `TransportError::Closed`
    async fn close(&self) -> TransportResult<()>;
}

#[async_trait::async_trait]
impl<T: QueueTransport + ?Sized> QueueTransport for std::sync::Arc<T> {
    async fn ping(&self) -> TransportResult<()> {
        (**self).ping().await
    }

    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> TransportResult<Option<String>> {
        (**self).pop_blocking(queue, timeout).await
    }

    async fn push_to_tail(&self, queue: &str, payload: &str) -> TransportResult<()> {
        (**self).push_to_tail(queue, payload).await
    }

    async fn length(&self, queue: &str) -> TransportResult<u64> {
        (**self).length(queue).await
    }

    async fn remove(&self, queue: &str, payload: &str) -> TransportResult<u64> {
        (**self).remove(queue, payload).await
    }

    async fn trim(&self, queue: &str, max_len: u64) -> TransportResult<()> {
        (**self).trim(queue, max_len).await
    }

    async fn close(&self) -> TransportResult<()> {
        (**self).close().await
    }
}

/// Lengths of the three lists at one point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepths {
    pub main: u64,
    pub processing: u64,
    pub failed: u64,
}

impl QueueDepths {
    /// Read all three lengths
    pub async fn read<Q: QueueTransport + ?Sized>(
        queue: &Q,
        names: &QueueNames,
    ) -> TransportResult<Self> {
        Ok(Self {
            main: queue.length(&names.main).await?,
            processing: queue.length(&names.processing).await?,
            failed: queue.length(&names.failed).await?,
        })
    }
}
