//! In-memory list transport
//!
//! Same FIFO and blocking-pop semantics as the Redis transport, held in
//! process memory. Supports injecting connection failures so the consumer's
//! transport-error handling can be exercised without a server.

use crate::error::{TransportError, TransportResult};
use crate::queue::QueueTransport;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// In-memory list store
#[derive(Default)]
pub struct MemoryQueue {
    /// Lists keyed by name; front is the head, back is the tail
    lists: Mutex<HashMap<String, VecDeque<String>>>,
    pushed: Notify,
    closed: AtomicBool,
    /// Number of upcoming operations that fail as if the connection dropped
    failures_pending: AtomicU32,
    /// Lists whose pushes are refused, like a store out of memory
    rejecting: Mutex<HashSet<String>>,
    pops: AtomicU64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with `TransportError::ConnectionLost`
    pub fn fail_next(&self, n: u32) {
        self.failures_pending.store(n, Ordering::SeqCst);
    }

    /// Refuse every push to `queue` while other commands keep working
    pub fn reject_pushes(&self, queue: &str) {
        self.rejecting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(queue.to_string());
    }

    /// Number of blocking pops started so far
    pub fn pop_count(&self) -> u64 {
        self.pops.load(Ordering::SeqCst)
    }

    /// Snapshot of a list, head first
    pub fn contents(&self, queue: &str) -> Vec<String> {
        self.lock()
            .get(queue)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, VecDeque<String>>> {
        // A panic while holding the lock leaves plain data behind; keep going
        self.lists.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::ConnectionLost("injected failure".into()));
        }
        Ok(())
    }

    fn try_pop(&self, queue: &str) -> Option<String> {
        self.lock().get_mut(queue).and_then(|list| list.pop_front())
    }
}

#[async_trait::async_trait]
impl QueueTransport for MemoryQueue {
    async fn ping(&self) -> TransportResult<()> {
        self.check()
    }

    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> TransportResult<Option<String>> {
        self.check()?;
        self.pops.fetch_add(1, Ordering::SeqCst);

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before looking so a concurrent push is not missed
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_pop(queue) {
                return Ok(Some(payload));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
            if self.is_closed() {
                return Err(TransportError::Closed);
            }
        }
    }

    async fn push_to_tail(&self, queue: &str, payload: &str) -> TransportResult<()> {
        self.check()?;
        let rejected = self
            .rejecting
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(queue);
        if rejected {
            return Err(TransportError::CommandFailed {
                command: "LPUSH",
                reason: "OOM command not allowed when used memory > 'maxmemory'".into(),
            });
        }
        self.lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        self.pushed.notify_waiters();
        Ok(())
    }

    async fn length(&self, queue: &str) -> TransportResult<u64> {
        self.check()?;
        Ok(self.lock().get(queue).map_or(0, |list| list.len() as u64))
    }

    async fn remove(&self, queue: &str, payload: &str) -> TransportResult<u64> {
        self.check()?;
        let mut lists = self.lock();
        let Some(list) = lists.get_mut(queue) else {
            return Ok(0);
        };
        // LREM with a positive count scans from the left (tail) end
        match list.iter().rposition(|item| item == payload) {
            Some(idx) => {
                list.remove(idx);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn trim(&self, queue: &str, max_len: u64) -> TransportResult<()> {
        self.check()?;
        if let Some(list) = self.lock().get_mut(queue) {
            while list.len() as u64 > max_len {
                list.pop_front();
            }
        }
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.pushed.notify_waiters();
        Ok(())
    }
}
