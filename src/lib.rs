//! stats-refresh-consumer - Redis-backed stats refresh worker
//!
//! Drains a Redis list of per-user stats refresh requests, runs the batch
//! processor for each one, and routes failures through a bounded
//! retry-with-backoff policy before dead-lettering them.
//!
//! # Features
//!
//! - **At most one message in flight**: the loop pops, processes and
//!   reaches a terminal outcome before popping again. Scale out by running
//!   more processes against the same list.
//!
//! - **Exponential backoff**: a failed attempt `k` waits `2^k` seconds
//!   before the message goes back onto the main list.
//!
//! - **Dead-lettering**: messages that exhaust their retries land in a
//!   capped failed list for inspection and `replay-failed`.
//!
//! - **Graceful shutdown**: SIGINT/SIGTERM stop new pops; the current
//!   message gets a bounded grace period to finish.
//!
//! # Architecture
//!
//! ```text
//!   producers ──LPUSH──▶ ┌────────────────────────────┐
//!                        │ vd2:queue:stats-refresh    │
//!                        └─────────────┬──────────────┘
//!                                      │ BRPOP (5s)
//!                                      ▼
//!                        ┌────────────────────────────┐
//!                        │   StatsRefreshConsumer     │──▶ batch processor
//!                        │   decode / refresh / retry │     (per user)
//!                        └──────┬──────────────┬──────┘
//!                     LPUSH     │              │  LPUSH + LTRIM
//!                (retry+1)      ▼              ▼
//!                      main queue       vd2:queue:stats-refresh:failed
//! ```
//!
//! # Example
//!
//! ```bash
//! # Run the consumer
//! REFRESH_COMMAND='refresh-user-stats {user_id}' stats-refresh-consumer consume
//!
//! # Inspect the lists
//! stats-refresh-consumer status --format json
//! ```

pub mod config;
pub mod consumer;
pub mod error;
pub mod message;
pub mod progress;
pub mod queue;
pub mod refresh;
pub mod replay;
pub mod retry;

pub use config::{AppConfig, CliArgs, Command, ConsumeArgs, OutputFormat};
pub use consumer::{supervise, ShutdownSignal, StatsRefreshConsumer, StatsSnapshot};
pub use error::{ConsumerError, Result};
pub use message::RefreshMessage;
pub use queue::{MemoryQueue, QueueTransport, RedisQueue};
pub use retry::RetryPolicy;
