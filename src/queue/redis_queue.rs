//! Redis-backed list transport
//!
//! Uses plain Redis lists:
//! - `LPUSH` to append at the tail
//! - `BRPOP` to take from the head, blocking up to a timeout
//! - `LLEN`, `LREM`, `LTRIM` for inspection and housekeeping
//!
//! `BRPOP` removes atomically, so each item is delivered to exactly one
//! consumer process even when several share the same store.

use crate::error::{TransportError, TransportResult};
use crate::queue::QueueTransport;

use redis::{aio::MultiplexedConnection, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;

/// Connection attempts made at startup before giving up
pub const STARTUP_CONNECT_ATTEMPTS: u32 = 3;

/// Configuration for the Redis transport
#[derive(Debug, Clone)]
pub struct RedisQueueConfig {
    /// Redis host
    pub host: String,
    /// Redis port
    pub port: u16,
    /// Optional AUTH password
    pub password: Option<String>,
    /// Database index
    pub db: i64,
    /// Limit on establishing a connection
    pub connect_timeout: Duration,
}

impl Default for RedisQueueConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            password: None,
            db: 0,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RedisQueueConfig {
    /// `host:port` for log lines and errors (never includes the password)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: self.db,
                password: self.password.clone(),
                ..Default::default()
            },
        }
    }
}

/// Redis list transport
pub struct RedisQueue {
    client: Client,
    /// `None` once closed
    connection: RwLock<Option<MultiplexedConnection>>,
    config: RedisQueueConfig,
}

impl RedisQueue {
    /// Connect and verify the connection with `PING`
    pub async fn connect(config: RedisQueueConfig) -> TransportResult<Self> {
        let client = Client::open(config.connection_info()).map_err(|e| {
            TransportError::ConnectionFailed {
                addr: config.addr(),
                reason: e.to_string(),
            }
        })?;

        let connection = Self::open_connection(&client, &config).await?;

        let queue = Self {
            client,
            connection: RwLock::new(Some(connection)),
            config,
        };
        queue.ping().await?;

        tracing::info!(addr = %queue.config.addr(), db = queue.config.db, "Redis connection established");
        Ok(queue)
    }

    /// Connect at startup, retrying with 1s, 2s, ... waits between attempts.
    /// The last error is returned when every attempt fails.
    pub async fn connect_with_retry(config: RedisQueueConfig, attempts: u32) -> TransportResult<Self> {
        with_startup_retry(attempts, || Self::connect(config.clone())).await
    }

    async fn open_connection(
        client: &Client,
        config: &RedisQueueConfig,
    ) -> TransportResult<MultiplexedConnection> {
        match tokio::time::timeout(
            config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed {
                addr: config.addr(),
                reason: e.to_string(),
            }),
            Err(_) => Err(TransportError::ConnectTimeout {
                addr: config.addr(),
                timeout: config.connect_timeout,
            }),
        }
    }

    /// Get a handle on the current connection
    async fn conn(&self) -> TransportResult<MultiplexedConnection> {
        self.connection
            .read()
            .await
            .as_ref()
            .cloned()
            .ok_or(TransportError::Closed)
    }

    /// Swap in a fresh connection after the current one dropped
    async fn reconnect(&self) {
        let mut guard = self.connection.write().await;
        if guard.is_none() {
            return;
        }
        match Self::open_connection(&self.client, &self.config).await {
            Ok(conn) => {
                *guard = Some(conn);
                tracing::info!(addr = %self.config.addr(), "Reconnected to Redis");
            }
            Err(e) => {
                tracing::warn!(addr = %self.config.addr(), error = %e, "Failed to reconnect to Redis");
            }
        }
    }

    /// Run one command, mapping errors and refreshing the connection when it
    /// was lost
    async fn run<T: redis::FromRedisValue>(
        &self,
        command: &'static str,
        cmd: &redis::Cmd,
    ) -> TransportResult<T> {
        let mut conn = self.conn().await?;
        match cmd.query_async::<T>(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = TransportError::from_redis(command, e);
                tracing::error!(command, error = %err, "Redis command failed");
                if err.is_connection_error() {
                    self.reconnect().await;
                }
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl QueueTransport for RedisQueue {
    async fn ping(&self) -> TransportResult<()> {
        let reply: String = self.run("PING", &redis::cmd("PING")).await?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(TransportError::CommandFailed {
                command: "PING",
                reason: format!("unexpected reply '{}'", reply),
            })
        }
    }

    async fn pop_blocking(&self, queue: &str, timeout: Duration) -> TransportResult<Option<String>> {
        // BRPOP treats 0 as "wait forever"
        let secs = timeout.as_secs().max(1);
        let mut cmd = redis::cmd("BRPOP");
        cmd.arg(queue).arg(secs);

        let reply: Option<(String, String)> = self.run("BRPOP", &cmd).await?;
        if let Some((_, ref payload)) = reply {
            tracing::debug!(queue, payload = %payload, "Popped message");
        }
        Ok(reply.map(|(_, payload)| payload))
    }

    async fn push_to_tail(&self, queue: &str, payload: &str) -> TransportResult<()> {
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(queue).arg(payload);
        let len: i64 = self.run("LPUSH", &cmd).await?;
        tracing::debug!(queue, len, "Pushed message");
        Ok(())
    }

    async fn length(&self, queue: &str) -> TransportResult<u64> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(queue);
        self.run("LLEN", &cmd).await
    }

    async fn remove(&self, queue: &str, payload: &str) -> TransportResult<u64> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(queue).arg(1).arg(payload);
        let removed: i64 = self.run("LREM", &cmd).await?;
        Ok(removed.max(0) as u64)
    }

    async fn trim(&self, queue: &str, max_len: u64) -> TransportResult<()> {
        if max_len == 0 {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(queue);
            let _: i64 = self.run("DEL", &cmd).await?;
            return Ok(());
        }
        // Newest items sit at the left end
        let mut cmd = redis::cmd("LTRIM");
        cmd.arg(queue).arg(0).arg(max_len as i64 - 1);
        self.run::<()>("LTRIM", &cmd).await
    }

    async fn close(&self) -> TransportResult<()> {
        if self.connection.write().await.take().is_some() {
            tracing::info!(addr = %self.config.addr(), "Redis connection closed");
        }
        Ok(())
    }
}

fn startup_backoff(failed_attempt: u32) -> Duration {
    Duration::from_secs(1u64 << (failed_attempt.saturating_sub(1)).min(5))
}

/// Run `connect` up to `attempts` times, sleeping `startup_backoff` between
/// failures
pub(crate) async fn with_startup_retry<T, F, Fut>(attempts: u32, mut connect: F) -> TransportResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TransportResult<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match connect().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                let wait = startup_backoff(attempt);
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    retry_in_secs = wait.as_secs(),
                    error = %e,
                    "Redis connection attempt failed"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
