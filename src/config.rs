//! Configuration types for stats-refresh-consumer
//!
//! Every setting is a CLI flag backed by an environment variable, so the
//! process can be configured the same way as the rest of the deployment
//! (`REDIS_HOST`, `CONSUMER_LOG_LEVEL`, ...).

use crate::consumer::{ConsumerConfig, DEFAULT_MAX_CONSECUTIVE_ERRORS};
use crate::error::ConfigError;
use crate::queue::{QueueNames, RedisQueueConfig, DEFAULT_POP_TIMEOUT};
use crate::refresh::CommandInvoker;
use crate::retry::RetryPolicy;

use clap::{Parser, Subcommand, ValueEnum};
use std::time::Duration;

/// Process name used in logs and the default consumer id
pub const PROCESS_NAME: &str = "stats-refresh-consumer";

/// Queue consumer that applies per-user stats refreshes
#[derive(Parser, Debug, Clone)]
#[command(
    name = "stats-refresh-consumer",
    version,
    about = "Drains the stats refresh queue with retry, dead-lettering and graceful shutdown",
    after_help = "EXAMPLES:\n    \
        # Run the consumer\n    \
        REFRESH_COMMAND='python manage.py refresh_user_stats' stats-refresh-consumer consume\n\n    \
        # Check queue depths\n    \
        stats-refresh-consumer status --format json\n\n    \
        # Give dead-lettered requests another round\n    \
        stats-refresh-consumer replay-failed --limit 100"
)]
pub struct CliArgs {
    /// Subcommand to run (defaults to `consume`)
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub consume: ConsumeArgs,

    /// Redis host
    #[arg(long, env = "REDIS_HOST", default_value = "localhost", global = true)]
    pub redis_host: String,

    /// Redis port
    #[arg(long, env = "REDIS_PORT", default_value_t = 6379, global = true)]
    pub redis_port: u16,

    /// Redis password
    #[arg(long, env = "REDIS_PASSWORD", hide_env_values = true, global = true)]
    pub redis_password: Option<String>,

    /// Redis database index
    #[arg(long, env = "REDIS_DB", default_value_t = 0, global = true)]
    pub redis_db: i64,

    /// Maximum entries kept in the failed queue; oldest are dropped first
    #[arg(long, env = "REDIS_MAX_FAILED_QUEUE_SIZE", default_value_t = 10_000, global = true)]
    pub max_failed_queue_size: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CONSUMER_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    /// Seconds to wait for the in-flight message after a shutdown signal
    #[arg(long, env = "CONSUMER_GRACEFUL_SHUTDOWN_TIMEOUT", default_value_t = 30, value_name = "SECS", global = true)]
    pub graceful_shutdown_timeout: u64,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Consume the stats refresh queue until SIGINT/SIGTERM
    Consume,

    /// Show main/processing/failed queue lengths
    Status {
        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Move dead-lettered messages back to the main queue with a fresh retry budget
    ReplayFailed {
        /// Maximum number of messages to move
        #[arg(long, default_value_t = 100, value_name = "NUM")]
        limit: u64,
    },
}

/// Settings only `consume` reads. Parsed at the top level so they apply
/// whether or not the subcommand is named.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConsumeArgs {
    /// Batch processor command; `{user_id}` is replaced by the user id,
    /// otherwise the id is appended as the last argument
    #[arg(long, env = "REFRESH_COMMAND", value_name = "CMD", global = true)]
    pub refresh_command: Option<String>,

    /// Consumer ID (auto-generated if not specified)
    #[arg(long, env = "CONSUMER_ID", value_name = "ID", global = true)]
    pub consumer_id: Option<String>,
}

/// Output format for `status`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Settings shared by every subcommand
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub redis: RedisQueueConfig,
    pub queues: QueueNames,
    /// Normalized tracing level name
    pub log_level: String,
    pub graceful_shutdown_timeout: Duration,
    pub max_failed_queue_size: u64,
}

impl AppConfig {
    /// Validate CLI/environment values
    pub fn from_args(args: &CliArgs) -> Result<Self, ConfigError> {
        if args.redis_port == 0 {
            return Err(ConfigError::InvalidPort(args.redis_port));
        }
        if args.graceful_shutdown_timeout == 0 {
            return Err(ConfigError::InvalidShutdownTimeout(args.graceful_shutdown_timeout));
        }
        if args.max_failed_queue_size == 0 {
            return Err(ConfigError::InvalidFailedQueueSize(args.max_failed_queue_size));
        }

        Ok(Self {
            redis: RedisQueueConfig {
                host: args.redis_host.clone(),
                port: args.redis_port,
                password: args.redis_password.clone().filter(|p| !p.is_empty()),
                db: args.redis_db,
                ..Default::default()
            },
            queues: QueueNames::default(),
            log_level: normalize_log_level(&args.log_level)?,
            graceful_shutdown_timeout: Duration::from_secs(args.graceful_shutdown_timeout),
            max_failed_queue_size: args.max_failed_queue_size,
        })
    }

    /// Build the loop configuration for `consume`
    pub fn consumer_config(&self, consumer_id: Option<&str>) -> ConsumerConfig {
        ConsumerConfig {
            consumer_id: consumer_id
                .map(str::to_string)
                .unwrap_or_else(generate_consumer_id),
            queues: self.queues.clone(),
            pop_timeout: DEFAULT_POP_TIMEOUT,
            retry_policy: RetryPolicy::default(),
            max_failed_queue_size: self.max_failed_queue_size,
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }
}

impl CliArgs {
    /// Subcommand to run; `consume` when none was given
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Consume)
    }
}

impl ConsumeArgs {
    /// Build the batch processor invoker
    pub fn invoker(&self) -> Result<CommandInvoker, ConfigError> {
        let command = self
            .refresh_command
            .as_deref()
            .ok_or_else(|| ConfigError::MissingRequired("--refresh-command / REFRESH_COMMAND".into()))?;
        CommandInvoker::from_command_line(command)
    }
}

/// Map a level name to a tracing level, accepting the upper-case and
/// `WARNING`/`CRITICAL` spellings used by other services' configs
pub fn normalize_log_level(level: &str) -> Result<String, ConfigError> {
    let lowered = level.trim().to_ascii_lowercase();
    let mapped = match lowered.as_str() {
        "warning" => "warn",
        "critical" | "fatal" => "error",
        other => other,
    };
    mapped
        .parse::<tracing::Level>()
        .map(|l| l.to_string().to_ascii_lowercase())
        .map_err(|e| ConfigError::InvalidLogLevel {
            level: level.to_string(),
            reason: e.to_string(),
        })
}

/// `<hostname>-<8 hex chars>`
fn generate_consumer_id() -> String {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| PROCESS_NAME.to_string());
    format!("{}-{}", hostname, &uuid::Uuid::new_v4().simple().to_string()[..8])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let mut argv = vec!["stats-refresh-consumer"];
        argv.extend_from_slice(args);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let args = parse(&[
            "--redis-host", "localhost",
            "--redis-port", "6379",
            "--log-level", "info",
            "--graceful-shutdown-timeout", "30",
            "--max-failed-queue-size", "10000",
            "consume",
        ]);
        let config = AppConfig::from_args(&args).unwrap();

        assert_eq!(config.redis.addr(), "localhost:6379");
        assert_eq!(config.graceful_shutdown_timeout, Duration::from_secs(30));
        assert_eq!(config.max_failed_queue_size, 10_000);
        assert_eq!(config.queues.main, "vd2:queue:stats-refresh");
        assert!(matches!(args.command, Some(Command::Consume)));
    }

    #[test]
    fn test_consumer_config_uses_fixed_policy() {
        let args = parse(&["--max-failed-queue-size", "50", "consume"]);
        let consumer = AppConfig::from_args(&args)
            .unwrap()
            .consumer_config(Some("worker-1"));

        assert_eq!(consumer.consumer_id, "worker-1");
        assert_eq!(consumer.pop_timeout, Duration::from_secs(5));
        assert_eq!(consumer.retry_policy, RetryPolicy::new(3, 2));
        assert_eq!(consumer.max_failed_queue_size, 50);
    }

    #[test]
    fn test_generated_consumer_id() {
        let args = parse(&[]);
        let id = AppConfig::from_args(&args).unwrap().consumer_config(None).consumer_id;
        let suffix = id.rsplit('-').next().unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            AppConfig::from_args(&parse(&["--redis-port", "0"])),
            Err(ConfigError::InvalidPort(0))
        ));
        assert!(matches!(
            AppConfig::from_args(&parse(&["--graceful-shutdown-timeout", "0"])),
            Err(ConfigError::InvalidShutdownTimeout(0))
        ));
        assert!(matches!(
            AppConfig::from_args(&parse(&["--max-failed-queue-size", "0"])),
            Err(ConfigError::InvalidFailedQueueSize(0))
        ));
    }

    #[test]
    fn test_empty_password_means_none() {
        let args = parse(&["--redis-password", ""]);
        assert_eq!(AppConfig::from_args(&args).unwrap().redis.password, None);
    }

    #[test]
    fn test_normalize_log_level() {
        assert_eq!(normalize_log_level("INFO").unwrap(), "info");
        assert_eq!(normalize_log_level("WARNING").unwrap(), "warn");
        assert_eq!(normalize_log_level("critical").unwrap(), "error");
        assert_eq!(normalize_log_level("debug").unwrap(), "debug");
        assert!(matches!(
            normalize_log_level("loud"),
            Err(ConfigError::InvalidLogLevel { .. })
        ));
    }

    #[test]
    fn test_consume_requires_refresh_command() {
        let args = ConsumeArgs::default();
        assert!(matches!(args.invoker(), Err(ConfigError::MissingRequired(_))));

        let args = ConsumeArgs {
            refresh_command: Some("refresh-user --id {user_id}".into()),
            consumer_id: None,
        };
        assert_eq!(args.invoker().unwrap().program(), "refresh-user");
    }

    #[test]
    fn test_missing_subcommand_means_consume() {
        let args = parse(&["--redis-host", "cache", "--refresh-command", "refresh-user"]);
        assert!(args.command.is_none());
        assert!(matches!(args.command(), Command::Consume));
        assert_eq!(args.consume.refresh_command.as_deref(), Some("refresh-user"));
    }

    #[test]
    fn test_consume_flags_after_subcommand() {
        let args = parse(&["consume", "--consumer-id", "w1", "--refresh-command", "refresh-user"]);
        assert!(matches!(args.command(), Command::Consume));
        assert_eq!(args.consume.consumer_id.as_deref(), Some("w1"));
        assert_eq!(args.consume.invoker().unwrap().program(), "refresh-user");
    }

    #[test]
    fn test_status_format() {
        let args = parse(&["status", "--format", "json"]);
        assert!(matches!(
            args.command,
            Some(Command::Status { format: OutputFormat::Json })
        ));
    }
}
