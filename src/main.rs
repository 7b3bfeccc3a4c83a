//! stats-refresh-consumer - Redis-backed stats refresh worker
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use stats_refresh_consumer::config::{AppConfig, CliArgs, Command, ConsumeArgs, OutputFormat};
use stats_refresh_consumer::consumer::{supervise, ShutdownSignal, StatsRefreshConsumer};
use stats_refresh_consumer::error::ConsumerError;
use stats_refresh_consumer::message::MessageCodec;
use stats_refresh_consumer::progress::{
    print_header, print_replay_summary, print_status, print_summary,
};
use stats_refresh_consumer::queue::{QueueDepths, QueueTransport, RedisQueue, STARTUP_CONNECT_ATTEMPTS};
use stats_refresh_consumer::replay::replay_failed;
use stats_refresh_consumer::retry::DEFAULT_MAX_RETRIES;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Exit status when draining outlived the grace period
const EXIT_FORCED_SHUTDOWN: u8 = 2;

/// Exit status on a second interrupt
const EXIT_INTERRUPTED: i32 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<ExitCode> {
    // Parse CLI arguments
    let args = CliArgs::parse();

    // Validate before anything touches the network
    let config = AppConfig::from_args(&args).context("Invalid configuration")?;

    setup_logging(&config.log_level);

    match args.command() {
        Command::Consume => run_consume(&config, &args.consume).await,
        Command::Status { format } => run_status(&config, format).await,
        Command::ReplayFailed { limit } => run_replay(&config, limit).await,
    }
}

async fn run_consume(config: &AppConfig, args: &ConsumeArgs) -> Result<ExitCode> {
    let invoker = args.invoker().context("Invalid configuration")?;
    let consumer_config = config.consumer_config(args.consumer_id.as_deref());

    // First signal drains, second one exits immediately
    let shutdown = ShutdownSignal::new();
    let handler_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        if !handler_signal.trigger() {
            eprintln!("\nForce shutdown!");
            std::process::exit(EXIT_INTERRUPTED);
        }
        eprintln!("\nShutting down gracefully... (press Ctrl+C again to force)");
    })
    .context("Failed to set signal handler")?;

    print_header(
        &consumer_config.consumer_id,
        &config.redis.addr(),
        &consumer_config.queues.main,
        config.graceful_shutdown_timeout,
    );

    let queue = RedisQueue::connect_with_retry(config.redis.clone(), STARTUP_CONNECT_ATTEMPTS)
        .await
        .context("Could not connect to Redis")?;

    info!(
        consumer_id = %consumer_config.consumer_id,
        command = invoker.program(),
        "Starting stats refresh consumer"
    );

    let consumer = StatsRefreshConsumer::new(queue, invoker, consumer_config, shutdown.clone());

    match supervise(consumer, shutdown, config.graceful_shutdown_timeout).await {
        Ok(stats) => {
            print_summary(&stats);
            Ok(ExitCode::SUCCESS)
        }
        Err(ConsumerError::ShutdownTimeout(e)) => {
            error!("{}", e);
            eprintln!("Error: {}", e);
            Ok(ExitCode::from(EXIT_FORCED_SHUTDOWN))
        }
        Err(e) => Err(e).context("Consumer stopped"),
    }
}

async fn run_status(config: &AppConfig, format: OutputFormat) -> Result<ExitCode> {
    let queue = RedisQueue::connect(config.redis.clone())
        .await
        .context("Could not connect to Redis")?;

    let depths = QueueDepths::read(&queue, &config.queues)
        .await
        .context("Failed to read queue lengths")?;
    print_status(&depths, &config.queues, format)?;

    queue.close().await?;
    Ok(ExitCode::SUCCESS)
}

async fn run_replay(config: &AppConfig, limit: u64) -> Result<ExitCode> {
    let queue = RedisQueue::connect(config.redis.clone())
        .await
        .context("Could not connect to Redis")?;

    let codec = MessageCodec::new(DEFAULT_MAX_RETRIES);
    let summary = replay_failed(&queue, &config.queues, &codec, limit)
        .await
        .context("Replay interrupted")?;
    print_replay_summary(&summary);

    queue.close().await?;
    Ok(ExitCode::SUCCESS)
}

/// `RUST_LOG` wins over the configured level when set
fn setup_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("stats_refresh_consumer={},warn", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
