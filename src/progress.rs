//! Terminal output for the consumer CLI
//!
//! Human-facing summaries printed to stdout. Structured runtime events go
//! through `tracing` instead.

use crate::config::OutputFormat;
use crate::consumer::StatsSnapshot;
use crate::queue::{QueueDepths, QueueNames};
use crate::replay::ReplaySummary;
use console::style;
use std::time::Duration;

/// Format a number with thousands separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let bytes: Vec<_> = s.bytes().rev().collect();

    let chunks: Vec<String> = bytes
        .chunks(3)
        .map(|chunk| {
            chunk
                .iter()
                .rev()
                .map(|&b| b as char)
                .collect::<String>()
        })
        .collect();

    chunks.into_iter().rev().collect::<Vec<_>>().join(",")
}

/// Print a header when the consumer starts
pub fn print_header(consumer_id: &str, redis_addr: &str, queue: &str, grace: Duration) {
    println!();
    println!(
        "{} {}",
        style("stats-refresh-consumer").cyan().bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Consumer:").bold(), consumer_id);
    println!("  {} {}", style("Redis:").bold(), redis_addr);
    println!("  {} {}", style("Queue:").bold(), queue);
    println!("  {} {}s", style("Grace:").bold(), grace.as_secs());
    println!();
}

/// Print the final counters after the loop stops
pub fn print_summary(stats: &StatsSnapshot) {
    let secs = stats.uptime.as_secs_f64();
    let rate = if secs > 0.0 {
        stats.processed as f64 / secs
    } else {
        0.0
    };

    println!();
    println!("{}", style("Consumer Stopped").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Processed:").bold(), format_number(stats.processed));
    println!("  {} {}", style("Succeeded:").bold(), format_number(stats.succeeded));
    if stats.failed > 0 {
        println!(
            "  {} {} ({} retried, {} dead-lettered, {} malformed)",
            style("Failed:").yellow().bold(),
            format_number(stats.failed),
            format_number(stats.retried),
            format_number(stats.dead_lettered),
            format_number(stats.malformed)
        );
    } else {
        println!("  {} 0", style("Failed:").bold());
    }
    println!(
        "  {} {:.1}s ({:.2} msgs/sec)",
        style("Uptime:").bold(),
        secs,
        rate
    );
    println!();
}

/// Render queue depths in the requested format
pub fn render_status(
    depths: &QueueDepths,
    names: &QueueNames,
    format: OutputFormat,
) -> serde_json::Result<String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(depths),
        OutputFormat::Text => {
            let width = names.all().iter().map(|n| n.len()).max().unwrap_or(0);
            let line = |name: &str, len: u64| {
                format!("  {:<width$}  {:>12}", name, format_number(len), width = width)
            };
            Ok([
                line(&names.main, depths.main),
                line(&names.processing, depths.processing),
                line(&names.failed, depths.failed),
            ]
            .join("\n"))
        }
    }
}

/// Print queue depths for the `status` subcommand
pub fn print_status(
    depths: &QueueDepths,
    names: &QueueNames,
    format: OutputFormat,
) -> serde_json::Result<()> {
    let rendered = render_status(depths, names, format)?;
    if format == OutputFormat::Text {
        println!("{}", style("Queue Status").cyan().bold());
        println!("{}", style("─".repeat(50)).dim());
        if depths.failed > 0 {
            println!("{}", style(rendered).yellow());
        } else {
            println!("{}", rendered);
        }
    } else {
        println!("{}", rendered);
    }
    Ok(())
}

/// Print the result of `replay-failed`
pub fn print_replay_summary(summary: &ReplaySummary) {
    println!(
        "{} {} message(s) moved back to the main queue",
        style("Replayed:").green().bold(),
        format_number(summary.replayed)
    );
    if summary.skipped > 0 {
        println!(
            "{} {} undecodable entr(ies) left in the failed queue",
            style("Skipped:").yellow().bold(),
            format_number(summary.skipped)
        );
    }
}
