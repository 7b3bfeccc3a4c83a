//! External batch processor invoked as a child process

use super::RefreshInvoker;
use crate::error::{ConfigError, RefreshFailure};

use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

/// Argument token replaced by the user id
pub const USER_ID_PLACEHOLDER: &str = "{user_id}";

/// Bytes of stderr kept in a failure reason
const STDERR_TAIL_BYTES: usize = 512;

/// Runs the configured batch processor command once per user
///
/// Every `{user_id}` in the arguments is substituted; when no argument
/// contains the placeholder the id is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    program: String,
    args: Vec<String>,
}

impl CommandInvoker {
    /// Parse a whitespace-separated command line
    pub fn from_command_line(command_line: &str) -> Result<Self, ConfigError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ConfigError::MissingRequired("refresh command is empty".into()))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn args_for(&self, user_id: u64) -> Vec<String> {
        let id = user_id.to_string();
        let mut substituted = false;
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| {
                if arg.contains(USER_ID_PLACEHOLDER) {
                    substituted = true;
                    arg.replace(USER_ID_PLACEHOLDER, &id)
                } else {
                    arg.clone()
                }
            })
            .collect();
        if !substituted {
            args.push(id);
        }
        args
    }
}

#[async_trait::async_trait]
impl RefreshInvoker for CommandInvoker {
    async fn refresh(&self, user_id: u64) -> Result<(), RefreshFailure> {
        let start = Instant::now();

        let output = Command::new(&self.program)
            .args(self.args_for(user_id))
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            // An aborted refresh must not outlive the consumer
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                RefreshFailure::new(user_id, format!("failed to start '{}': {}", self.program, e))
            })?;

        let elapsed = start.elapsed().as_secs_f64();
        if output.status.success() {
            tracing::info!(user_id, elapsed_secs = elapsed, "Stats refresh succeeded");
            return Ok(());
        }

        let status = match output.status.code() {
            Some(code) => format!("exited with status {}", code),
            None => "terminated by signal".to_string(),
        };
        let stderr = stderr_tail(&output.stderr);
        let reason = if stderr.is_empty() {
            status
        } else {
            format!("{}: {}", status, stderr)
        };

        tracing::error!(user_id, elapsed_secs = elapsed, reason = %reason, "Stats refresh failed");
        Err(RefreshFailure::new(user_id, reason))
    }
}

fn stderr_tail(stderr: &[u8]) -> String {
    let start = stderr.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&stderr[start..]).trim().to_string()
}
