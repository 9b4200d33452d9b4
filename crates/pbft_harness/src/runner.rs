//! Execution seam for external programs (build tool, multiplexer, scripts).

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use crate::command::CommandSpec;

/// Captured result of one external invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            code: Some(0),
            success: true,
            ..Self::default()
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            success: false,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Short human-readable exit description for logs and summaries.
    pub fn status_line(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            status
        } else {
            let last = stderr.lines().last().unwrap_or_default();
            format!("{status}: {last}")
        }
    }
}

/// Runs a command to completion within `timeout`.
///
/// Spawn failures and timeouts are returned as `Err`; a non-zero exit is an
/// `Ok` output with `success == false`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cmd: &CommandSpec, timeout: Duration) -> std::io::Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, cmd: &CommandSpec, timeout: Duration) -> std::io::Result<CommandOutput> {
        let mut command = cmd.to_tokio();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn()?;
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(res) => res?,
            Err(_) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("`{cmd}` did not finish within {}", humantime::format_duration(timeout)),
                ))
            }
        };
        let out = CommandOutput {
            code: output.status.code(),
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        for line in out.stdout.lines() {
            tracing::debug!(program = cmd.program(), "{line}");
        }
        Ok(out)
    }
}
