//! Append-only result log and trial samplers.
//!
//! The log is a plain text file made of sections:
//!
//! ```text
//! Duration time(N=10 Z=5)
//! 14.207
//! Duration time(N=16 Z=5)
//! failed: exit status 1
//! ```
//!
//! Sections are only ever appended; existing content is never rewritten.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::command::CommandSpec;
use crate::error::{HarnessError, Result};
use crate::runner::CommandRunner;

/// Prefix written in front of a failed trial's reason.
pub const FAILED_PREFIX: &str = "failed: ";

pub fn header_line(node_count: usize, cluster_count: usize) -> String {
    format!("Duration time(N={node_count} Z={cluster_count})")
}

/// Single-writer handle to the result file.
#[derive(Debug)]
pub struct ResultLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ResultLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts a new section, creating the file when it does not exist yet.
    pub async fn begin_section(&self, node_count: usize, cluster_count: usize) -> Result<()> {
        let header = header_line(node_count, cluster_count);
        let exists = tokio::fs::try_exists(&self.path).await.unwrap_or(false);
        if exists {
            tracing::info!(log = %self.path.display(), %header, "appending result section");
        } else {
            tracing::info!(log = %self.path.display(), %header, "creating result log");
        }
        self.append_line(&header).await
    }

    pub async fn append_sample(&self, sample: &str) -> Result<()> {
        self.append_line(sample).await
    }

    pub async fn append_failure(&self, reason: &str) -> Result<()> {
        let reason = reason.lines().next().unwrap_or_default();
        self.append_line(&format!("{FAILED_PREFIX}{reason}")).await
    }

    async fn append_line(&self, line: &str) -> Result<()> {
        // Whole line in a single write, serialized by the lock.
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| HarnessError::io(parent, e))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| HarnessError::io(&self.path, e))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| HarnessError::io(&self.path, e))?;
        file.flush().await.map_err(|e| HarnessError::io(&self.path, e))?;
        Ok(())
    }
}

/// What a sampler knows about the trial it is sampling.
#[derive(Debug, Clone)]
pub struct TrialContext {
    pub node_count: usize,
    pub cluster_count: usize,
    pub repeat: usize,
    /// Wall-clock time the trial command took.
    pub elapsed: Duration,
}

/// Produces the sample line recorded for a successful trial.
#[async_trait]
pub trait Sampler: Send + Sync {
    async fn sample(&self, trial: &TrialContext) -> Result<String>;
}

/// Records the trial command's elapsed time in seconds.
#[derive(Debug, Clone, Default)]
pub struct ElapsedSampler;

#[async_trait]
impl Sampler for ElapsedSampler {
    async fn sample(&self, trial: &TrialContext) -> Result<String> {
        Ok(format!("{:.3}", trial.elapsed.as_secs_f64()))
    }
}

/// Delegates sampling to an external program and records its trimmed stdout.
pub struct CommandSampler {
    command: CommandSpec,
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl CommandSampler {
    pub fn new(command: CommandSpec, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self {
            command,
            runner,
            timeout,
        }
    }
}

#[async_trait]
impl Sampler for CommandSampler {
    async fn sample(&self, trial: &TrialContext) -> Result<String> {
        let cmd = self
            .command
            .clone()
            .arg(trial.node_count.to_string())
            .arg(trial.cluster_count.to_string());
        let output = self
            .runner
            .run(&cmd, self.timeout)
            .await
            .map_err(|e| HarnessError::LaunchFailure(format!("sampler `{cmd}`: {e}")))?;
        if !output.success {
            return Err(HarnessError::LaunchFailure(format!(
                "sampler `{cmd}`: {}",
                output.status_line()
            )));
        }
        let sample = output.stdout.trim();
        if sample.is_empty() {
            return Err(HarnessError::LaunchFailure(format!(
                "sampler `{cmd}` produced no output"
            )));
        }
        Ok(sample.lines().collect::<Vec<_>>().join(" "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sections_are_appended_never_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.xls");
        std::fs::write(&path, "Duration time(N=4 Z=3)\n1.000\n").unwrap();

        let log = ResultLog::new(&path);
        log.begin_section(10, 5).await.unwrap();
        log.append_sample("2.500").await.unwrap();
        log.append_failure("exit status 1\nmore detail").await.unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "Duration time(N=4 Z=3)\n1.000\nDuration time(N=10 Z=5)\n2.500\nfailed: exit status 1\n"
        );
    }

    #[tokio::test]
    async fn creates_missing_log_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("data.xls");
        let log = ResultLog::new(&path);
        log.begin_section(16, 5).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "Duration time(N=16 Z=5)\n");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_keep_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(ResultLog::new(dir.path().join("data.xls")));

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..32 {
            let log = Arc::clone(&log);
            tasks.spawn(async move { log.append_sample(&format!("{i}.{}", "5".repeat(200))).await });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let text = std::fs::read_to_string(log.path()).unwrap();
        let lines = text.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 32);
        assert!(lines.iter().all(|l| l.parse::<f64>().is_ok() && l.len() > 200));
    }

    #[tokio::test]
    async fn elapsed_sampler_formats_seconds() {
        let trial = TrialContext {
            node_count: 10,
            cluster_count: 5,
            repeat: 0,
            elapsed: Duration::from_millis(12_345),
        };
        assert_eq!(ElapsedSampler.sample(&trial).await.unwrap(), "12.345");
    }
}
