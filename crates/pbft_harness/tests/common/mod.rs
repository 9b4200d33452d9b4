//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use pbft_harness::command::CommandSpec;
use pbft_harness::{CommandOutput, CommandRunner, HarnessConfig};
use tokio::time::Instant;

/// One invocation seen by [`RecordingRunner`].
#[derive(Debug, Clone)]
pub struct Invocation {
    pub line: String,
    pub at: Instant,
}

/// Canned behaviour for commands whose line contains `pattern`.
struct Rule {
    pattern: String,
    output: Result<CommandOutput, std::io::ErrorKind>,
}

/// Fake runner that records every command instead of spawning it.
///
/// Commands succeed unless a rule matches. When `artifact` is set, the build
/// command touches that file so the launcher's artifact poll completes.
#[derive(Default)]
pub struct RecordingRunner {
    calls: Mutex<Vec<Invocation>>,
    rules: Mutex<Vec<Rule>>,
    artifact: Option<(String, PathBuf)>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Touch `path` whenever a command containing `build_pattern` runs.
    pub fn with_artifact(mut self, build_pattern: &str, path: PathBuf) -> Self {
        self.artifact = Some((build_pattern.to_string(), path));
        self
    }

    pub fn respond(self, pattern: &str, output: CommandOutput) -> Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            output: Ok(output),
        });
        self
    }

    pub fn fail_to_spawn(self, pattern: &str, kind: std::io::ErrorKind) -> Self {
        self.rules.lock().unwrap().push(Rule {
            pattern: pattern.to_string(),
            output: Err(kind),
        });
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.line).collect()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &CommandSpec, _timeout: Duration) -> std::io::Result<CommandOutput> {
        let line = cmd.to_string();
        self.calls.lock().unwrap().push(Invocation {
            line: line.clone(),
            at: Instant::now(),
        });
        if let Some((pattern, path)) = &self.artifact {
            if line.contains(pattern.as_str()) {
                std::fs::write(path, b"binary")?;
            }
        }
        let rules = self.rules.lock().unwrap();
        match rules.iter().find(|rule| line.contains(rule.pattern.as_str())) {
            Some(Rule { output: Ok(out), .. }) => Ok(out.clone()),
            Some(Rule { output: Err(kind), .. }) => {
                Err(std::io::Error::new(*kind, format!("cannot run {line}")))
            }
            None => Ok(CommandOutput::ok()),
        }
    }
}

/// Default config with every timing knob shrunk for tests.
pub fn fast_config(dir: &std::path::Path) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.launch.build_artifact = dir.join("app");
    config.launch.build_settle_timeout = Duration::from_millis(200);
    config.launch.window_delay = Duration::from_millis(1);
    config.launch.post_launch_grace = Duration::ZERO;
    config.batch.result_log = dir.join("data.xls");
    config.command_timeout = Duration::from_secs(5);
    config
}
