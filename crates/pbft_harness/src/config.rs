//! Immutable harness configuration.
//!
//! Values come from CLI flags with `PBFT_*` environment fallbacks and default
//! to the constants the benchmark scripts have always used. A validated
//! [`HarnessConfig`] is handed to each component at construction.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::cluster::{ClusterSet, ClusterTag};
use crate::command::{CommandSpec, RemoteTrialBuilder};
use crate::error::{HarnessError, Result};
use crate::topology::DEFAULT_BASE_PORT;

/// Everything the launcher and driver need, fixed for one process run.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub clusters: ClusterSet,
    pub base_port: u16,
    /// Cluster that receives the inter-trial stabilization wait.
    pub primary: ClusterTag,
    /// Upper bound for any single external invocation.
    pub command_timeout: Duration,
    pub launch: LaunchConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Node binary as typed into each pane, e.g. `./app`.
    pub executable: String,
    pub build_command: CommandSpec,
    /// File the build produces; polled to detect build completion.
    pub build_artifact: PathBuf,
    /// Multiplexer program (`tmux`).
    pub multiplexer: String,
    pub session: String,
    /// Fallback bound on waiting for the build artifact to appear.
    pub build_settle_timeout: Duration,
    pub window_delay: Duration,
    pub post_launch_grace: Duration,
    /// How long to wait for launched nodes to accept TCP connections
    /// (zero skips the check).
    pub readiness_timeout: Duration,
    pub readiness_host: String,
}

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Node counts exercised, strictly ascending.
    pub sweep: Vec<usize>,
    pub cluster_count: usize,
    pub trials_per_point: usize,
    pub stabilization_wait: Duration,
    pub script: String,
    /// One address per declared cluster, in declaration order.
    pub server_ips: Vec<String>,
    pub result_log: PathBuf,
    /// External sampler whose trimmed stdout becomes the recorded sample.
    pub sample_command: Option<CommandSpec>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            clusters: ClusterSet::default(),
            base_port: DEFAULT_BASE_PORT,
            primary: ClusterTag::from_static("N"),
            command_timeout: Duration::from_secs(600),
            launch: LaunchConfig {
                executable: "./app".to_string(),
                build_command: CommandSpec::new("go").args(["build", "-o", "app"]),
                build_artifact: PathBuf::from("app"),
                multiplexer: "tmux".to_string(),
                session: "myPBFT".to_string(),
                build_settle_timeout: Duration::from_secs(1),
                window_delay: Duration::from_millis(100),
                post_launch_grace: Duration::from_secs(2),
                readiness_timeout: Duration::ZERO,
                readiness_host: "127.0.0.1".to_string(),
            },
            batch: BatchConfig {
                sweep: vec![10, 16, 22, 28, 34, 40],
                cluster_count: 5,
                trials_per_point: 1,
                stabilization_wait: Duration::from_secs(12),
                script: "./test.sh".to_string(),
                server_ips: [
                    "43.132.126.36",
                    "43.131.248.12",
                    "43.128.253.129",
                    "150.109.6.41",
                    "43.133.117.50",
                ]
                .into_iter()
                .map(String::from)
                .collect(),
                result_log: PathBuf::from("data.xls"),
                sample_command: None,
            },
        }
    }
}

impl HarnessConfig {
    /// Rejects inconsistent settings before anything is launched.
    pub fn validate(&self) -> Result<()> {
        self.clusters.require(&self.primary)?;
        if self.command_timeout.is_zero() {
            return Err(HarnessError::invalid("command timeout must be > 0"));
        }

        let launch = &self.launch;
        CommandSpec::new(&launch.executable).validate()?;
        launch.build_command.validate()?;
        CommandSpec::new(&launch.multiplexer).arg(&launch.session).validate()?;
        crate::cluster::validate_host(&launch.readiness_host)?;

        let batch = &self.batch;
        if batch.sweep.is_empty() {
            return Err(HarnessError::invalid("sweep must contain at least one node count"));
        }
        if batch.sweep.iter().any(|n| *n == 0) {
            return Err(HarnessError::invalid("sweep node counts must be > 0"));
        }
        if !batch.sweep.windows(2).all(|w| w[0] < w[1]) {
            return Err(HarnessError::invalid(format!(
                "sweep {:?} must be strictly ascending",
                batch.sweep
            )));
        }
        if batch.trials_per_point == 0 {
            return Err(HarnessError::invalid("trials per point must be > 0"));
        }
        RemoteTrialBuilder::new(
            &batch.script,
            &self.clusters,
            &batch.server_ips,
            batch.cluster_count,
        )?;
        if let Some(sampler) = &batch.sample_command {
            sampler.validate()?;
        }
        Ok(())
    }
}

/// Shared CLI flags; every flag also reads a `PBFT_*` variable.
#[derive(Args, Debug, Clone)]
pub struct ConfigArgs {
    /// Ordered cluster tags; order selects each cluster's port stride.
    #[arg(long, env = "PBFT_CLUSTERS", default_value = "N,M,P,J,K")]
    pub clusters: String,

    #[arg(long, env = "PBFT_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
    pub base_port: u16,

    /// Cluster that gets the stabilization wait after each trial.
    #[arg(long, env = "PBFT_PRIMARY", default_value = "N")]
    pub primary: String,

    /// Timeout for each external invocation (build, multiplexer, script).
    #[arg(long, env = "PBFT_COMMAND_TIMEOUT", default_value = "10m")]
    pub command_timeout: humantime::Duration,

    #[arg(long, env = "PBFT_EXECUTABLE", default_value = "./app")]
    pub executable: String,

    #[arg(long, env = "PBFT_BUILD_COMMAND", default_value = "go build -o app")]
    pub build_command: String,

    #[arg(long, env = "PBFT_BUILD_ARTIFACT", default_value = "app")]
    pub build_artifact: PathBuf,

    #[arg(long, env = "PBFT_MULTIPLEXER", default_value = "tmux")]
    pub multiplexer: String,

    #[arg(long, env = "PBFT_SESSION", default_value = "myPBFT")]
    pub session: String,

    #[arg(long, env = "PBFT_BUILD_SETTLE", default_value = "1s")]
    pub build_settle: humantime::Duration,

    #[arg(long, env = "PBFT_WINDOW_DELAY", default_value = "100ms")]
    pub window_delay: humantime::Duration,

    #[arg(long, env = "PBFT_POST_LAUNCH_GRACE", default_value = "2s")]
    pub post_launch_grace: humantime::Duration,

    /// Wait up to this long for launched nodes to accept connections (0s disables).
    #[arg(long, env = "PBFT_READINESS_TIMEOUT", default_value = "0s")]
    pub readiness_timeout: humantime::Duration,

    #[arg(long, env = "PBFT_READINESS_HOST", default_value = "127.0.0.1")]
    pub readiness_host: String,

    /// Comma-separated node counts, ascending.
    #[arg(long, env = "PBFT_SWEEP", default_value = "10,16,22,28,34,40")]
    pub sweep: String,

    #[arg(long, env = "PBFT_CLUSTER_COUNT", default_value_t = 5)]
    pub cluster_count: usize,

    #[arg(long, env = "PBFT_TRIALS_PER_POINT", default_value_t = 1)]
    pub trials_per_point: usize,

    #[arg(long, env = "PBFT_STABILIZATION_WAIT", default_value = "12s")]
    pub stabilization_wait: humantime::Duration,

    #[arg(long, env = "PBFT_SCRIPT", default_value = "./test.sh")]
    pub script: String,

    /// Comma-separated server address per cluster, in cluster order.
    #[arg(
        long,
        env = "PBFT_SERVER_IPS",
        default_value = "43.132.126.36,43.131.248.12,43.128.253.129,150.109.6.41,43.133.117.50"
    )]
    pub server_ips: String,

    #[arg(long, env = "PBFT_RESULT_LOG", default_value = "data.xls")]
    pub result_log: PathBuf,

    /// Optional sampler command; its stdout is appended as the trial sample.
    #[arg(long, env = "PBFT_SAMPLE_COMMAND")]
    pub sample_command: Option<String>,
}

impl ConfigArgs {
    pub fn into_config(self) -> Result<HarnessConfig> {
        let sweep = split_list(&self.sweep)
            .map(|raw| {
                raw.parse::<usize>()
                    .map_err(|_| HarnessError::invalid(format!("invalid sweep value {raw:?}")))
            })
            .collect::<Result<Vec<_>>>()?;
        let config = HarnessConfig {
            clusters: self.clusters.parse()?,
            base_port: self.base_port,
            primary: self.primary.parse()?,
            command_timeout: self.command_timeout.into(),
            launch: LaunchConfig {
                executable: self.executable,
                build_command: CommandSpec::from_line(&self.build_command)?,
                build_artifact: self.build_artifact,
                multiplexer: self.multiplexer,
                session: self.session,
                build_settle_timeout: self.build_settle.into(),
                window_delay: self.window_delay.into(),
                post_launch_grace: self.post_launch_grace.into(),
                readiness_timeout: self.readiness_timeout.into(),
                readiness_host: self.readiness_host,
            },
            batch: BatchConfig {
                sweep,
                cluster_count: self.cluster_count,
                trials_per_point: self.trials_per_point,
                stabilization_wait: self.stabilization_wait.into(),
                script: self.script,
                server_ips: split_list(&self.server_ips).map(String::from).collect(),
                result_log: self.result_log,
                sample_command: self
                    .sample_command
                    .as_deref()
                    .map(CommandSpec::from_line)
                    .transpose()?,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

fn split_list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    fn parse(args: &[&str]) -> Result<HarnessConfig> {
        let mut argv = vec!["pbft-harness"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap().config.into_config()
    }

    #[test]
    #[serial]
    fn defaults_match_built_in_config() {
        let parsed = parse(&[]).unwrap();
        let built_in = HarnessConfig::default();
        assert_eq!(parsed.clusters, built_in.clusters);
        assert_eq!(parsed.batch.sweep, built_in.batch.sweep);
        assert_eq!(parsed.batch.server_ips, built_in.batch.server_ips);
        assert_eq!(parsed.batch.stabilization_wait, Duration::from_secs(12));
        assert_eq!(parsed.launch.window_delay, Duration::from_millis(100));
        assert_eq!(parsed.launch.build_command, built_in.launch.build_command);
        built_in.validate().unwrap();
    }

    #[test]
    #[serial]
    fn env_overrides_sweep() {
        std::env::set_var("PBFT_SWEEP", "4, 7");
        let parsed = parse(&[]);
        std::env::remove_var("PBFT_SWEEP");
        assert_eq!(parsed.unwrap().batch.sweep, vec![4, 7]);
    }

    #[test]
    #[serial]
    fn rejects_inconsistent_settings() {
        assert!(parse(&["--sweep", "16,10"]).is_err());
        assert!(parse(&["--sweep", "0,10"]).is_err());
        assert!(parse(&["--primary", "Q"]).is_err());
        assert!(parse(&["--server-ips", "1.1.1.1,2.2.2.2"]).is_err());
        assert!(parse(&["--trials-per-point", "0"]).is_err());
        assert!(parse(&["--session", "my session"]).is_err());
    }
}
