//! Local node launcher.
//!
//! Builds the node binary once, opens one multiplexer session, and starts
//! every selected node in its own window named `app-<NodeID>`. Launched
//! processes outlive the launcher and are neither tracked nor reaped.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{self, Instant};

use crate::cluster::{ClusterSet, ClusterTag, Endpoint, NodeIdentity};
use crate::command::CommandSpec;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::runner::CommandRunner;
use crate::topology::TopologyGenerator;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// File mtimes come from a coarse clock and can trail `SystemTime::now()`.
const MTIME_SLACK: Duration = Duration::from_secs(1);

/// Argument vector for one node process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: String,
    pub node: NodeIdentity,
    pub node_count: usize,
}

impl LaunchSpec {
    pub fn node_id(&self) -> String {
        self.node.node_id()
    }

    pub fn cluster(&self) -> &ClusterTag {
        &self.node.cluster
    }

    pub fn window_name(&self) -> String {
        format!("app-{}", self.node_id())
    }

    /// `<exe> <NodeID> <ClusterTag> <nodeCount>`.
    pub fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.executable)
            .arg(self.node_id())
            .arg(self.node.cluster.as_str())
            .arg(self.node_count.to_string())
    }
}

/// Which specs a launch call starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Cluster(ClusterTag),
    AllExcept(ClusterTag),
}

impl Selection {
    pub fn matches(&self, tag: &ClusterTag) -> bool {
        match self {
            Selection::Cluster(wanted) => tag == wanted,
            Selection::AllExcept(primary) => tag != primary,
        }
    }
}

/// Cartesian product of clusters and indices, in declaration then index order.
pub fn launch_specs(
    clusters: &ClusterSet,
    executable: &str,
    nodes_per_cluster: usize,
    node_count: usize,
) -> Vec<LaunchSpec> {
    clusters
        .iter()
        .flat_map(|tag| {
            (0..nodes_per_cluster).map(move |index| LaunchSpec {
                executable: executable.to_string(),
                node: NodeIdentity::new(tag.clone(), index),
                node_count,
            })
        })
        .collect()
}

pub fn select(specs: Vec<LaunchSpec>, selection: &Selection) -> Vec<LaunchSpec> {
    specs
        .into_iter()
        .filter(|spec| selection.matches(spec.cluster()))
        .collect()
}

/// Outcome of one launch call.
#[derive(Debug, Clone, Default)]
pub struct LaunchReport {
    pub session: String,
    /// Node ids whose start command was submitted.
    pub launched: Vec<String>,
    /// Node ids whose window could not be opened or started, with the reason.
    pub failed: Vec<(String, String)>,
    /// Node ids that did not accept connections before the readiness timeout.
    pub unready: Vec<String>,
}

impl LaunchReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.unready.is_empty()
    }
}

pub struct Launcher {
    config: HarnessConfig,
    runner: Arc<dyn CommandRunner>,
}

impl Launcher {
    pub fn new(config: HarnessConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// Dispatches a launch request for `tag` the way the `launch` command
    /// does: the primary (or any tag with `only`) starts just that cluster,
    /// any other declared tag starts every non-primary cluster.
    pub async fn launch_target(
        &self,
        tag: &ClusterTag,
        nodes_per_cluster: usize,
        node_count: usize,
        only: bool,
    ) -> Result<LaunchReport> {
        self.config.clusters.require(tag)?;
        if *tag == self.config.primary || only {
            self.launch_cluster(tag, nodes_per_cluster, node_count).await
        } else {
            self.launch_all_except_primary(nodes_per_cluster, node_count)
                .await
        }
    }

    /// Starts every node of `tag`.
    pub async fn launch_cluster(
        &self,
        tag: &ClusterTag,
        nodes_per_cluster: usize,
        node_count: usize,
    ) -> Result<LaunchReport> {
        self.launch(&Selection::Cluster(tag.clone()), nodes_per_cluster, node_count)
            .await
    }

    /// Starts every node of every non-primary cluster.
    pub async fn launch_all_except_primary(
        &self,
        nodes_per_cluster: usize,
        node_count: usize,
    ) -> Result<LaunchReport> {
        let primary = self.config.primary.clone();
        self.launch(&Selection::AllExcept(primary), nodes_per_cluster, node_count)
            .await
    }

    async fn launch(
        &self,
        selection: &Selection,
        nodes_per_cluster: usize,
        node_count: usize,
    ) -> Result<LaunchReport> {
        let (Selection::Cluster(tag) | Selection::AllExcept(tag)) = selection;
        self.config.clusters.require(tag)?;
        if nodes_per_cluster == 0 {
            return Err(HarnessError::invalid("nodes per cluster must be > 0"));
        }
        if node_count == 0 {
            return Err(HarnessError::invalid("node count must be > 0"));
        }
        let launch = &self.config.launch;
        let specs = select(
            launch_specs(&self.config.clusters, &launch.executable, nodes_per_cluster, node_count),
            selection,
        );
        let lines = specs
            .iter()
            .map(|spec| spec.command().shell_line())
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(?selection, nodes = specs.len(), "starting launch");
        self.build().await?;

        let session = launch.session.clone();
        let new_session = CommandSpec::new(&launch.multiplexer)
            .args(["new-session", "-d", "-s", session.as_str()]);
        self.run_checked(&new_session).await?;

        let mut report = LaunchReport {
            session: session.clone(),
            ..LaunchReport::default()
        };
        for (k, (spec, line)) in specs.iter().zip(lines).enumerate() {
            let target = format!("{session}:{}", k + 1);
            let node_id = spec.node_id();
            let new_window = CommandSpec::new(&launch.multiplexer)
                .args(["new-window", "-t", target.as_str(), "-n"])
                .arg(spec.window_name());
            if let Err(err) = self.run_checked(&new_window).await {
                tracing::warn!(node = %node_id, error = %err, "window creation failed");
                report.failed.push((node_id, err.to_string()));
                continue;
            }
            time::sleep(launch.window_delay).await;

            tracing::info!(node = %node_id, window = %target, command = %line, "starting node");
            let send_keys = CommandSpec::new(&launch.multiplexer)
                .args(["send-keys", "-t", target.as_str()])
                .arg(line)
                .arg("C-m");
            match self.run_checked(&send_keys).await {
                Ok(()) => report.launched.push(node_id),
                Err(err) => {
                    tracing::warn!(node = %node_id, error = %err, "start command not delivered");
                    report.failed.push((node_id, err.to_string()));
                }
            }
        }

        time::sleep(launch.post_launch_grace).await;

        if !launch.readiness_timeout.is_zero() {
            let started = specs
                .iter()
                .filter(|spec| report.launched.contains(&spec.node_id()))
                .collect::<Vec<_>>();
            report.unready = self.await_ready(&started, nodes_per_cluster).await?;
        }

        tracing::info!(
            launched = report.launched.len(),
            failed = report.failed.len(),
            unready = report.unready.len(),
            "launch finished"
        );
        Ok(report)
    }

    /// Runs the build once and waits for a fresh artifact.
    async fn build(&self) -> Result<()> {
        let launch = &self.config.launch;
        let started = SystemTime::now();
        tracing::info!(command = %launch.build_command, "building node binary");
        let output = self
            .runner
            .run(&launch.build_command, self.config.command_timeout)
            .await
            .map_err(|e| HarnessError::BuildFailure(format!("`{}`: {e}", launch.build_command)))?;
        if !output.success {
            return Err(HarnessError::BuildFailure(format!(
                "`{}`: {}",
                launch.build_command,
                output.status_line()
            )));
        }
        wait_for_artifact(&launch.build_artifact, started, launch.build_settle_timeout).await
    }

    async fn run_checked(&self, cmd: &CommandSpec) -> Result<()> {
        tracing::debug!(command = %cmd, "exec");
        let output = self
            .runner
            .run(cmd, self.config.command_timeout)
            .await
            .map_err(|e| HarnessError::LaunchFailure(format!("`{cmd}`: {e}")))?;
        if !output.success {
            return Err(HarnessError::LaunchFailure(format!(
                "`{cmd}`: {}",
                output.status_line()
            )));
        }
        Ok(())
    }

    /// Polls each node's table port until it accepts a connection.
    async fn await_ready(
        &self,
        specs: &[&LaunchSpec],
        nodes_per_cluster: usize,
    ) -> Result<Vec<String>> {
        let generator = TopologyGenerator::new(self.config.clusters.clone(), self.config.base_port);
        let launch = &self.config.launch;
        let deadline = Instant::now() + launch.readiness_timeout;

        let mut probes = JoinSet::new();
        for spec in specs {
            let port = generator.port(spec.cluster(), spec.node.index, nodes_per_cluster)?;
            let addr = Endpoint::new(launch.readiness_host.as_str(), port)?.to_string();
            let node_id = spec.node_id();
            probes.spawn(async move {
                loop {
                    if TcpStream::connect(addr.as_str()).await.is_ok() {
                        return (node_id, true);
                    }
                    if Instant::now() >= deadline {
                        return (node_id, false);
                    }
                    time::sleep(POLL_INTERVAL).await;
                }
            });
        }

        let mut unready = Vec::new();
        while let Some(joined) = probes.join_next().await {
            match joined {
                Ok((_, true)) => {}
                Ok((node_id, false)) => {
                    tracing::warn!(node = %node_id, "node did not become reachable in time");
                    unready.push(node_id);
                }
                Err(err) => tracing::warn!(error = %err, "readiness probe panicked"),
            }
        }
        unready.sort();
        Ok(unready)
    }
}

/// Waits until `path` exists with an mtime no older than `since`.
///
/// A stale artifact after the timeout is accepted with a warning; a missing
/// one is a build failure.
async fn wait_for_artifact(path: &Path, since: SystemTime, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    let since = since.checked_sub(MTIME_SLACK).unwrap_or(since);
    loop {
        let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        match modified {
            Some(mtime) if mtime >= since => return Ok(()),
            Some(_) if Instant::now() >= deadline => {
                tracing::warn!(
                    artifact = %path.display(),
                    "build artifact was not refreshed; launching the existing binary"
                );
                return Ok(());
            }
            None if Instant::now() >= deadline => {
                return Err(HarnessError::BuildFailure(format!(
                    "artifact {} not found after {}",
                    path.display(),
                    humantime::format_duration(timeout)
                )));
            }
            _ => time::sleep(POLL_INTERVAL).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> ClusterTag {
        s.parse().unwrap()
    }

    #[test]
    fn single_cluster_selection() {
        let specs = select(
            launch_specs(&ClusterSet::default(), "./app", 4, 4),
            &Selection::Cluster(tag("M")),
        );
        assert_eq!(specs.len(), 4);
        assert!(specs.iter().all(|s| s.cluster() == &tag("M")));
        let ids = specs.iter().map(LaunchSpec::node_id).collect::<Vec<_>>();
        assert_eq!(ids, ["M0", "M1", "M2", "M3"]);
    }

    #[test]
    fn all_except_primary_selection() {
        let clusters = ClusterSet::default();
        let specs = select(
            launch_specs(&clusters, "./app", 3, 3),
            &Selection::AllExcept(tag("N")),
        );
        assert_eq!(specs.len(), (clusters.len() - 1) * 3);
        assert!(specs.iter().all(|s| s.cluster() != &tag("N")));
        assert_eq!(specs.first().unwrap().node_id(), "M0");
        assert_eq!(specs.last().unwrap().node_id(), "K2");
    }

    #[test]
    fn spec_command_and_window() {
        let spec = LaunchSpec {
            executable: "./app".into(),
            node: NodeIdentity::new(tag("P"), 7),
            node_count: 19,
        };
        assert_eq!(spec.window_name(), "app-P7");
        assert_eq!(spec.command().to_string(), "./app P7 P 19");
    }

    #[tokio::test]
    async fn missing_artifact_is_build_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = wait_for_artifact(
            &dir.path().join("app"),
            SystemTime::now(),
            Duration::from_millis(120),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, HarnessError::BuildFailure(_)));
    }

    #[tokio::test]
    async fn stale_artifact_is_accepted_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app");
        std::fs::write(&path, b"old").unwrap();
        let future = SystemTime::now() + Duration::from_secs(3600);
        wait_for_artifact(&path, future, Duration::from_millis(120))
            .await
            .unwrap();
    }
}
