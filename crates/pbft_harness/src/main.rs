// pbft-harness binary entry point.
//
// Three subcommands share one configuration surface: `topology` writes the
// node table, `launch` starts local node processes in a multiplexer session,
// and `batch` drives the node-count sweep and appends results.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pbft_harness::{
    BatchDriver, ClusterTag, CommandRunner, CommandSampler, ConfigArgs, ElapsedSampler,
    Launcher, ProcessRunner, Sampler, TopologyGenerator,
};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "pbft-harness")]
#[command(about = "Topology, launch and batch-trial orchestration for PBFT clusters", long_about = None)]
struct Args {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Write the node table for every cluster.
    Topology {
        nodes_per_cluster: usize,
        /// Host shared by every node in this table.
        server: String,
        #[arg(long, default_value = "nodetable.txt")]
        out: PathBuf,
    },
    /// Build the node binary and start nodes in a multiplexer session.
    ///
    /// The primary cluster is launched on its own; any other tag launches
    /// every non-primary cluster unless `--only` is given.
    Launch {
        cluster: String,
        nodes_per_cluster: usize,
        #[arg(long, default_value_t = false)]
        only: bool,
    },
    /// Run the configured node-count sweep for one exercised cluster.
    Batch {
        /// Cluster whose address is replaced with the local override.
        #[arg(required = true, value_delimiter = ',')]
        exercise: Vec<String>,
        /// Write the end-of-sweep summary as JSON.
        #[arg(long)]
        summary_out: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stderr().is_terminal();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = args.config.into_config().context("invalid configuration")?;

    match args.cmd {
        Command::Topology {
            nodes_per_cluster,
            server,
            out,
        } => {
            let generator = TopologyGenerator::new(config.clusters.clone(), config.base_port);
            let table = generator.generate(nodes_per_cluster, &server)?;
            table
                .write_atomic(&out)
                .with_context(|| format!("write {}", out.display()))?;
            tracing::info!(
                entries = table.len(),
                clusters = %config.clusters,
                out = %out.display(),
                "wrote node table"
            );
        }
        Command::Launch {
            cluster,
            nodes_per_cluster,
            only,
        } => {
            let tag: ClusterTag = cluster.parse()?;
            let launcher = Launcher::new(config, Arc::new(ProcessRunner));
            // Each node's cluster size matches the launch's per-cluster count.
            let report = launcher
                .launch_target(&tag, nodes_per_cluster, nodes_per_cluster, only)
                .await?;
            if !report.is_clean() {
                anyhow::bail!(
                    "{} node(s) failed to start, {} not reachable",
                    report.failed.len(),
                    report.unready.len()
                );
            }
        }
        Command::Batch {
            exercise,
            summary_out,
        } => {
            let exercised = exercise
                .iter()
                .map(|raw| raw.parse::<ClusterTag>())
                .collect::<Result<Vec<_>, _>>()?;
            let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
            let sampler: Arc<dyn Sampler> = match &config.batch.sample_command {
                Some(cmd) => Arc::new(CommandSampler::new(
                    cmd.clone(),
                    Arc::clone(&runner),
                    config.command_timeout,
                )),
                None => Arc::new(ElapsedSampler),
            };
            let driver = BatchDriver::new(config, runner, sampler);

            let cancel = driver.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received; stopping after the current step");
                    cancel.cancel();
                }
            });

            let summary = driver.run(&exercised).await?;
            eprint!("{summary}");
            if let Some(path) = summary_out {
                let data = serde_json::to_vec_pretty(&summary).context("serialize summary")?;
                std::fs::write(&path, data)
                    .with_context(|| format!("write {}", path.display()))?;
            }
            tracing::info!(
                succeeded = summary.succeeded_trials(),
                failed = summary.failed_trials(),
                cancelled = summary.cancelled,
                "batch finished"
            );
        }
    }

    Ok(())
}
