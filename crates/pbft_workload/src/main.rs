//! Client workload for PBFT clusters.
//!
//! Sends bursts of JSON client operations to node request endpoints and
//! optionally writes a per-target report.

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use pbft_harness::topology::NodeTable;
use pbft_workload::{BurstReport, BurstTarget, Injector, InjectorConfig, Throttle};

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "pbft-workload")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

/// Top-level CLI subcommands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Send one burst to every target and report per-target outcomes.
    Run(RunArgs),
}

/// CLI options for a burst.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Target as `host:port` or `host:port=prefix`. Repeatable. Without a
    /// prefix the k-th target (1-based) uses `SendMes<k>`.
    #[arg(long = "target")]
    targets: Vec<String>,

    /// Node ID resolved through `--node-table`. Repeatable.
    #[arg(long = "node")]
    nodes: Vec<String>,

    /// Node table written by `pbft-harness topology`.
    #[arg(long, env = "PBFT_NODE_TABLE", default_value = "nodetable.txt")]
    node_table: PathBuf,

    /// Requests per target.
    #[arg(long, default_value_t = 40)]
    count: usize,

    /// Client identifier carried in every request body.
    #[arg(long, default_value = pbft_workload::DEFAULT_CLIENT_ID)]
    client_id: String,

    /// Request path on each node.
    #[arg(long, default_value = pbft_workload::DEFAULT_REQUEST_PATH)]
    path: String,

    /// Per-request timeout (connect + response).
    #[arg(long, default_value = "10s")]
    request_timeout: humantime::Duration,

    /// Pause dispatch after this many rounds (0 disables).
    #[arg(long, default_value_t = 0)]
    pause_every: usize,

    /// How long each throttle pause lasts.
    #[arg(long, default_value = "1s")]
    pause: humantime::Duration,

    /// Exit non-zero if any request failed.
    #[arg(long, default_value_t = false)]
    fail_on_error: bool,

    /// Write the JSON report to this path.
    #[arg(long)]
    out: Option<PathBuf>,
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
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

/// Run one burst and optionally write the JSON report.
async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.count > 0, "--count must be > 0");
    anyhow::ensure!(
        !args.targets.is_empty() || !args.nodes.is_empty(),
        "at least one --target or --node is required"
    );

    let targets = resolve_targets(&args)?;
    let throttle = (args.pause_every > 0).then(|| Throttle {
        every: args.pause_every,
        pause: args.pause.into(),
    });
    let injector = Injector::new(InjectorConfig {
        client_id: args.client_id.clone(),
        request_path: args.path.clone(),
        request_timeout: args.request_timeout.into(),
        throttle,
    })?;

    tracing::info!(
        targets = targets.len(),
        count = args.count,
        client_id = %args.client_id,
        "starting burst"
    );
    let report = injector.inject(&targets, args.count).await;
    tracing::info!(
        sent = report.total_sent(),
        failed = report.total_failed(),
        elapsed = ?Duration::from_millis(report.elapsed_ms),
        "burst finished"
    );

    if let Some(path) = &args.out {
        write_report(path, &report)?;
    }
    if args.fail_on_error {
        anyhow::ensure!(
            report.total_failed() == 0,
            "{} of {} requests failed",
            report.total_failed(),
            report.total_sent()
        );
    }
    Ok(())
}

fn resolve_targets(args: &RunArgs) -> anyhow::Result<Vec<BurstTarget>> {
    let mut raw = args.targets.clone();
    if !args.nodes.is_empty() {
        let table = NodeTable::load(&args.node_table)
            .with_context(|| format!("load node table {}", args.node_table.display()))?;
        for node in &args.nodes {
            let endpoint = table
                .lookup(node)
                .with_context(|| format!("node {node} not in {}", args.node_table.display()))?;
            raw.push(endpoint.to_string());
        }
    }

    raw.iter()
        .enumerate()
        .map(|(idx, spec)| {
            let spec = if spec.contains('=') {
                spec.clone()
            } else {
                format!("{spec}=SendMes{}", idx + 1)
            };
            spec.parse::<BurstTarget>()
                .with_context(|| format!("invalid target {spec:?}"))
        })
        .collect()
}

fn write_report(path: &Path, report: &BurstReport) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
