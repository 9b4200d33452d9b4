//! Batch trial driver.
//!
//! Walks the configured node-count sweep in ascending order. For every point
//! it appends a header to the result log, then for each repeat:
//!
//! 1. runs the per-cluster trial command on its own task and waits for it,
//! 2. sleeps the stabilization interval when the exercised cluster is the
//!    primary,
//! 3. appends one sample (or a failure marker) under the header.
//!
//! Trial failures never stop the sweep; they are recorded in the log and in
//! the returned [`SweepSummary`].

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use crate::cluster::ClusterTag;
use crate::command::{CommandSpec, RemoteTrialBuilder};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::results::{ResultLog, Sampler, TrialContext};
use crate::runner::CommandRunner;

/// One point of the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialConfig {
    pub node_count: usize,
    pub cluster_count: usize,
    pub primary: ClusterTag,
    pub wait: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Preparing { node_count: usize },
    Running { node_count: usize, repeat: usize },
    Waiting { node_count: usize, repeat: usize },
    Recording { node_count: usize, repeat: usize },
    Done,
}

/// Per-point tally.
#[derive(Debug, Clone, Serialize)]
pub struct PointSummary {
    pub node_count: usize,
    pub cluster_count: usize,
    pub succeeded: usize,
    /// One reason per failed repeat.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepSummary {
    pub exercised: String,
    pub points: Vec<PointSummary>,
    pub cancelled: bool,
}

impl SweepSummary {
    pub fn failed_trials(&self) -> usize {
        self.points.iter().map(|p| p.failures.len()).sum()
    }

    pub fn succeeded_trials(&self) -> usize {
        self.points.iter().map(|p| p.succeeded).sum()
    }
}

impl fmt::Display for SweepSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "sweep summary (exercised cluster {})", self.exercised)?;
        for point in &self.points {
            writeln!(
                f,
                "  N={:<4} Z={:<2} ok={} failed={}",
                point.node_count,
                point.cluster_count,
                point.succeeded,
                point.failures.len()
            )?;
            for reason in &point.failures {
                writeln!(f, "    - {reason}")?;
            }
        }
        if self.cancelled {
            writeln!(f, "  sweep cancelled before completion")?;
        }
        Ok(())
    }
}

pub struct BatchDriver {
    config: HarnessConfig,
    runner: Arc<dyn CommandRunner>,
    sampler: Arc<dyn Sampler>,
    log: ResultLog,
    cancel: CancellationToken,
    state: Mutex<DriverState>,
}

impl BatchDriver {
    pub fn new(
        config: HarnessConfig,
        runner: Arc<dyn CommandRunner>,
        sampler: Arc<dyn Sampler>,
    ) -> Self {
        let log = ResultLog::new(&config.batch.result_log);
        Self {
            config,
            runner,
            sampler,
            log,
            cancel: CancellationToken::new(),
            state: Mutex::new(DriverState::Idle),
        }
    }

    /// Token that stops the sweep at the next suspension point.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> DriverState {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Sweep points in execution order.
    pub fn trial_configs(&self) -> Vec<TrialConfig> {
        let batch = &self.config.batch;
        batch
            .sweep
            .iter()
            .map(|&node_count| TrialConfig {
                node_count,
                cluster_count: batch.cluster_count,
                primary: self.config.primary.clone(),
                wait: batch.stabilization_wait,
            })
            .collect()
    }

    /// Runs the whole sweep for the cluster exercised by this process.
    ///
    /// Exactly one cluster may be exercised (it is the only one whose address
    /// is replaced by the local override); anything else is rejected before
    /// a single command runs.
    pub async fn run(&self, exercised: &[ClusterTag]) -> Result<SweepSummary> {
        let exercised = match exercised {
            [one] => one.clone(),
            [] => return Err(HarnessError::invalid("no cluster selected to exercise")),
            many => {
                let tags = many.iter().map(ClusterTag::as_str).collect::<Vec<_>>();
                return Err(HarnessError::invalid(format!(
                    "only one local override per run is supported, got {}",
                    tags.join(",")
                )));
            }
        };
        self.config.validate()?;
        self.config.clusters.require(&exercised)?;

        let batch = &self.config.batch;
        let builder = RemoteTrialBuilder::new(
            &batch.script,
            &self.config.clusters,
            &batch.server_ips,
            batch.cluster_count,
        )?;
        let plan = self
            .trial_configs()
            .into_iter()
            .map(|trial| {
                let cmd = builder.build(trial.node_count, &exercised)?;
                Ok((trial, cmd))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut summary = SweepSummary {
            exercised: exercised.to_string(),
            points: Vec::with_capacity(plan.len()),
            cancelled: false,
        };

        'sweep: for (trial, cmd) in plan {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            self.transition(DriverState::Preparing {
                node_count: trial.node_count,
            });
            self.log
                .begin_section(trial.node_count, trial.cluster_count)
                .await?;

            let mut point = PointSummary {
                node_count: trial.node_count,
                cluster_count: trial.cluster_count,
                succeeded: 0,
                failures: Vec::new(),
            };
            for repeat in 0..batch.trials_per_point {
                tracing::info!(
                    node_count = trial.node_count,
                    cluster_count = trial.cluster_count,
                    trial = repeat + 1,
                    "starting trial"
                );
                self.transition(DriverState::Running {
                    node_count: trial.node_count,
                    repeat,
                });
                let started = Instant::now();
                let outcome = self.run_trial(&cmd).await;
                let elapsed = started.elapsed();
                let cancelled = matches!(outcome, Err(HarnessError::Cancelled));

                if !cancelled && exercised == trial.primary {
                    self.transition(DriverState::Waiting {
                        node_count: trial.node_count,
                        repeat,
                    });
                    tracing::info!(
                        wait = %humantime::format_duration(trial.wait),
                        "waiting for primary cluster to quiesce"
                    );
                    tokio::select! {
                        _ = time::sleep(trial.wait) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }

                self.transition(DriverState::Recording {
                    node_count: trial.node_count,
                    repeat,
                });
                let ctx = TrialContext {
                    node_count: trial.node_count,
                    cluster_count: trial.cluster_count,
                    repeat,
                    elapsed,
                };
                self.record(&ctx, outcome, &mut point).await?;

                if self.cancel.is_cancelled() {
                    summary.points.push(point);
                    summary.cancelled = true;
                    break 'sweep;
                }
            }
            tracing::info!(
                node_count = trial.node_count,
                cluster_count = trial.cluster_count,
                succeeded = point.succeeded,
                failed = point.failures.len(),
                "sweep point finished"
            );
            summary.points.push(point);
        }

        self.transition(DriverState::Done);
        Ok(summary)
    }

    /// Runs the trial command on a dedicated task and waits for it.
    async fn run_trial(&self, cmd: &CommandSpec) -> Result<()> {
        tracing::info!(command = %cmd, "executing trial command");
        let runner = Arc::clone(&self.runner);
        let task_cmd = cmd.clone();
        let timeout = self.config.command_timeout;
        let mut handle = tokio::spawn(async move { runner.run(&task_cmd, timeout).await });

        let joined = tokio::select! {
            joined = &mut handle => joined,
            _ = self.cancel.cancelled() => {
                handle.abort();
                return Err(HarnessError::Cancelled);
            }
        };
        match joined {
            Ok(Ok(output)) if output.success => Ok(()),
            Ok(Ok(output)) => {
                let status = output.status_line();
                tracing::warn!(command = %cmd, %status, "trial command failed");
                Err(HarnessError::LaunchFailure(status))
            }
            Ok(Err(err)) => {
                tracing::warn!(command = %cmd, error = %err, "trial command could not run");
                Err(HarnessError::LaunchFailure(err.to_string()))
            }
            Err(err) => Err(HarnessError::LaunchFailure(format!("trial task failed: {err}"))),
        }
    }

    /// Appends the trial's sample, or a failure marker, to the log.
    async fn record(
        &self,
        ctx: &TrialContext,
        outcome: Result<()>,
        point: &mut PointSummary,
    ) -> Result<()> {
        let sampled = match outcome {
            Ok(()) => self.sampler.sample(ctx).await,
            Err(err) => Err(err),
        };
        match sampled {
            Ok(sample) => {
                tracing::info!(node_count = ctx.node_count, %sample, "recorded sample");
                self.log.append_sample(&sample).await?;
                point.succeeded += 1;
            }
            Err(err) => {
                let reason = match err {
                    HarnessError::LaunchFailure(reason) => reason,
                    other => other.to_string(),
                };
                tracing::warn!(node_count = ctx.node_count, %reason, "recording failed trial");
                self.log.append_failure(&reason).await?;
                point.failures.push(reason);
            }
        }
        Ok(())
    }

    fn transition(&self, next: DriverState) {
        tracing::debug!(state = ?next, "driver state");
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }
}
